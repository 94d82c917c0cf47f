//! Caller-facing entry points.
//!
//! Thin wrappers over [`crate::topology`], [`crate::forest`] and [`crate::io`]
//! for drivers that only need to build, save, load and compare. Functions taking
//! a communicator are collective: every rank must call them in the same order.

use crate::algs::communicator::Communicator;
use crate::forest::Forest;
use crate::forest_error::ForestError;
use crate::io::checkpoint;
use crate::topology::builders;
use crate::topology::connectivity::Connectivity;
use std::path::Path;
use std::sync::Arc;

/// Build a named connectivity (see [`builders::build_connectivity`]).
pub fn build_connectivity<const D: usize>(name: &str) -> Result<Arc<Connectivity<D>>, ForestError> {
    builders::build_connectivity(name).map(Arc::new)
}

/// Uniform forest at `min_level`, evenly split over the ranks. Collective.
pub fn new_forest<C: Communicator, const D: usize>(
    comm: &C,
    connectivity: &Arc<Connectivity<D>>,
    min_level: u8,
) -> Result<Forest<D>, ForestError> {
    Forest::new(comm, Arc::clone(connectivity), min_level, true)
}

pub fn save_connectivity<const D: usize>(
    path: impl AsRef<Path>,
    connectivity: &Connectivity<D>,
) -> Result<(), ForestError> {
    checkpoint::save_connectivity(path, connectivity)
}

pub fn load_connectivity<const D: usize>(
    path: impl AsRef<Path>,
) -> Result<Arc<Connectivity<D>>, ForestError> {
    checkpoint::load_connectivity(path).map(Arc::new)
}

/// Save `forest` to `path`. Collective.
pub fn save_forest<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
    forest: &Forest<D>,
) -> Result<(), ForestError> {
    checkpoint::save_forest(comm, path, forest)
}

/// Load a forest and the connectivity stored with it. Collective; works for
/// any rank count.
pub fn load_forest<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
) -> Result<(Arc<Connectivity<D>>, Forest<D>), ForestError> {
    let forest = checkpoint::load_forest(comm, path)?;
    Ok((Arc::clone(forest.connectivity()), forest))
}

pub fn connectivity_equal<const D: usize>(a: &Connectivity<D>, b: &Connectivity<D>) -> bool {
    a.is_equal(b)
}

/// Lockstep forest equality; see [`Forest::is_equal`]. Collective.
pub fn forest_equal<C: Communicator, const D: usize>(
    comm: &C,
    a: &Forest<D>,
    b: &Forest<D>,
) -> Result<bool, ForestError> {
    a.is_equal(b, comm)
}

pub fn destroy_forest<const D: usize>(forest: Forest<D>) {
    forest.destroy();
}

/// Drop one handle to a connectivity; it is freed with its last forest.
pub fn destroy_connectivity<const D: usize>(connectivity: Arc<Connectivity<D>>) {
    log::trace!(
        "releasing connectivity handle ({} remaining)",
        Arc::strong_count(&connectivity) - 1
    );
}
