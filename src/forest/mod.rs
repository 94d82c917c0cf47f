//! Distributed forest of quadtrees/octrees.
//!
//! Each rank owns a contiguous slice of the global quadrant sequence, which is
//! sorted by tree and Morton position. The ownership table
//! (`global_first_quadrant`) and the partition markers are replicated on every
//! rank and refreshed by [`Forest::synchronize`].
//!
//! The forest never stores a communicator; collective methods take one by
//! reference and require it to have the rank count the forest was built for.

pub mod quadrant;

use crate::algs::collective::{self, tags};
use crate::algs::communicator::Communicator;
use crate::algs::partition::{balanced_counts, counts_to_offsets};
use crate::algs::wire::{WireQuadrant, cast_slice, decode_quadrants, decode_u64s, encode_u64s};
use crate::forest_error::ForestError;
use crate::topology::connectivity::Connectivity;
pub use quadrant::{Quadrant, Quadrant2, Quadrant3};
use std::sync::Arc;

/// First finest-level position owned by a rank.
///
/// Ranks without quadrants repeat the marker of the next rank; the list ends
/// with the sentinel `(num_trees, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionMarker {
    pub tree: u32,
    pub position: u64,
}

/// Distributed quadtree (`D = 2`) or octree (`D = 3`) forest.
#[derive(Debug, Clone)]
pub struct Forest<const D: usize> {
    connectivity: Arc<Connectivity<D>>,
    rank: usize,
    size: usize,
    local: Vec<Quadrant<D>>,
    global_first_quadrant: Vec<u64>,
    markers: Vec<PartitionMarker>,
    synchronized: bool,
}

/// A quadtree forest (`D = 2`).
pub type QuadForest = Forest<2>;
/// An octree forest (`D = 3`).
pub type OctForest = Forest<3>;

impl<const D: usize> Forest<D> {
    /// Create a forest over `connectivity`.
    ///
    /// With `fill_uniform` every tree is refined uniformly to `min_level` and
    /// each rank keeps its balanced slice of the global sequence; no data is
    /// exchanged since every rank can compute its slice directly. Otherwise the
    /// forest starts empty on every rank.
    pub fn new<C: Communicator>(
        comm: &C,
        connectivity: Arc<Connectivity<D>>,
        min_level: u8,
        fill_uniform: bool,
    ) -> Result<Self, ForestError> {
        if min_level > Quadrant::<D>::MAX_LEVEL {
            return Err(ForestError::AtMaxRefinement { level: min_level });
        }
        let (rank, size) = (comm.rank(), comm.size());
        let num_trees = connectivity.num_trees();
        let mut forest = Self {
            connectivity,
            rank,
            size,
            local: Vec::new(),
            global_first_quadrant: vec![0; size + 1],
            markers: vec![PartitionMarker::sentinel(num_trees); size + 1],
            synchronized: true,
        };
        if !fill_uniform {
            return Ok(forest);
        }

        let per_tree = 1u64 << (D as u32 * u32::from(min_level));
        let global = per_tree.checked_mul(u64::from(num_trees)).ok_or_else(|| {
            ForestError::InvalidForest(format!(
                "{num_trees} trees at level {min_level} overflow the global count"
            ))
        })?;
        let offsets = counts_to_offsets(&balanced_counts(global, size));
        let nth = |i: u64| {
            Quadrant::<D>::from_linear_id((i / per_tree) as u32, min_level, i % per_tree)
        };
        forest.local = (offsets[rank]..offsets[rank + 1])
            .map(nth)
            .collect::<Result<_, _>>()?;
        let firsts = (0..size)
            .map(|r| {
                if offsets[r] < offsets[r + 1] {
                    nth(offsets[r]).map(|q| Some(PartitionMarker::of(&q)))
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        forest.markers = build_markers(&firsts, num_trees);
        forest.global_first_quadrant = offsets;
        log::debug!(
            "rank {rank}: uniform forest at level {min_level}, {} of {global} quadrants",
            forest.local.len()
        );
        Ok(forest)
    }

    /// Assemble a forest from quadrants this rank already owns, then synchronize.
    ///
    /// The caller guarantees that the per-rank slices concatenate to a sorted
    /// sequence; [`Forest::is_valid`] checks it.
    pub fn from_local<C: Communicator>(
        comm: &C,
        connectivity: Arc<Connectivity<D>>,
        local: Vec<Quadrant<D>>,
    ) -> Result<Self, ForestError> {
        let num_trees = connectivity.num_trees();
        let mut forest = Self {
            connectivity,
            rank: comm.rank(),
            size: comm.size(),
            local,
            global_first_quadrant: vec![0; comm.size() + 1],
            markers: vec![PartitionMarker::sentinel(num_trees); comm.size() + 1],
            synchronized: false,
        };
        forest.synchronize(comm)?;
        Ok(forest)
    }

    pub fn connectivity(&self) -> &Arc<Connectivity<D>> {
        &self.connectivity
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Rank count the forest is distributed over.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn local_quadrants(&self) -> &[Quadrant<D>] {
        &self.local
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Global quadrant count as of the last synchronization.
    pub fn global_count(&self) -> u64 {
        self.global_first_quadrant[self.size]
    }

    /// Prefix sums of per-rank counts, `size + 1` entries.
    pub fn global_first_quadrant(&self) -> &[u64] {
        &self.global_first_quadrant
    }

    pub fn partition_markers(&self) -> &[PartitionMarker] {
        &self.markers
    }

    /// False after a local refine/coarsen until the next [`Forest::synchronize`].
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Fail with `RankCountMismatch` unless `comm` matches this forest.
    pub fn check_comm<C: Communicator>(&self, comm: &C) -> Result<(), ForestError> {
        if comm.size() != self.size || comm.rank() != self.rank {
            return Err(ForestError::RankCountMismatch {
                expected: self.size,
                got: comm.size(),
            });
        }
        Ok(())
    }

    /// Refine every local quadrant for which `pred` holds by one level.
    ///
    /// Quadrants at `MAX_LEVEL` are left alone. Returns the number refined.
    pub fn refine<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&Quadrant<D>) -> bool,
    {
        let mut refined = 0;
        let mut out = Vec::with_capacity(self.local.len());
        for q in self.local.drain(..) {
            if q.level < Quadrant::<D>::MAX_LEVEL && pred(&q) {
                out.extend((0..Quadrant::<D>::CHILDREN).filter_map(|id| q.child(id).ok()));
                refined += 1;
            } else {
                out.push(q);
            }
        }
        self.local = out;
        self.mark_dirty(refined);
        refined
    }

    /// Refine recursively: children created here are offered to `pred` again,
    /// down to `max_level`. Returns the number of quadrants refined.
    pub fn refine_recursive<F>(&mut self, max_level: u8, mut pred: F) -> usize
    where
        F: FnMut(&Quadrant<D>) -> bool,
    {
        let max_level = max_level.min(Quadrant::<D>::MAX_LEVEL);
        let mut refined = 0;
        let mut out = Vec::with_capacity(self.local.len());
        let mut stack = Vec::new();
        for q in self.local.drain(..) {
            stack.push(q);
            while let Some(q) = stack.pop() {
                if q.level < max_level && pred(&q) {
                    stack.extend(
                        (0..Quadrant::<D>::CHILDREN)
                            .rev()
                            .filter_map(|id| q.child(id).ok()),
                    );
                    refined += 1;
                } else {
                    out.push(q);
                }
            }
        }
        self.local = out;
        self.mark_dirty(refined);
        refined
    }

    /// Replace each complete local family accepted by `pred` with its parent.
    ///
    /// Families split across ranks are never merged. Returns the number of
    /// families merged.
    pub fn coarsen<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&[Quadrant<D>]) -> bool,
    {
        let c = Quadrant::<D>::CHILDREN;
        let mut merged = 0;
        let mut out = Vec::with_capacity(self.local.len());
        let mut i = 0;
        while i < self.local.len() {
            let family = &self.local[i..(i + c).min(self.local.len())];
            if Quadrant::is_family(family) && pred(family) {
                if let Ok(parent) = family[0].parent() {
                    out.push(parent);
                    merged += 1;
                    i += c;
                    continue;
                }
            }
            out.push(self.local[i]);
            i += 1;
        }
        self.local = out;
        self.mark_dirty(merged);
        merged
    }

    /// Like [`Forest::coarsen`], but parents formed here may merge again.
    pub fn coarsen_recursive<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&[Quadrant<D>]) -> bool,
    {
        let c = Quadrant::<D>::CHILDREN;
        let mut merged = 0;
        let mut out: Vec<Quadrant<D>> = Vec::with_capacity(self.local.len());
        for q in self.local.drain(..) {
            out.push(q);
            while out.len() >= c {
                let tail = &out[out.len() - c..];
                if !(Quadrant::is_family(tail) && pred(tail)) {
                    break;
                }
                let Ok(parent) = tail[0].parent() else { break };
                out.truncate(out.len() - c);
                out.push(parent);
                merged += 1;
            }
        }
        self.local = out;
        self.mark_dirty(merged);
        merged
    }

    fn mark_dirty(&mut self, changed: usize) {
        if changed > 0 {
            self.synchronized = false;
            crate::debug_invariants!(self.check_local(), "forest after refine/coarsen");
        }
    }

    /// Collective size exchange: recompute `global_first_quadrant` and the
    /// partition markers from the current local quadrants.
    pub fn synchronize<C: Communicator>(&mut self, comm: &C) -> Result<(), ForestError> {
        self.check_comm(comm)?;
        let first = self.local.first();
        let summary = encode_u64s(&[
            self.local.len() as u64,
            u64::from(first.is_some()),
            first.map_or(0, |q| u64::from(q.tree)),
            first.map_or(0, Quadrant::position),
        ]);
        let all = collective::all_gather_bytes(comm, tags::SIZES, &summary)?;
        let mut counts = Vec::with_capacity(self.size);
        let mut firsts = Vec::with_capacity(self.size);
        for (peer, bytes) in all.iter().enumerate() {
            let words = decode_u64s(bytes)?;
            let &[count, has, tree, position] = words.as_slice() else {
                return Err(ForestError::CommError {
                    neighbor: peer,
                    reason: format!("expected 4 summary words, got {}", words.len()),
                });
            };
            counts.push(count);
            firsts.push((has != 0).then_some(PartitionMarker {
                tree: tree as u32,
                position,
            }));
        }
        self.global_first_quadrant = counts_to_offsets(&counts);
        self.markers = build_markers(&firsts, self.connectivity.num_trees());
        self.synchronized = true;
        log::trace!(
            "rank {}: synchronized, {} quadrants globally",
            self.rank,
            self.global_count()
        );
        Ok(())
    }

    /// Rank owning the finest-level `position` of `tree`, from the markers.
    pub fn owner_of_position(&self, tree: u32, position: u64) -> Option<usize> {
        if tree >= self.connectivity.num_trees() || self.global_count() == 0 {
            return None;
        }
        let key = PartitionMarker { tree, position };
        let upper = self.markers.partition_point(|m| *m <= key);
        if upper == 0 || upper > self.size {
            None
        } else {
            Some(upper - 1)
        }
    }

    /// Replace the local quadrants and ownership table after a partition.
    pub(crate) fn install(&mut self, local: Vec<Quadrant<D>>, offsets: Vec<u64>) {
        debug_assert_eq!(offsets.len(), self.size + 1);
        self.local = local;
        self.global_first_quadrant = offsets;
        self.synchronized = false;
        crate::debug_invariants!(self.check_local(), "forest after partition");
    }

    /// Local structural checks: valid quadrants in known trees, strictly
    /// increasing and non-overlapping, count matching the ownership table.
    pub fn check_local(&self) -> Result<(), ForestError> {
        let num_trees = self.connectivity.num_trees();
        if let Some(q) = self
            .local
            .iter()
            .find(|q| !q.is_valid() || q.tree >= num_trees)
        {
            return Err(ForestError::InvalidQuadrant(format!(
                "rank {}: {q:?} is not a valid quadrant of {num_trees} trees",
                self.rank
            )));
        }
        let out_of_order = |w: &[Quadrant<D>]| w[0] >= w[1] || w[0].is_ancestor(&w[1]);
        #[cfg(feature = "rayon")]
        let bad = {
            use rayon::prelude::*;
            self.local.par_windows(2).find_first(|w| out_of_order(w))
        };
        #[cfg(not(feature = "rayon"))]
        let bad = self.local.windows(2).find(|w| out_of_order(w));
        if let Some(w) = bad {
            return Err(ForestError::InvalidForest(format!(
                "rank {}: {:?} does not precede {:?}",
                self.rank, w[0], w[1]
            )));
        }
        if self.synchronized {
            let gfq = &self.global_first_quadrant;
            let owned = gfq[self.rank + 1] - gfq[self.rank];
            if owned != self.local.len() as u64 {
                return Err(ForestError::InvalidForest(format!(
                    "rank {} holds {} quadrants but owns {owned}",
                    self.rank,
                    self.local.len()
                )));
            }
        }
        Ok(())
    }

    /// Collective validity check of the whole distributed sequence.
    ///
    /// Every rank gets the same answer. Problems are logged at warn level.
    pub fn is_valid<C: Communicator>(&self, comm: &C) -> Result<bool, ForestError> {
        self.check_comm(comm)?;
        let local_ok = match self.check_local() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e}");
                false
            }
        };

        let ends = match (self.local.first(), self.local.last()) {
            (Some(first), Some(last)) => [WireQuadrant::of(first), WireQuadrant::of(last)].to_vec(),
            _ => Vec::new(),
        };
        let all = collective::all_gather_bytes(comm, tags::SIZES, cast_slice(&ends))?;
        let mut prev_last: Option<Quadrant<D>> = None;
        let mut seam_ok = true;
        for (peer, bytes) in all.iter().enumerate() {
            let ends = decode_quadrants::<D>(bytes)?;
            let (Some(first), Some(last)) = (ends.first(), ends.last()) else {
                continue;
            };
            if let Some(prev) = prev_last {
                if prev >= *first || prev.is_ancestor(first) {
                    if peer == self.rank {
                        log::warn!(
                            "rank {peer}: first quadrant {first:?} does not follow {prev:?}"
                        );
                    }
                    seam_ok = false;
                }
            }
            prev_last = Some(*last);
        }
        collective::all_reduce_and(comm, tags::SIZES, local_ok && seam_ok)
    }

    /// Lockstep equality: same connectivity, same global count, and the same
    /// local sequence on every rank. Both forests must share the rank count.
    pub fn is_equal<C: Communicator>(&self, other: &Self, comm: &C) -> Result<bool, ForestError> {
        if self.size != other.size {
            return Err(ForestError::RankCountMismatch {
                expected: self.size,
                got: other.size,
            });
        }
        self.check_comm(comm)?;
        let mine = encode_u64s(&[self.local.len() as u64, other.local.len() as u64]);
        let counts = collective::all_gather_bytes(comm, tags::SIZES, &mine)?
            .iter()
            .map(|b| decode_u64s(b))
            .collect::<Result<Vec<_>, _>>()?;
        let totals = counts.iter().fold((0u64, 0u64), |acc, c| {
            (acc.0 + c.first().copied().unwrap_or(0), acc.1 + c.get(1).copied().unwrap_or(0))
        });
        let same = self.connectivity.is_equal(&other.connectivity)
            && totals.0 == totals.1
            && self.local == other.local;
        collective::all_reduce_and(comm, tags::SIZES, same)
    }

    /// True if both forests hold the same global quadrant sequence, however
    /// each is partitioned. `other` is left untouched.
    pub fn same_global_sequence<C: Communicator>(
        &self,
        other: &Self,
        comm: &C,
    ) -> Result<bool, ForestError> {
        self.check_comm(comm)?;
        other.check_comm(comm)?;
        if !self.connectivity.is_equal(&other.connectivity) {
            return Ok(false);
        }
        let counts = collective::all_gather_u64(comm, tags::SIZES, self.local.len() as u64)?;
        let mut aligned = other.clone();
        aligned.synchronize(comm)?;
        if aligned.global_count() != counts.iter().sum::<u64>() {
            return Ok(false);
        }
        crate::algs::partition::partition(&mut aligned, comm, Some(&counts))?;
        collective::all_reduce_and(comm, tags::SIZES, aligned.local == self.local)
    }

    /// Release the forest. The connectivity stays alive while other handles exist.
    pub fn destroy(self) {
        log::debug!(
            "rank {}: releasing forest with {} local quadrants",
            self.rank,
            self.local.len()
        );
    }
}

impl PartitionMarker {
    pub fn of<const D: usize>(q: &Quadrant<D>) -> Self {
        Self {
            tree: q.tree,
            position: q.position(),
        }
    }

    pub fn sentinel(num_trees: u32) -> Self {
        Self {
            tree: num_trees,
            position: 0,
        }
    }
}

/// Markers from each rank's first quadrant (`None` for empty ranks).
fn build_markers(firsts: &[Option<PartitionMarker>], num_trees: u32) -> Vec<PartitionMarker> {
    let mut markers = vec![PartitionMarker::sentinel(num_trees); firsts.len() + 1];
    for r in (0..firsts.len()).rev() {
        markers[r] = firsts[r].unwrap_or(markers[r + 1]);
    }
    markers
}
