#![cfg_attr(docsrs, feature(doc_cfg))]
//! # quadforest
//!
//! Distributed forests of quadtrees (`D = 2`) and octrees (`D = 3`): the coarse
//! [`Connectivity`](topology::Connectivity) gluing root trees together, a
//! Morton-ordered [`Forest`](forest::Forest) partitioned across ranks, and a
//! checkpoint format that round-trips between different rank counts.
//!
//! ## Features
//! - Const-generic Morton codec with ancestry, families and total order
//! - Uniform construction, refine and coarsen, balanced or weighted partitioning
//! - Local, partition-wide and combined top-down search
//! - Collective save/load with agreed error verdicts on every rank
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Collectives
//!
//! Every function that takes a [`Communicator`](algs::communicator::Communicator)
//! is a synchronization point. All ranks must call the same collectives in the
//! same order; the crate cannot detect a mismatch and the run deadlocks.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! quadforest = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```

pub mod algs;
pub mod api;
pub mod debug_invariants;
pub mod forest;
pub mod forest_error;
pub mod io;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use forest_error::ForestError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm, Wait};
    pub use crate::algs::partition::{partition, partition_weighted};
    pub use crate::algs::search::{search_all, search_local, search_partition};
    pub use crate::forest::{Forest, OctForest, Quadrant, Quadrant2, Quadrant3, QuadForest};
    pub use crate::forest_error::ForestError;
    pub use crate::io::{LoadOptions, WritePolicy};
    pub use crate::topology::{
        Connectivity, OctConnectivity, QuadConnectivity, TopologyDescription, build_connectivity,
    };
}
