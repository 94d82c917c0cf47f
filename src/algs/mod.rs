//! Re-export public algorithms.

pub mod collective;
pub mod communicator;
pub mod partition;
pub mod search;
pub mod wire;

pub use partition::{partition, partition_weighted};
