//! Coarse topology of a forest: root trees glued along their faces.
//!
//! - [`connectivity`]: the validated, immutable [`Connectivity`] tables
//! - [`builders`]: named fixtures and [`build_connectivity`]

pub mod builders;
pub mod connectivity;

pub use builders::build_connectivity;
pub use connectivity::{
    Connectivity, FaceLink, OctConnectivity, QuadConnectivity, TopologyDescription,
};
