//! Checkpoint I/O for connectivities and forests.
//!
//! [`format`] holds the byte layout; [`checkpoint`] drives the collective
//! save/load protocol on top of it.

pub mod checkpoint;
pub mod format;

pub use checkpoint::{
    LoadOptions, WritePolicy, load_connectivity, load_forest, load_forest_ext, save_connectivity,
    save_forest, save_forest_with,
};
