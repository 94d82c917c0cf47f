//! ForestError: unified error type for quadforest public APIs
//!
//! Every fallible operation in the crate returns this type. It is `Clone` and
//! serde-serializable so that a failure detected on one rank can be broadcast
//! verbatim to every other rank of a collective step.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for connectivity, forest, partition and checkpoint operations.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForestError {
    /// A face adjacency is not mutually consistent, an index is out of range,
    /// or a named topology is unknown.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    /// A quadrant cannot be refined (or has no parent) at this level.
    #[error("Quadrant at level {level} cannot move further in the refinement hierarchy")]
    AtMaxRefinement { level: u8 },
    /// Caller supplied partition counts do not match the forest.
    #[error("Partition size mismatch: expected {expected}, got {got}")]
    PartitionSizeMismatch { expected: u64, got: u64 },
    /// Two objects (or an object and a communicator) disagree on the rank count.
    #[error("Rank count mismatch: expected {expected}, got {got}")]
    RankCountMismatch { expected: usize, got: usize },
    /// The checkpoint was written with an unsupported format version.
    #[error("Unsupported format version {found} (supported: {supported})")]
    FormatVersionMismatch { found: u32, supported: u32 },
    /// Magic bytes, counts or lengths in a checkpoint are inconsistent.
    #[error("Corrupt checkpoint header: {0}")]
    CorruptHeader(String),
    /// The checkpoint describes a forest of a different dimension.
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: u32, found: u32 },
    /// A quadrant is not aligned, out of the root domain or in an unknown tree.
    #[error("Invalid quadrant: {0}")]
    InvalidQuadrant(String),
    /// The distributed quadrant sequence violates ordering or ownership invariants.
    #[error("Invalid forest: {0}")]
    InvalidForest(String),
    /// Filesystem failure while reading or writing a checkpoint.
    #[error("I/O error: {0}")]
    Io(String),
    /// A message from a peer rank was missing or malformed.
    #[error("Communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
}

impl From<std::io::Error> for ForestError {
    fn from(err: std::io::Error) -> Self {
        ForestError::Io(format!("{:?}: {}", err.kind(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_kind_and_message() {
        let err: ForestError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing.qff").into();
        match err {
            ForestError::Io(msg) => {
                assert!(msg.contains("NotFound"));
                assert!(msg.contains("missing.qff"));
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn verdicts_survive_json() {
        let err = ForestError::PartitionSizeMismatch {
            expected: 64,
            got: 63,
        };
        let json = serde_json::to_vec(&err).unwrap();
        let back: ForestError = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn comm_errors_name_the_peer() {
        let err = ForestError::CommError {
            neighbor: 3,
            reason: "no size header received".into(),
        };
        assert_eq!(
            err.to_string(),
            "Communication error with rank 3: no size header received"
        );
        assert!(std::error::Error::source(&err).is_none());
        let json = serde_json::to_string(&err).unwrap();
        let back: ForestError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
