use crate::forest::Forest;
use crate::forest_error::ForestError;
use crate::topology::connectivity::Connectivity;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Assert invariants in debug builds or when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), ForestError>;
}

/// Helper macro to run a fallible check and panic on error when invariant
/// checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

impl<const D: usize> DebugInvariants for Connectivity<D> {
    fn debug_assert_invariants(&self) {
        debug_invariants!(self.validate_invariants(), "connectivity");
    }

    fn validate_invariants(&self) -> Result<(), ForestError> {
        self.validate()
    }
}

/// Rank-local part of the forest invariants; the cross-rank part needs
/// [`Forest::is_valid`].
impl<const D: usize> DebugInvariants for Forest<D> {
    fn debug_assert_invariants(&self) {
        debug_invariants!(self.validate_invariants(), "forest");
    }

    fn validate_invariants(&self) -> Result<(), ForestError> {
        self.check_local()
    }
}
