use crate::error::Result;

/// A self-contained, precomputed mutation.
///
/// Deltas are built without holding any lock and are consumed by `commit`, so
/// each one is applied at most once. Composite deltas commit their children in
/// order and stop at the first error; callers commit into a private successor,
/// so a failed commit is simply discarded.
pub trait Delta {
    type Target: ?Sized;

    fn commit(self, target: &mut Self::Target) -> Result<()>;

    /// True for deltas that leave the target untouched.
    fn is_noop(&self) -> bool {
        false
    }
}
