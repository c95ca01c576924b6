use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the ordered locking primitives.
///
/// These indicate programmer errors in lock ordering, never contention.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A thread tried to take a lock at a level that is not strictly above
    /// the highest level it already holds.
    #[error("Invalid lock hierarchy: requested level {requested} while holding level {held}")]
    #[diagnostic(
        code("SYNC-001"),
        help("Acquire locks in strictly increasing level order and release inner locks first")
    )]
    InvalidHierarchy { requested: u64, held: u64 },

    /// Level 0 is reserved for "no lock held".
    #[error("Lock level 0 is reserved")]
    #[diagnostic(code("SYNC-002"))]
    ReservedLevel,
}
