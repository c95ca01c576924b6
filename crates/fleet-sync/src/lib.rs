//! Concurrency primitives for the fleet runtime.
//!
//! - [`TaskQueue`]: lock-free MPMC FIFO with an atomic bulk drain
//! - [`TaskStack`]: lock-free Treiber stack
//! - [`HierarchicalLock`]: spin lock that rejects out-of-order acquisition
//! - [`RcuCell`]: read-mostly cell with grace-period reclamation

pub mod backoff;
pub mod error;
pub mod hierarchy;
pub mod queue;
pub mod rcu;
pub mod stack;

pub use backoff::{RetryBackoff, SpinWait};
pub use error::SyncError;
pub use hierarchy::{current_level, HierarchicalLock, HierarchyGuard};
pub use queue::TaskQueue;
pub use rcu::{RcuCell, RcuReadGuard};
pub use stack::TaskStack;
