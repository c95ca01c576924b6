use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a logical core within a fleet.
pub type CoreId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Placeholder carried by a task until it is submitted.
    pub const UNASSIGNED: TaskId = TaskId(0);
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Compute,
    Ledger,
    Network,
    Storage,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Lifecycle of a submitted task.
///
/// Statuses only move forward, with one exception: a task that was `Running`
/// on a core that crashed goes back to `Pending` when it is migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
    /// Returned for ids the fleet has never seen.
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
            TaskStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Opaque, cheaply clonable handle to the data an executor works on.
#[derive(Clone)]
pub struct Payload(Option<Arc<dyn Any + Send + Sync>>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref()?.downcast_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Payload(..)"),
            None => f.write_str("Payload(empty)"),
        }
    }
}

/// Cooperative cancellation flag shared between the task table and the task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A unit of work. Owned by exactly one queue (or one worker) at a time.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub payload: Payload,
    pub assigned_core: Option<CoreId>,
    cancel: CancelToken,
    migrations: u32,
}

impl Task {
    pub fn new(kind: TaskKind, priority: TaskPriority, payload: Payload) -> Self {
        Self {
            id: TaskId::UNASSIGNED,
            kind,
            priority,
            payload,
            assigned_core: None,
            cancel: CancelToken::new(),
            migrations: 0,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Executors running long tasks should poll this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of times this task was taken off a crashed core.
    pub fn migrations(&self) -> u32 {
        self.migrations
    }

    pub(crate) fn record_crash(&mut self) {
        self.migrations += 1;
    }
}

/// Hands out fleet-unique task ids. Share one allocator between fleets that
/// sit behind the same router.
#[derive(Debug)]
pub struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Pending));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Unknown.can_transition_to(Pending));
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_payload_downcast() {
        let payload = Payload::new(42u32);
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
        assert_eq!(payload.downcast_ref::<i64>(), None);
        assert!(Payload::empty().downcast_ref::<u32>().is_none());
    }

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let ids = TaskIdAllocator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, TaskId::UNASSIGNED);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let task = Task::new(TaskKind::Compute, TaskPriority::High, Payload::empty());
        let token = task.cancel_token().clone();
        assert!(!task.is_cancelled());
        token.cancel();
        assert!(task.is_cancelled());
    }
}
