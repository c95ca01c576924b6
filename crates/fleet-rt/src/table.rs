use crate::metrics::{StatusCounts, TaskMetrics};
use crate::task::{CancelToken, CoreId, Task, TaskId, TaskKind, TaskPriority, TaskStatus};
use fleet_sync::{HierarchicalLock, SyncError};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Number of core crashes a task may cause before it is failed instead of
/// being migrated again.
pub const MAX_CRASH_MIGRATIONS: u32 = 1;

/// Book-keeping for one submitted task. The task itself lives in a queue.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub assigned_core: Option<CoreId>,
    pub status: TaskStatus,
    pub cancel: CancelToken,
    pub metrics: TaskMetrics,
    pub submitted_at: Instant,
    /// When the task reached a terminal status.
    pub finished_at: Option<Instant>,
}

impl TaskRecord {
    fn settle(&mut self, status: TaskStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
    }
}

/// Status of every task the fleet has accepted.
///
/// Locked at a lower level than the metrics table, but the two are never held
/// at the same time.
#[derive(Debug, Default)]
pub struct TaskTable {
    records: HierarchicalLock<HashMap<TaskId, TaskRecord>>,
}

impl TaskTable {
    pub const LOCK_LEVEL: u64 = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: &Task) -> Result<(), SyncError> {
        let record = TaskRecord {
            kind: task.kind,
            priority: task.priority,
            assigned_core: task.assigned_core,
            status: TaskStatus::Pending,
            cancel: task.cancel_token().clone(),
            metrics: TaskMetrics::default(),
            submitted_at: Instant::now(),
            finished_at: None,
        };
        self.records.lock(Self::LOCK_LEVEL)?.insert(task.id, record);
        Ok(())
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus, SyncError> {
        Ok(self
            .records
            .lock(Self::LOCK_LEVEL)?
            .get(&id)
            .map_or(TaskStatus::Unknown, |r| r.status))
    }

    pub fn record(&self, id: TaskId) -> Result<Option<TaskRecord>, SyncError> {
        Ok(self.records.lock(Self::LOCK_LEVEL)?.get(&id).cloned())
    }

    /// `Pending -> Running` on `core`. Returns false when the task must be
    /// skipped (cancelled while queued, or unknown).
    pub fn begin_run(&self, id: TaskId, core: CoreId) -> Result<bool, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        match records.get_mut(&id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.status = TaskStatus::Running;
                record.assigned_core = Some(core);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Moves a running task to its final status. A task cancelled while it
    /// ran keeps its `Cancelled` status.
    pub fn finish(&self, id: TaskId, outcome: TaskStatus) -> Result<bool, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        match records.get_mut(&id) {
            Some(record)
                if record.status == TaskStatus::Running
                    && record.status.can_transition_to(outcome) =>
            {
                record.settle(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancels a live task. Queued tasks are skipped at dequeue; running tasks
    /// see their cancel token raised.
    pub fn cancel(&self, id: TaskId) -> Result<bool, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        match records.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.settle(TaskStatus::Cancelled);
                record.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancels every live task in `tasks`. Used for tasks handed back on shutdown.
    pub fn cancel_all(&self, tasks: &[Task]) -> Result<usize, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        let mut cancelled = 0;
        for task in tasks {
            if let Some(record) = records.get_mut(&task.id) {
                if !record.status.is_terminal() {
                    record.settle(TaskStatus::Cancelled);
                    record.cancel.cancel();
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    /// Forgets tasks that reached a terminal status more than `retention`
    /// ago. Their status reads as `Unknown` afterwards. Returns how many
    /// records were dropped.
    pub fn prune_terminal(&self, retention: Duration) -> Result<usize, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        let before = records.len();
        records.retain(|_, record| {
            record
                .finished_at
                .map_or(true, |at| at.elapsed() < retention)
        });
        Ok(before - records.len())
    }

    pub fn set_metrics(&self, id: TaskId, metrics: TaskMetrics) -> Result<bool, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        Ok(match records.get_mut(&id) {
            Some(record) => {
                record.metrics = metrics;
                true
            }
            None => false,
        })
    }

    pub fn metrics(&self, id: TaskId) -> Result<Option<TaskMetrics>, SyncError> {
        Ok(self
            .records
            .lock(Self::LOCK_LEVEL)?
            .get(&id)
            .map(|r| r.metrics))
    }

    pub fn counts(&self) -> Result<StatusCounts, SyncError> {
        let records = self.records.lock(Self::LOCK_LEVEL)?;
        let mut counts = StatusCounts::default();
        for record in records.values() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Unknown => {}
            }
        }
        Ok(counts)
    }

    /// Re-homes tasks taken off a core onto `target` (`None` parks them).
    ///
    /// Returns the tasks that should be pushed. Cancelled and otherwise
    /// terminal tasks are dropped here. A task that was running when its core
    /// crashed goes back to `Pending`, unless it has crashed cores too often,
    /// in which case it is failed.
    pub fn prepare_migration(
        &self,
        tasks: Vec<Task>,
        target: Option<CoreId>,
    ) -> Result<Vec<Task>, SyncError> {
        let mut records = self.records.lock(Self::LOCK_LEVEL)?;
        let mut movable = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            let Some(record) = records.get_mut(&task.id) else {
                log::warn!(
                    "Task {} has no status record; migrating it untracked.",
                    task.id
                );
                task.assigned_core = target;
                movable.push(task);
                continue;
            };

            match record.status {
                TaskStatus::Pending => {}
                TaskStatus::Running if task.migrations() > MAX_CRASH_MIGRATIONS => {
                    log::error!(
                        "Task {} crashed {} cores; marking it failed.",
                        task.id,
                        task.migrations()
                    );
                    record.settle(TaskStatus::Failed);
                    continue;
                }
                TaskStatus::Running => {
                    log::debug!("Task {} was running on a failed core; requeueing.", task.id);
                    record.status = TaskStatus::Pending;
                }
                status => {
                    log::trace!("Dropping {} task {} during migration.", status, task.id);
                    continue;
                }
            }

            record.assigned_core = target;
            task.assigned_core = target;
            movable.push(task);
        }
        Ok(movable)
    }
}
