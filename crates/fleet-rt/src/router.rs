use crate::collab::Executor;
use crate::error::{FleetError, Result};
use crate::fleet::WorkerFleet;
use crate::task::{CoreId, Task, TaskId, TaskIdAllocator, TaskKind, TaskStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The submission surface of a fleet, independent of its executor type.
pub trait TaskSink: Send + Sync {
    fn submit_task(&self, core: Option<CoreId>, task: Task) -> Result<TaskId>;
    fn cancel_task(&self, id: TaskId) -> Result<bool>;
    fn get_task_status(&self, id: TaskId) -> Result<TaskStatus>;
}

impl<E: Executor> TaskSink for WorkerFleet<E> {
    fn submit_task(&self, core: Option<CoreId>, task: Task) -> Result<TaskId> {
        WorkerFleet::submit_task(self, core, task)
    }

    fn cancel_task(&self, id: TaskId) -> Result<bool> {
        WorkerFleet::cancel_task(self, id)
    }

    fn get_task_status(&self, id: TaskId) -> Result<TaskStatus> {
        WorkerFleet::get_task_status(self, id)
    }
}

/// Routes tasks to the fleet registered for their [`TaskKind`].
///
/// Fleets behind one router should be built with the router's
/// [`task_ids`](KindRouter::task_ids) so ids are unique across kinds.
pub struct KindRouter {
    ids: Arc<TaskIdAllocator>,
    fleets: BTreeMap<TaskKind, Arc<dyn TaskSink>>,
}

impl KindRouter {
    pub fn new() -> Self {
        Self {
            ids: Arc::new(TaskIdAllocator::new()),
            fleets: BTreeMap::new(),
        }
    }

    pub fn task_ids(&self) -> Arc<TaskIdAllocator> {
        Arc::clone(&self.ids)
    }

    pub fn register(&mut self, kind: TaskKind, fleet: Arc<dyn TaskSink>) -> Result<()> {
        if self.fleets.contains_key(&kind) {
            return Err(FleetError::configuration(
                None,
                format!("a fleet is already registered for {kind:?} tasks"),
            ));
        }
        log::debug!("Registered fleet for {:?} tasks.", kind);
        self.fleets.insert(kind, fleet);
        Ok(())
    }

    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.fleets.keys().copied()
    }

    pub fn submit_task(&self, core: Option<CoreId>, task: Task) -> Result<TaskId> {
        let fleet = self.fleets.get(&task.kind).ok_or_else(|| {
            log::warn!("No fleet registered for {:?} tasks.", task.kind);
            FleetError::NoAvailableCore
        })?;
        fleet.submit_task(core, task)
    }

    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        for fleet in self.fleets.values() {
            if fleet.cancel_task(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskStatus> {
        for fleet in self.fleets.values() {
            let status = fleet.get_task_status(id)?;
            if status != TaskStatus::Unknown {
                return Ok(status);
            }
        }
        Ok(TaskStatus::Unknown)
    }
}

impl Default for KindRouter {
    fn default() -> Self {
        Self::new()
    }
}
