//! Core selection and load rebalancing.
//!
//! The balancer keeps two tables: core metrics and task status. Each sits
//! behind its own [`HierarchicalLock`](fleet_sync::HierarchicalLock) and the
//! two are never held together. Every decision is taken on a copied metrics
//! snapshot, after which the metrics lock is released and the task table is
//! consulted. Queues are touched only with no lock held.

use crate::collab::CoreTuning;
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::metrics::{
    average_healthy_cpu, select_core, CoreMetrics, MetricsTable, SystemMetrics, TaskMetrics,
};
use crate::registry::Registry;
use crate::table::TaskTable;
use crate::task::{CoreId, Task, TaskId, TaskIdAllocator, TaskStatus};
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type MetricsCallback = Box<dyn Fn(&SystemMetrics) + Send + Sync>;

pub struct LoadBalancer {
    overload_threshold: f64,
    deviation_threshold: f64,
    registry: Arc<Registry>,
    tasks: Arc<TaskTable>,
    metrics: MetricsTable,
    ids: Arc<TaskIdAllocator>,
    /// Tasks that could not be placed because no core was healthy.
    stranded: SegQueue<Task>,
    callbacks: RwLock<Vec<MetricsCallback>>,
}

impl LoadBalancer {
    pub fn new(
        config: &FleetConfig,
        registry: Arc<Registry>,
        tasks: Arc<TaskTable>,
        ids: Arc<TaskIdAllocator>,
    ) -> Self {
        Self {
            overload_threshold: config.overload_threshold,
            deviation_threshold: config.deviation_threshold,
            registry,
            tasks,
            metrics: MetricsTable::new(),
            ids,
            stranded: SegQueue::new(),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Makes a core eligible for selection, starting from idle metrics.
    pub fn register_core(&self, core: CoreId) -> Result<()> {
        self.metrics.update(core, CoreMetrics::idle())?;
        Ok(())
    }

    /// Assigns the task an id, records it `Pending` and queues it.
    ///
    /// With `core == None` the least-loaded healthy core is chosen.
    pub fn submit_task(&self, core: Option<CoreId>, mut task: Task) -> Result<TaskId> {
        let snapshot = self.metrics.snapshot()?;
        let target = match core {
            Some(id) => match snapshot.get(&id) {
                None => return Err(FleetError::UnknownCore(id)),
                Some(metrics) if !metrics.is_healthy => return Err(FleetError::NoAvailableCore),
                Some(_) => id,
            },
            None => select_core(&snapshot, &[]).ok_or(FleetError::NoAvailableCore)?,
        };
        let slot = self
            .registry
            .get(target)
            .ok_or(FleetError::UnknownCore(target))?;

        task.id = self.ids.next_id();
        task.assigned_core = Some(target);
        let id = task.id;

        self.tasks.insert(&task)?;
        slot.push(task);
        log::trace!("Task {} submitted to core {}.", id, target);
        Ok(id)
    }

    /// Deterministic selection over the current metrics.
    pub fn select_core(&self) -> Result<Option<CoreId>> {
        Ok(select_core(&self.metrics.snapshot()?, &[]))
    }

    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        let cancelled = self.tasks.cancel(id)?;
        if cancelled {
            log::debug!("Task {} cancelled.", id);
        }
        Ok(cancelled)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(self.tasks.status(id)?)
    }

    pub fn update_task_metrics(&self, id: TaskId, metrics: TaskMetrics) -> Result<()> {
        if self.tasks.set_metrics(id, metrics)? {
            Ok(())
        } else {
            Err(FleetError::UnknownTask(id))
        }
    }

    pub fn task_metrics(&self, id: TaskId) -> Result<TaskMetrics> {
        self.tasks.metrics(id)?.ok_or(FleetError::UnknownTask(id))
    }

    /// Last write wins.
    pub fn update_core_metrics(&self, core: CoreId, metrics: CoreMetrics) -> Result<()> {
        if !self.metrics.contains(core)? {
            return Err(FleetError::UnknownCore(core));
        }
        self.metrics.update(core, metrics)?;
        Ok(())
    }

    pub fn get_core_metrics(&self, core: CoreId) -> Result<CoreMetrics> {
        self.metrics.get(core)?.ok_or(FleetError::UnknownCore(core))
    }

    /// Snapshot of every core's metrics.
    pub fn core_metrics(&self) -> Result<BTreeMap<CoreId, CoreMetrics>> {
        Ok(self.metrics.snapshot()?)
    }

    pub fn is_core_healthy(&self, core: CoreId) -> Result<bool> {
        Ok(self.get_core_metrics(core)?.is_healthy)
    }

    /// Removes the core from selection. Returns whether it was healthy.
    pub fn mark_core_unhealthy(&self, core: CoreId) -> Result<bool> {
        if !self.metrics.contains(core)? {
            return Err(FleetError::UnknownCore(core));
        }
        let was_healthy = self.metrics.mark_unhealthy(core)?;
        if was_healthy {
            log::warn!("Core {} marked unhealthy.", core);
        }
        Ok(was_healthy)
    }

    /// Fully evacuates every overloaded core onto the least-loaded healthy
    /// core that is not itself overloaded. Returns the number of tasks moved.
    pub fn rebalance_load(&self) -> Result<usize> {
        let snapshot = self.metrics.snapshot()?;
        let overloaded: Vec<CoreId> = snapshot
            .iter()
            .filter(|(_, m)| m.is_overloaded(self.overload_threshold))
            .map(|(id, _)| *id)
            .collect();
        if overloaded.is_empty() {
            return Ok(0);
        }
        let Some(target) = select_core(&snapshot, &overloaded) else {
            log::warn!(
                "{} cores are overloaded but no other core can take their work.",
                overloaded.len()
            );
            return Ok(0);
        };

        let mut moved = 0;
        for core in overloaded {
            let Some(slot) = self.registry.get(core) else {
                continue;
            };
            let tasks = slot.queue.drain();
            if tasks.is_empty() {
                continue;
            }
            let placed = self.place(tasks, target)?;
            log::info!(
                "Evacuated {} tasks from overloaded core {} to core {}.",
                placed,
                core,
                target
            );
            moved += placed;
        }
        Ok(moved)
    }

    /// Tunes cores whose CPU usage strays from the healthy average, without
    /// moving any task. Returns the cores that were tuned.
    pub fn optimize_distribution(&self, tuner: &dyn CoreTuning) -> Result<Vec<CoreId>> {
        let snapshot = self.metrics.snapshot()?;
        let Some(average) = average_healthy_cpu(&snapshot) else {
            return Ok(Vec::new());
        };

        let outliers: Vec<CoreId> = snapshot
            .iter()
            .filter(|(_, m)| {
                m.is_healthy && (m.cpu_usage - average).abs() > self.deviation_threshold
            })
            .map(|(id, _)| *id)
            .collect();
        for &core in &outliers {
            log::debug!(
                "Core {} deviates from average cpu {:.2}; optimizing.",
                core,
                average
            );
            tuner.optimize_core(core);
        }
        Ok(outliers)
    }

    /// Per-core reaction to pressure on a single resource.
    pub fn adjust_resources(&self, core: CoreId, tuner: &dyn CoreTuning) -> Result<()> {
        let metrics = self.get_core_metrics(core)?;
        if metrics.cpu_usage > self.overload_threshold {
            tuner.optimize_core(core);
        }
        if metrics.memory_usage > self.overload_threshold {
            tuner.adjust_core_resources(core);
        }
        if metrics.network_usage > self.overload_threshold {
            self.rebalance_load()?;
        }
        Ok(())
    }

    /// Places tasks taken off a core onto the least-loaded healthy core, or
    /// parks them when none is healthy. Returns the number placed.
    pub fn redistribute(&self, tasks: Vec<Task>) -> Result<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let snapshot = self.metrics.snapshot()?;
        match select_core(&snapshot, &[]) {
            Some(target) => self.place(tasks, target),
            None => {
                self.park(tasks)?;
                Ok(0)
            }
        }
    }

    /// Retries parked tasks. Returns the number placed.
    pub fn retry_stranded(&self) -> Result<usize> {
        if self.stranded.is_empty() {
            return Ok(0);
        }
        let mut tasks = Vec::with_capacity(self.stranded.len());
        while let Some(task) = self.stranded.pop() {
            tasks.push(task);
        }
        let placed = self.redistribute(tasks)?;
        if placed > 0 {
            log::info!("Placed {} stranded tasks.", placed);
        }
        Ok(placed)
    }

    pub fn stranded_tasks(&self) -> usize {
        self.stranded.len()
    }

    /// Removes every parked task. Used on shutdown.
    pub fn take_stranded(&self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.stranded.len());
        while let Some(task) = self.stranded.pop() {
            tasks.push(task);
        }
        tasks
    }

    fn place(&self, tasks: Vec<Task>, target: CoreId) -> Result<usize> {
        let Some(slot) = self.registry.get(target) else {
            self.park(tasks)?;
            return Ok(0);
        };
        let movable = self.tasks.prepare_migration(tasks, Some(target))?;
        let placed = movable.len();
        for task in movable {
            slot.queue.push(task);
        }
        slot.signal.notify();
        Ok(placed)
    }

    fn park(&self, tasks: Vec<Task>) -> Result<()> {
        let parked = self.tasks.prepare_migration(tasks, None)?;
        if !parked.is_empty() {
            log::warn!("No healthy core; parking {} tasks.", parked.len());
        }
        for task in parked {
            self.stranded.push(task);
        }
        Ok(())
    }

    pub fn register_metrics_callback<F>(&self, callback: F)
    where
        F: Fn(&SystemMetrics) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }

    pub fn system_metrics(&self, tick: u64) -> Result<SystemMetrics> {
        let cores = self.metrics.snapshot()?;
        let tasks = self.tasks.counts()?;
        Ok(SystemMetrics {
            tick,
            healthy_cores: cores.values().filter(|m| m.is_healthy).count(),
            queued_tasks: self.registry.queued_tasks(),
            stranded_tasks: self.stranded.len(),
            tasks,
            cores,
        })
    }

    pub fn publish_metrics(&self, metrics: &SystemMetrics) {
        for callback in self.callbacks.read().iter() {
            callback(metrics);
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("overload_threshold", &self.overload_threshold)
            .field("deviation_threshold", &self.deviation_threshold)
            .field("stranded", &self.stranded.len())
            .finish_non_exhaustive()
    }
}
