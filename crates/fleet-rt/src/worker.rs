use crate::collab::{CoreResources, Executor, ResourceProvider, StateSnapshot};
use crate::error::{FleetError, Result};
use crate::metrics::CoreMetrics;
use crate::recovery::FailureReport;
use crate::registry::{CoreSlot, CoreState, WakeSignal};
use crate::table::TaskTable;
use crate::task::{CoreId, Task, TaskStatus};
use fleet_sync::TaskStack;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cache line size requested from the cache manager when SIMD is enabled.
pub const SIMD_CACHE_LINE_SIZE: usize = 64;

/// Memory usage above which a worker compacts after a drain cycle.
pub const MEMORY_PRESSURE_THRESHOLD: f64 = 0.8;

/// Upper bound on an idle wait; the worker re-checks its state after this even
/// without a notification.
const IDLE_WAIT: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(1);

/// Fleet-wide handles every worker thread needs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub tasks: Arc<TaskTable>,
    /// Failure mailbox drained by the fleet monitor.
    pub failures: Arc<TaskStack<FailureReport>>,
    /// Wakes the monitor when a failure is reported.
    pub monitor: Arc<WakeSignal>,
}

/// Owns one core's thread and collaborators.
///
/// The queue and lifecycle state live in the shared [`CoreSlot`]; the worker
/// adds the thread handle and the provisioned managers.
///
/// # Thread Safety
///
/// A `CoreWorker` is driven by one controller at a time (the fleet keeps it
/// behind a mutex). The worker thread itself only touches the slot.
pub struct CoreWorker<E: Executor> {
    slot: Arc<CoreSlot>,
    executor: Arc<E>,
    context: WorkerContext,
    resources: Option<CoreResources>,
    handle: Option<JoinHandle<()>>,
}

impl<E: Executor> CoreWorker<E> {
    pub fn new(slot: Arc<CoreSlot>, executor: Arc<E>, context: WorkerContext) -> Self {
        Self {
            slot,
            executor,
            context,
            resources: None,
            handle: None,
        }
    }

    pub fn core_id(&self) -> CoreId {
        self.slot.core_id()
    }

    pub fn slot(&self) -> &Arc<CoreSlot> {
        &self.slot
    }

    pub fn state(&self) -> CoreState {
        self.slot.state()
    }

    pub fn resources(&self) -> Option<&CoreResources> {
        self.resources.as_ref()
    }

    /// Provisions collaborators and applies the core's configuration.
    ///
    /// Used both for first-time setup and for reinitialization after a
    /// failure. Leaves the core `Running` (accepting work) on success.
    pub fn initialize(&mut self, provider: &dyn ResourceProvider) -> Result<()> {
        let config = &self.slot.config;
        let core_id = config.core_id;
        let misconfigured = |e: crate::error::CollaboratorError| {
            FleetError::configuration(Some(core_id), e.to_string())
        };
        log::debug!("Initializing core {}.", core_id);

        let resources = provider.provision(config).map_err(misconfigured)?;
        resources
            .resources
            .bind_numa_node(config.numa_node)
            .map_err(misconfigured)?;
        resources.resources.set_memory_limit(config.memory_limit);

        if config.enable_gpu {
            resources.accelerators.initialize_gpu().map_err(misconfigured)?;
        }
        if config.enable_fpga {
            resources
                .accelerators
                .initialize_fpga()
                .map_err(misconfigured)?;
        }
        if config.enable_simd {
            resources.cache.set_cache_line_size(SIMD_CACHE_LINE_SIZE);
        }

        self.resources = Some(resources);
        self.slot.set_state(CoreState::Running);
        log::info!(
            "Core {} initialized (numa node {}, simd {}, gpu {}, fpga {}).",
            core_id,
            config.numa_node,
            config.enable_simd,
            config.enable_gpu,
            config.enable_fpga
        );
        Ok(())
    }

    /// Spawns the core's dedicated thread.
    pub fn start(&mut self) -> Result<()> {
        let core_id = self.core_id();
        if self.is_alive() {
            return Err(FleetError::AlreadyRunning(core_id));
        }
        if let Some(finished) = self.handle.take() {
            let _ = finished.join();
        }

        let resources = self.resources.clone().ok_or_else(|| {
            FleetError::configuration(Some(core_id), "core started before initialization")
        })?;
        match self.slot.state() {
            CoreState::Running | CoreState::Paused => {}
            state => {
                return Err(FleetError::CoreFailure {
                    core_id,
                    reason: format!("cannot start a core in state {state}"),
                })
            }
        }

        self.slot.request_stop(false);
        let generation = self.slot.generation();
        let slot = Arc::clone(&self.slot);
        let executor = Arc::clone(&self.executor);
        let context = self.context.clone();

        let name = format!("fleet-core-{core_id}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_core_loop(slot, executor, resources, context, generation))
            .map_err(|source| FleetError::Spawn {
                thread: name,
                source,
            })?;
        self.handle = Some(handle);
        log::info!("Core {} started.", core_id);
        Ok(())
    }

    /// Stops dequeuing after the current task. Returns false unless the core
    /// was running.
    pub fn pause(&self) -> bool {
        let paused = self.slot.transition(CoreState::Running, CoreState::Paused);
        if paused {
            log::debug!("Core {} paused.", self.core_id());
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self.slot.transition(CoreState::Paused, CoreState::Running);
        if resumed {
            log::debug!("Core {} resumed.", self.core_id());
        }
        resumed
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and hands back every task still queued on the core.
    pub fn stop(&mut self, timeout: Duration) -> Vec<Task> {
        self.slot.request_stop(true);
        self.join(timeout);
        self.slot.set_state(CoreState::Stopped);

        let mut remaining = self.slot.queue.drain();
        remaining.extend(self.slot.take_orphans());
        log::info!(
            "Core {} stopped with {} unfinished tasks.",
            self.core_id(),
            remaining.len()
        );
        remaining
    }

    /// Tears the core down after a failure: the thread is stopped, the
    /// collaborators released, and leftover tasks returned.
    pub fn cleanup(&mut self, timeout: Duration) -> Vec<Task> {
        log::debug!("Cleaning up core {}.", self.core_id());
        self.slot.set_state(CoreState::Failed);
        self.join(timeout);
        self.resources = None;

        let mut leftovers = self.slot.queue.drain();
        leftovers.extend(self.slot.take_orphans());
        leftovers
    }

    fn join(&mut self, timeout: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Core {} did not exit within {:?}; detaching its thread.",
                    self.core_id(),
                    timeout
                );
                self.slot.retire_generation();
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            log::error!("Core {} thread panicked outside task isolation.", self.core_id());
        }
    }

    /// Memory, cache and accelerator checks. An uninitialized core fails.
    pub fn verify_integrity(&self) -> bool {
        self.resources.as_ref().is_some_and(CoreResources::verify)
    }

    /// Cache tuning hook.
    pub fn optimize_cache(&self) {
        if let Some(resources) = &self.resources {
            resources.cache.prefetch_hot_data();
            if self.slot.config.enable_simd {
                resources.cache.set_cache_line_size(SIMD_CACHE_LINE_SIZE);
            }
        }
    }

    /// Memory tuning hook.
    pub fn compact_memory(&self) {
        if let Some(resources) = &self.resources {
            resources.resources.compact_memory();
        }
    }

    pub fn backup_state(&self) -> Option<StateSnapshot> {
        self.resources.as_ref()?.resources.backup_state()
    }

    pub fn restore_state(&self, snapshot: StateSnapshot) -> Result<()> {
        let core_id = self.core_id();
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| FleetError::RecoveryFailure {
                core_id,
                reason: "cannot restore state on an uninitialized core".to_string(),
            })?;
        resources
            .resources
            .restore_state(snapshot)
            .map_err(|e| FleetError::RecoveryFailure {
                core_id,
                reason: e.to_string(),
            })
    }

    /// Current load as seen from this worker.
    pub fn sample_metrics(&self) -> CoreMetrics {
        let usage = self
            .resources
            .as_ref()
            .map(|r| r.resources.get_metrics())
            .unwrap_or_default();
        let live = matches!(self.state(), CoreState::Running | CoreState::Paused);

        CoreMetrics {
            cpu_usage: usage.cpu_usage,
            memory_usage: usage.memory_usage,
            network_usage: usage.network_usage,
            queue_size: self.slot.queue.len(),
            active_tasks: usize::from(self.slot.running_task().is_some()),
            last_update: Instant::now(),
            is_healthy: live && self.verify_integrity(),
        }
    }
}

impl<E: Executor> Drop for CoreWorker<E> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.slot.request_stop(true);
            self.join(IDLE_WAIT);
        }
    }
}

fn run_core_loop<E: Executor>(
    slot: Arc<CoreSlot>,
    executor: Arc<E>,
    resources: CoreResources,
    context: WorkerContext,
    generation: u64,
) {
    let core_id = slot.core_id();
    let retired = || slot.stop_requested() || slot.generation() != generation;
    log::debug!("Core {} entering run loop.", core_id);

    loop {
        let has_work = slot.signal.wait_until(
            || {
                retired()
                    || matches!(slot.state(), CoreState::Failed | CoreState::Stopped)
                    || (slot.state() == CoreState::Running && !slot.queue.is_empty())
            },
            IDLE_WAIT,
        );
        if retired() {
            break;
        }
        match slot.state() {
            CoreState::Failed | CoreState::Stopped => break,
            CoreState::Running if has_work => {}
            _ => continue,
        }

        // --- Drain cycle ---
        let mut executed = 0usize;
        while slot.state() == CoreState::Running && !retired() {
            let Some(task) = slot.queue.pop() else {
                break;
            };
            if !execute_task(&slot, &*executor, &context, task, generation) {
                break;
            }
            executed += 1;
        }

        if slot.state() == CoreState::Failed {
            break;
        }

        // --- Self-tuning and integrity ---
        if executed > 0 {
            resources.cache.prefetch_hot_data();
            if resources.resources.get_metrics().memory_usage > MEMORY_PRESSURE_THRESHOLD {
                log::debug!("Core {} under memory pressure; compacting.", core_id);
                resources.resources.compact_memory();
            }
            if !resources.verify() {
                report_failure(&slot, &context, "integrity check failed".to_string());
                break;
            }
        }
    }
    log::info!("Core {} exiting run loop.", core_id);
}

/// Runs one task with panic isolation. Returns false if the core failed.
fn execute_task<E: Executor>(
    slot: &CoreSlot,
    executor: &E,
    context: &WorkerContext,
    mut task: Task,
    generation: u64,
) -> bool {
    let core_id = slot.core_id();
    let id = task.id;

    match context.tasks.begin_run(id, core_id) {
        Ok(true) => {}
        Ok(false) => {
            log::debug!("Core {}: skipping task {} (cancelled or unknown).", core_id, id);
            return true;
        }
        Err(e) => {
            log::error!("Core {}: cannot record start of task {}: {}", core_id, id, e);
            slot.add_orphan(task);
            report_failure(slot, context, format!("task table unavailable: {e}"));
            return false;
        }
    }

    slot.set_running(Some(id));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&task)));
    slot.record_executed();

    let status = match outcome {
        Ok(Ok(())) => {
            log::trace!("Core {}: task {} completed.", core_id, id);
            TaskStatus::Completed
        }
        Ok(Err(e)) => {
            log::warn!("Core {}: task {} failed: {}", core_id, id, e);
            TaskStatus::Failed
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            log::error!("Core {}: task {} panicked: {}", core_id, id, reason);
            task.record_crash();
            slot.add_orphan(task);
            slot.clear_running(generation);
            report_failure(slot, context, format!("task {id} panicked: {reason}"));
            return false;
        }
    };

    slot.clear_running(generation);
    if let Err(e) = context.tasks.finish(id, status) {
        log::error!("Core {}: cannot record outcome of task {}: {}", core_id, id, e);
    }
    true
}

fn report_failure(slot: &CoreSlot, context: &WorkerContext, reason: String) {
    let core_id = slot.core_id();
    log::error!("Core {} failed: {}", core_id, reason);
    slot.set_state(CoreState::Failed);
    context.failures.push(FailureReport::new(core_id, reason));
    context.monitor.notify();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
