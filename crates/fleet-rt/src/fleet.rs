use crate::balancer::LoadBalancer;
use crate::collab::{CoreTuning, Executor, NoopProvider, ResourceProvider, StateSnapshot};
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::metrics::{CoreMetrics, SystemMetrics, TaskMetrics};
use crate::recovery::{CoreControl, FailureRecoveryCoordinator, FailureReport, RecoveryOutcome};
use crate::registry::{CoreSlot, CoreState, Registry, WakeSignal};
use crate::table::TaskTable;
use crate::task::{CoreId, Task, TaskId, TaskIdAllocator, TaskStatus};
use crate::worker::{CoreWorker, WorkerContext};
use fleet_sync::TaskStack;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Configures and builds a [`WorkerFleet`].
pub struct FleetBuilder<E: Executor> {
    config: FleetConfig,
    executor: E,
    provider: Arc<dyn ResourceProvider>,
    ids: Option<Arc<TaskIdAllocator>>,
}

impl<E: Executor> FleetBuilder<E> {
    pub fn provider(mut self, provider: impl ResourceProvider + 'static) -> Self {
        self.provider = Arc::new(provider);
        self
    }

    /// Shares task ids with other fleets, e.g. those behind one router.
    pub fn task_ids(mut self, ids: Arc<TaskIdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validates the configuration and initializes every core.
    ///
    /// Configuration errors abort construction; no thread is started until
    /// [`WorkerFleet::start`].
    pub fn build(self) -> Result<WorkerFleet<E>> {
        let FleetBuilder {
            config,
            executor,
            provider,
            ids,
        } = self;
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let tasks = Arc::new(TaskTable::new());
        let ids = ids.unwrap_or_default();
        let balancer = Arc::new(LoadBalancer::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&tasks),
            ids,
        ));
        let recovery = FailureRecoveryCoordinator::new(
            Arc::clone(&balancer),
            Arc::clone(&registry),
            config.recovery.clone(),
        );

        let failures = Arc::new(TaskStack::new());
        let monitor_signal = Arc::new(WakeSignal::new());
        let context = WorkerContext {
            tasks: Arc::clone(&tasks),
            failures: Arc::clone(&failures),
            monitor: Arc::clone(&monitor_signal),
        };

        let executor = Arc::new(executor);
        let mut workers = BTreeMap::new();
        for core_config in &config.cores {
            let core_id = core_config.core_id;
            let slot = Arc::new(CoreSlot::new(core_config.clone()));
            if !registry.register(Arc::clone(&slot)) {
                return Err(FleetError::configuration(Some(core_id), "duplicate core id"));
            }
            let mut worker = CoreWorker::new(slot, Arc::clone(&executor), context.clone());
            worker.initialize(&*provider)?;
            balancer.register_core(core_id)?;
            workers.insert(core_id, Mutex::new(worker));
        }
        log::info!("Fleet initialized with {} cores.", workers.len());

        Ok(WorkerFleet {
            inner: Arc::new(FleetInner {
                config,
                registry,
                tasks,
                balancer,
                recovery,
                workers,
                provider,
                failures,
                monitor_signal,
                running: AtomicBool::new(false),
                monitor_paused: AtomicBool::new(false),
                monitor_stop: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
            }),
            monitor: Mutex::new(None),
        })
    }
}

/// A set of cores sharing one executor, load balancer and recovery
/// coordinator, plus the monitor thread that keeps them healthy.
///
/// Everything is owned by this value: create one per task kind and route to
/// them with a [`KindRouter`](crate::KindRouter).
pub struct WorkerFleet<E: Executor> {
    inner: Arc<FleetInner<E>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct FleetInner<E: Executor> {
    config: FleetConfig,
    registry: Arc<Registry>,
    tasks: Arc<TaskTable>,
    balancer: Arc<LoadBalancer>,
    recovery: FailureRecoveryCoordinator,
    workers: BTreeMap<CoreId, Mutex<CoreWorker<E>>>,
    provider: Arc<dyn ResourceProvider>,
    failures: Arc<TaskStack<FailureReport>>,
    monitor_signal: Arc<WakeSignal>,
    running: AtomicBool,
    monitor_paused: AtomicBool,
    monitor_stop: AtomicBool,
    ticks: AtomicU64,
}

impl<E: Executor> WorkerFleet<E> {
    pub fn builder(config: FleetConfig, executor: E) -> FleetBuilder<E> {
        FleetBuilder {
            config,
            executor,
            provider: Arc::new(NoopProvider),
            ids: None,
        }
    }

    /// A fleet with no-op collaborators.
    pub fn new(config: FleetConfig, executor: E) -> Result<Self> {
        Self::builder(config, executor).build()
    }

    /// Starts every core's thread and the monitor thread.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            log::debug!("Fleet already running.");
            return Ok(());
        }

        for (&core, worker) in &self.inner.workers {
            if let Err(e) = worker.lock().start() {
                log::error!("Core {} failed to start: {}", core, e);
                self.inner
                    .failures
                    .push(FailureReport::new(core, e.to_string()));
            }
        }

        self.inner.monitor_stop.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("fleet-monitor".to_string())
            .spawn(move || run_monitor(inner))
            .map_err(|source| FleetError::Spawn {
                thread: "fleet-monitor".to_string(),
                source,
            })?;
        *self.monitor.lock() = Some(handle);
        log::info!("Fleet started.");
        Ok(())
    }

    /// Stops the monitor and every core. Tasks that never ran are marked
    /// `Cancelled` and handed back.
    pub fn shutdown(&self) -> Result<Vec<Task>> {
        self.inner.monitor_stop.store(true, Ordering::Release);
        self.inner.monitor_signal.notify();
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                log::error!("Fleet monitor thread panicked.");
            }
        }
        self.inner.running.store(false, Ordering::Release);

        let timeout = self.inner.config.join_timeout();
        let mut unfinished = Vec::new();
        for worker in self.inner.workers.values() {
            unfinished.extend(worker.lock().stop(timeout));
        }
        unfinished.extend(self.inner.balancer.take_stranded());

        let cancelled = self.inner.tasks.cancel_all(&unfinished)?;
        log::info!(
            "Fleet shut down; {} unfinished tasks returned ({} cancelled).",
            unfinished.len(),
            cancelled
        );
        Ok(unfinished)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn submit_task(&self, core: Option<CoreId>, task: Task) -> Result<TaskId> {
        self.inner.balancer.submit_task(core, task)
    }

    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        self.inner.balancer.cancel_task(id)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskStatus> {
        self.inner.balancer.get_task_status(id)
    }

    pub fn update_task_metrics(&self, id: TaskId, metrics: TaskMetrics) -> Result<()> {
        self.inner.balancer.update_task_metrics(id, metrics)
    }

    pub fn task_metrics(&self, id: TaskId) -> Result<TaskMetrics> {
        self.inner.balancer.task_metrics(id)
    }

    pub fn get_core_metrics(&self, core: CoreId) -> Result<CoreMetrics> {
        self.inner.balancer.get_core_metrics(core)
    }

    pub fn update_core_metrics(&self, core: CoreId, metrics: CoreMetrics) -> Result<()> {
        self.inner.balancer.update_core_metrics(core, metrics)
    }

    pub fn register_metrics_callback<F>(&self, callback: F)
    where
        F: Fn(&SystemMetrics) + Send + Sync + 'static,
    {
        self.inner.balancer.register_metrics_callback(callback);
    }

    /// External health-check trigger. The core stops receiving work at once;
    /// recovery runs on the monitor thread.
    pub fn mark_core_unhealthy(&self, core: CoreId) -> Result<()> {
        self.inner.balancer.mark_core_unhealthy(core)?;
        self.inner
            .failures
            .push(FailureReport::new(core, "marked unhealthy externally"));
        self.inner.monitor_signal.notify();
        Ok(())
    }

    /// Runs the recovery protocol for `core` on the calling thread.
    pub fn handle_core_failure(&self, core: CoreId) -> Result<RecoveryOutcome> {
        self.inner.handle_core_failure(core)
    }

    /// Handles queued failure reports. Returns how many cores were handled.
    pub fn process_failure_reports(&self) -> usize {
        self.inner.process_failure_reports()
    }

    /// One monitor iteration, run on the calling thread.
    pub fn monitor_tick(&self) -> Result<SystemMetrics> {
        self.inner.monitor_tick()
    }

    pub fn pause_monitor(&self) {
        self.inner.monitor_paused.store(true, Ordering::Release);
        log::debug!("Fleet monitor paused.");
    }

    pub fn resume_monitor(&self) {
        self.inner.monitor_paused.store(false, Ordering::Release);
        self.inner.monitor_signal.notify();
        log::debug!("Fleet monitor resumed.");
    }

    pub fn pause_core(&self, core: CoreId) -> Result<bool> {
        Ok(self.inner.worker(core)?.lock().pause())
    }

    pub fn resume_core(&self, core: CoreId) -> Result<bool> {
        Ok(self.inner.worker(core)?.lock().resume())
    }

    pub fn pause(&self) {
        for worker in self.inner.workers.values() {
            worker.lock().pause();
        }
    }

    pub fn resume(&self) {
        for worker in self.inner.workers.values() {
            worker.lock().resume();
        }
    }

    pub fn core_state(&self, core: CoreId) -> Result<CoreState> {
        Ok(self.inner.worker(core)?.lock().state())
    }

    /// Checks `core`'s memory, cache and accelerators. A core that fails the
    /// check is marked `Failed`, taken out of placement and reported for
    /// recovery.
    pub fn verify_core_integrity(&self, core: CoreId) -> Result<bool> {
        {
            let worker = self.inner.worker(core)?.lock();
            if worker.verify_integrity() {
                return Ok(true);
            }
            worker.slot().set_state(CoreState::Failed);
        }
        log::warn!("Core {} failed its integrity check.", core);
        self.inner.balancer.mark_core_unhealthy(core)?;
        self.inner
            .failures
            .push(FailureReport::new(core, "integrity check failed"));
        self.inner.monitor_signal.notify();
        Ok(false)
    }

    /// Number of tasks waiting in `core`'s queue.
    pub fn queued_tasks(&self, core: CoreId) -> Result<usize> {
        self.inner
            .registry
            .get(core)
            .map(|slot| slot.queue.len())
            .ok_or(FleetError::UnknownCore(core))
    }

    pub fn core_ids(&self) -> Vec<CoreId> {
        self.inner.registry.core_ids()
    }

    pub fn rebalance_load(&self) -> Result<usize> {
        self.inner.balancer.rebalance_load()
    }

    pub fn optimize_distribution(&self) -> Result<Vec<CoreId>> {
        self.inner.balancer.optimize_distribution(&*self.inner)
    }

    pub fn reset_breaker(&self, core: CoreId) {
        self.inner.recovery.reset_breaker(core);
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.inner.balancer
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }
}

impl<E: Executor> Drop for WorkerFleet<E> {
    fn drop(&mut self) {
        if self.is_running() {
            match self.shutdown() {
                Ok(tasks) if !tasks.is_empty() => {
                    log::warn!("Fleet dropped with {} unfinished tasks.", tasks.len())
                }
                Ok(_) => {}
                Err(e) => log::error!("Fleet shutdown on drop failed: {}", e),
            }
        }
    }
}

impl<E: Executor> FleetInner<E> {
    fn worker(&self, core: CoreId) -> Result<&Mutex<CoreWorker<E>>> {
        self.workers.get(&core).ok_or(FleetError::UnknownCore(core))
    }

    fn handle_core_failure(&self, core: CoreId) -> Result<RecoveryOutcome> {
        self.recovery.handle_core_failure(core, self)
    }

    fn process_failure_reports(&self) -> usize {
        let reports = self.failures.take_all();
        let mut seen = HashSet::new();
        let mut handled = 0;

        // Oldest first; one recovery per core per batch.
        for report in reports.into_iter().rev() {
            if !seen.insert(report.core_id) {
                continue;
            }
            log::warn!(
                "Core {} reported failure {:?} ago: {}",
                report.core_id,
                report.reported_at.elapsed(),
                report.reason
            );
            match self.handle_core_failure(report.core_id) {
                Ok(outcome) => {
                    log::debug!("Core {} recovery outcome: {:?}", report.core_id, outcome);
                    handled += 1;
                }
                Err(e) => log::error!("Recovery of core {} failed: {}", report.core_id, e),
            }
        }
        handled
    }

    fn monitor_tick(&self) -> Result<SystemMetrics> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("Monitor tick {}.", tick);

        // --- 1. Collect metrics and detect unhealthy cores ---
        for (&core, worker) in &self.workers {
            if self.recovery.is_in_flight(core) {
                continue;
            }
            let mut sample = worker.lock().sample_metrics();
            if self.recovery.is_quarantined(core) {
                sample.is_healthy = false;
            }
            let previous = self.balancer.get_core_metrics(core)?;
            self.balancer.update_core_metrics(core, sample)?;

            if sample.is_healthy {
                if !previous.is_healthy {
                    log::info!("Core {} is healthy again.", core);
                }
                self.recovery.note_healthy(core);
            } else if previous.is_healthy {
                log::warn!("Core {} failed its health check.", core);
                self.failures
                    .push(FailureReport::new(core, "health check failed"));
            } else if self.recovery.retry_due(core) {
                self.failures
                    .push(FailureReport::new(core, "retrying recovery after backoff"));
            }
        }

        // --- 2. Failure mailbox ---
        self.process_failure_reports();

        // --- 3. Resource adjustments and rebalancing ---
        for (core, metrics) in self.balancer.core_metrics()? {
            if metrics.is_healthy {
                self.balancer.adjust_resources(core, self)?;
            }
        }
        self.balancer.rebalance_load()?;
        self.balancer.optimize_distribution(self)?;

        // --- 4. Tasks left on unhealthy cores and stranded tasks ---
        let swept = self.recovery.sweep_unhealthy(None)?;
        if !swept.is_empty() {
            self.balancer.redistribute(swept)?;
        }
        self.balancer.retry_stranded()?;

        // --- 5. Forget old terminal tasks, then publish ---
        let pruned = self.tasks.prune_terminal(self.config.task_retention())?;
        if pruned > 0 {
            log::debug!("Pruned {} finished task records.", pruned);
        }
        let metrics = self.balancer.system_metrics(tick)?;
        self.balancer.publish_metrics(&metrics);
        Ok(metrics)
    }
}

impl<E: Executor> CoreControl for FleetInner<E> {
    fn backup_core_state(&self, core: CoreId) -> Option<StateSnapshot> {
        self.workers.get(&core)?.lock().backup_state()
    }

    fn cleanup_core(&self, core: CoreId) -> Vec<Task> {
        match self.workers.get(&core) {
            Some(worker) => worker.lock().cleanup(self.config.join_timeout()),
            None => Vec::new(),
        }
    }

    fn initialize_core(&self, core: CoreId) -> Result<()> {
        self.worker(core)?.lock().initialize(&*self.provider)
    }

    fn restore_core_state(&self, core: CoreId, snapshot: StateSnapshot) -> Result<()> {
        self.worker(core)?.lock().restore_state(snapshot)
    }

    fn start_core(&self, core: CoreId) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.worker(core)?.lock().start()
    }
}

impl<E: Executor> CoreTuning for FleetInner<E> {
    fn optimize_core(&self, core: CoreId) {
        if let Some(worker) = self.workers.get(&core) {
            worker.lock().optimize_cache();
        }
    }

    fn adjust_core_resources(&self, core: CoreId) {
        if let Some(worker) = self.workers.get(&core) {
            worker.lock().compact_memory();
        }
    }
}

fn run_monitor<E: Executor>(inner: Arc<FleetInner<E>>) {
    let interval = inner.config.monitor_interval();
    let stopped = || inner.monitor_stop.load(Ordering::Acquire);
    let paused = || inner.monitor_paused.load(Ordering::Acquire);
    log::debug!("Fleet monitor started (interval {:?}).", interval);

    let mut next_tick = Instant::now() + interval;
    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        inner.monitor_signal.wait_until(
            || stopped() || (!paused() && !inner.failures.is_empty()),
            wait,
        );
        if stopped() {
            break;
        }
        if paused() {
            next_tick = Instant::now() + interval;
            continue;
        }

        if !inner.failures.is_empty() {
            inner.process_failure_reports();
        }
        if Instant::now() >= next_tick {
            if let Err(e) = inner.monitor_tick() {
                log::error!("Monitor tick failed: {}", e);
            }
            next_tick = Instant::now() + interval;
        }
    }
    log::debug!("Fleet monitor stopped.");
}
