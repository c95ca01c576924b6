// Shared helpers for fleet integration tests
#![allow(dead_code)]

use fleet_rt::{
    Executor, FleetConfig, Payload, Task, TaskExecutionError, TaskId, TaskKind, TaskPriority,
    TaskStatus, WorkerFleet,
};
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A config whose monitor only runs when a test asks it to.
pub fn quiet_config(cores: usize) -> FleetConfig {
    let mut config = FleetConfig::with_cores(cores);
    config.monitor_interval_ms = 60_000;
    config.join_timeout_ms = 2_000;
    config
}

pub type NoopExecutor = fn(&Task) -> Result<(), TaskExecutionError>;

pub fn noop_executor(_task: &Task) -> Result<(), TaskExecutionError> {
    Ok(())
}

pub fn idle_fleet(cores: usize) -> WorkerFleet<NoopExecutor> {
    init_logging();
    WorkerFleet::new(quiet_config(cores), noop_executor as NoopExecutor)
        .expect("fleet should build")
}

pub fn task() -> Task {
    Task::new(TaskKind::Compute, TaskPriority::Normal, Payload::empty())
}

pub fn task_with<T: std::any::Any + Send + Sync>(kind: TaskKind, payload: T) -> Task {
    Task::new(kind, TaskPriority::Normal, Payload::new(payload))
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn wait_for_status<E: Executor>(
    fleet: &WorkerFleet<E>,
    id: TaskId,
    status: TaskStatus,
) -> bool {
    wait_for(Duration::from_secs(5), || {
        fleet.get_task_status(id).ok() == Some(status)
    })
}
