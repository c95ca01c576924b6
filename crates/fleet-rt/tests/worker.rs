mod common;

use common::{
    idle_fleet, init_logging, noop_executor, quiet_config, task, task_with, wait_for,
    wait_for_status, NoopExecutor,
};
use fleet_rt::{
    CacheManager, CollaboratorError, CoreConfig, CoreResources, CoreState, ResourceProvider,
    Task, TaskExecutionError, TaskKind, TaskStatus, WorkerFleet,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Instruction carried in a task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Block,
    Fail,
    Panic,
}

fn step(task: &Task) -> Option<Step> {
    task.payload.downcast_ref::<Step>().copied()
}

#[test]
fn test_pause_lets_current_task_finish() {
    init_logging();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executed);

    let fleet = WorkerFleet::new(
        quiet_config(1),
        move |t: &Task| -> Result<(), TaskExecutionError> {
            counter.fetch_add(1, Ordering::SeqCst);
            if step(t) == Some(Step::Block) {
                let _ = started_tx.lock().send(t.id);
                let _ = release_rx.lock().recv();
            }
            Ok(())
        },
    )
    .unwrap();
    fleet.start().unwrap();

    let blocking = fleet
        .submit_task(Some(0), task_with(TaskKind::Compute, Step::Block))
        .unwrap();
    assert_eq!(
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        blocking
    );
    let queued = fleet.submit_task(Some(0), task()).unwrap();

    assert!(fleet.pause_core(0).unwrap());
    assert_eq!(fleet.core_state(0).unwrap(), CoreState::Paused);
    release_tx.send(()).unwrap();

    assert!(wait_for_status(&fleet, blocking, TaskStatus::Completed));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fleet.get_task_status(queued).unwrap(), TaskStatus::Pending);
    assert_eq!(fleet.queued_tasks(0).unwrap(), 1);
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    assert!(fleet.resume_core(0).unwrap());
    assert!(wait_for_status(&fleet, queued, TaskStatus::Completed));
    assert_eq!(executed.load(Ordering::SeqCst), 2);
    fleet.shutdown().unwrap();
}

#[test]
fn test_task_error_does_not_fail_core() {
    init_logging();
    let fleet = WorkerFleet::new(
        quiet_config(1),
        |t: &Task| -> Result<(), TaskExecutionError> {
            match step(t) {
                Some(Step::Fail) => Err(TaskExecutionError::new("bad input")),
                _ => Ok(()),
            }
        },
    )
    .unwrap();
    fleet.start().unwrap();

    let failing = fleet
        .submit_task(None, task_with(TaskKind::Compute, Step::Fail))
        .unwrap();
    let fine = fleet.submit_task(None, task()).unwrap();

    assert!(wait_for_status(&fleet, failing, TaskStatus::Failed));
    assert!(wait_for_status(&fleet, fine, TaskStatus::Completed));
    assert_eq!(fleet.core_state(0).unwrap(), CoreState::Running);
    fleet.shutdown().unwrap();
}

#[test]
fn test_panicking_task_is_migrated_once() {
    init_logging();
    let panicked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&panicked);
    let fleet = WorkerFleet::new(
        quiet_config(2),
        move |t: &Task| -> Result<(), TaskExecutionError> {
            if step(t) == Some(Step::Panic) && !flag.swap(true, Ordering::SeqCst) {
                panic!("simulated crash");
            }
            Ok(())
        },
    )
    .unwrap();
    fleet.start().unwrap();

    let id = fleet
        .submit_task(Some(0), task_with(TaskKind::Compute, Step::Panic))
        .unwrap();

    assert!(wait_for_status(&fleet, id, TaskStatus::Completed));
    assert!(panicked.load(Ordering::SeqCst));
    assert!(wait_for(Duration::from_secs(5), || {
        fleet.core_state(0).ok() == Some(CoreState::Running)
    }));
    fleet.shutdown().unwrap();
}

#[test]
fn test_task_that_keeps_crashing_is_failed() {
    init_logging();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let fleet = WorkerFleet::new(
        quiet_config(2),
        move |t: &Task| -> Result<(), TaskExecutionError> {
            if step(t) == Some(Step::Panic) {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("simulated crash");
            }
            Ok(())
        },
    )
    .unwrap();
    fleet.start().unwrap();

    let id = fleet
        .submit_task(Some(0), task_with(TaskKind::Compute, Step::Panic))
        .unwrap();

    assert!(wait_for_status(&fleet, id, TaskStatus::Failed));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    fleet.shutdown().unwrap();
}

#[test]
fn test_cancelled_task_is_skipped() {
    init_logging();
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executed);
    let fleet = WorkerFleet::new(
        quiet_config(1),
        move |_: &Task| -> Result<(), TaskExecutionError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();
    fleet.start().unwrap();
    assert!(fleet.pause_core(0).unwrap());

    let cancelled = fleet.submit_task(None, task()).unwrap();
    let kept = fleet.submit_task(None, task()).unwrap();
    assert!(fleet.cancel_task(cancelled).unwrap());
    assert!(!fleet.cancel_task(cancelled).unwrap());

    assert!(fleet.resume_core(0).unwrap());
    assert!(wait_for_status(&fleet, kept, TaskStatus::Completed));
    assert_eq!(
        fleet.get_task_status(cancelled).unwrap(),
        TaskStatus::Cancelled
    );
    assert_eq!(executed.load(Ordering::SeqCst), 1);
    fleet.shutdown().unwrap();
}

#[test]
fn test_shutdown_returns_unrun_tasks_cancelled() {
    let fleet = idle_fleet(2);
    let ids: Vec<_> = (0..3)
        .map(|_| fleet.submit_task(None, task()).unwrap())
        .collect();

    let unfinished = fleet.shutdown().unwrap();
    assert_eq!(unfinished.len(), 3);
    for id in ids {
        assert_eq!(fleet.get_task_status(id).unwrap(), TaskStatus::Cancelled);
    }
    assert_eq!(fleet.core_state(0).unwrap(), CoreState::Stopped);
}

#[test]
fn test_start_twice_is_harmless() {
    let fleet = idle_fleet(1);
    fleet.start().unwrap();
    fleet.start().unwrap();
    assert!(fleet.is_running());
    fleet.shutdown().unwrap();
    assert!(!fleet.is_running());
}

#[test]
fn test_integrity_reflects_initialization() {
    let fleet = idle_fleet(1);
    assert!(fleet.verify_core_integrity(0).unwrap());
    assert!(fleet.verify_core_integrity(5).is_err());
}

/// Cache whose verification result is flipped by the test.
struct SwitchableCache(Arc<AtomicBool>);

impl CacheManager for SwitchableCache {
    fn prefetch_hot_data(&self) {}

    fn set_cache_line_size(&self, _bytes: usize) {}

    fn verify_cache(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }
}

struct SwitchableProvider(Arc<AtomicBool>);

impl ResourceProvider for SwitchableProvider {
    fn provision(&self, _config: &CoreConfig) -> Result<CoreResources, CollaboratorError> {
        Ok(CoreResources {
            cache: Arc::new(SwitchableCache(Arc::clone(&self.0))),
            ..CoreResources::noop()
        })
    }
}

#[test]
fn test_failed_integrity_check_reports_core() {
    init_logging();
    let broken = Arc::new(AtomicBool::new(false));
    let fleet = WorkerFleet::builder(quiet_config(2), noop_executor as NoopExecutor)
        .provider(SwitchableProvider(Arc::clone(&broken)))
        .build()
        .unwrap();
    assert!(fleet.verify_core_integrity(0).unwrap());

    broken.store(true, Ordering::SeqCst);
    assert!(!fleet.verify_core_integrity(0).unwrap());
    assert_eq!(fleet.core_state(0).unwrap(), CoreState::Failed);
    assert!(!fleet.balancer().is_core_healthy(0).unwrap());
    assert_eq!(fleet.balancer().select_core().unwrap(), Some(1));

    broken.store(false, Ordering::SeqCst);
    assert_eq!(fleet.process_failure_reports(), 1);
    assert_eq!(fleet.core_state(0).unwrap(), CoreState::Running);
    assert!(fleet.verify_core_integrity(0).unwrap());
}
