mod common;

use common::{init_logging, noop_executor, quiet_config, task_with, NoopExecutor};
use fleet_rt::{FleetError, KindRouter, TaskKind, TaskStatus, WorkerFleet};
use std::collections::HashSet;
use std::sync::Arc;

fn router() -> (KindRouter, Arc<WorkerFleet<NoopExecutor>>, Arc<WorkerFleet<NoopExecutor>>) {
    init_logging();
    let mut router = KindRouter::new();
    let compute = Arc::new(
        WorkerFleet::builder(quiet_config(2), noop_executor as NoopExecutor)
            .task_ids(router.task_ids())
            .build()
            .unwrap(),
    );
    let ledger = Arc::new(
        WorkerFleet::builder(quiet_config(1), noop_executor as NoopExecutor)
            .task_ids(router.task_ids())
            .build()
            .unwrap(),
    );
    router.register(TaskKind::Compute, compute.clone()).unwrap();
    router.register(TaskKind::Ledger, ledger.clone()).unwrap();
    (router, compute, ledger)
}

#[test]
fn test_tasks_are_routed_by_kind() {
    let (router, compute, ledger) = router();

    let c = router
        .submit_task(None, task_with(TaskKind::Compute, 1u32))
        .unwrap();
    let l = router
        .submit_task(None, task_with(TaskKind::Ledger, 2u32))
        .unwrap();

    assert_eq!(compute.get_task_status(c).unwrap(), TaskStatus::Pending);
    assert_eq!(compute.get_task_status(l).unwrap(), TaskStatus::Unknown);
    assert_eq!(ledger.get_task_status(l).unwrap(), TaskStatus::Pending);
    assert_eq!(router.get_task_status(l).unwrap(), TaskStatus::Pending);

    assert!(router.cancel_task(l).unwrap());
    assert_eq!(ledger.get_task_status(l).unwrap(), TaskStatus::Cancelled);
    assert_eq!(
        router.kinds().collect::<Vec<_>>(),
        vec![TaskKind::Compute, TaskKind::Ledger]
    );
}

#[test]
fn test_ids_are_unique_across_fleets() {
    let (router, _compute, _ledger) = router();
    let mut ids = HashSet::new();
    for i in 0..50u32 {
        let kind = if i % 2 == 0 {
            TaskKind::Compute
        } else {
            TaskKind::Ledger
        };
        assert!(ids.insert(router.submit_task(None, task_with(kind, i)).unwrap()));
    }
}

#[test]
fn test_unregistered_kind_has_no_core() {
    let (router, _compute, _ledger) = router();
    assert!(matches!(
        router.submit_task(None, task_with(TaskKind::Storage, ())),
        Err(FleetError::NoAvailableCore)
    ));
}

#[test]
fn test_kind_registered_once() {
    let (mut router, compute, _ledger) = router();
    assert!(matches!(
        router.register(TaskKind::Compute, compute),
        Err(FleetError::Configuration { .. })
    ));
}
