//! Fleet runtime: a fixed set of logical cores, each with its own queue and
//! thread, kept balanced and recovered after failures.
//!
//! The entry point is [`WorkerFleet`]. Work is described by [`Task`]s and run
//! by an [`Executor`]; collaborators such as resource and cache managers are
//! reached through the traits in [`collab`].

pub mod balancer;
pub mod collab;
pub mod config;
pub mod error;
pub mod fleet;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod table;
pub mod task;
pub mod worker;

pub use balancer::LoadBalancer;
pub use collab::{
    AcceleratorManager, CacheManager, CoreResources, CoreTuning, Executor, NoopProvider,
    NoopResources, ResourceManager, ResourceProvider, ResourceUsage, StateSnapshot,
};
pub use config::{CoreConfig, FleetConfig, RecoveryPolicy};
pub use error::{CollaboratorError, FleetError, Result, TaskExecutionError};
pub use fleet::{FleetBuilder, WorkerFleet};
pub use metrics::{CoreMetrics, StatusCounts, SystemMetrics, TaskMetrics};
pub use recovery::{CoreControl, FailureRecoveryCoordinator, FailureReport, RecoveryOutcome};
pub use registry::CoreState;
pub use router::{KindRouter, TaskSink};
pub use task::{CancelToken, CoreId, Payload, Task, TaskId, TaskIdAllocator, TaskKind, TaskPriority, TaskStatus};
pub use worker::CoreWorker;
