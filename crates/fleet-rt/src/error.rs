use crate::task::{CoreId, TaskId};
use fleet_sync::SyncError;
use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by an [`Executor`](crate::Executor) for a single task.
///
/// Only the task is marked failed; the core keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task execution failed: {reason}")]
pub struct TaskExecutionError {
    pub reason: String,
}

impl TaskExecutionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure reported by an external collaborator (resource, cache or
/// accelerator manager).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{component}: {message}")]
pub struct CollaboratorError {
    pub component: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum FleetError {
    #[error("Invalid configuration{}: {reason}", core_suffix(.core_id))]
    #[diagnostic(
        code("FLEET-001"),
        help("Check core ids, NUMA nodes, cache and memory limits, and threshold ranges")
    )]
    Configuration {
        core_id: Option<CoreId>,
        reason: String,
    },

    #[error("No healthy core is available to accept the task")]
    #[diagnostic(code("FLEET-002"), help("Wait for recovery or add cores to the fleet"))]
    NoAvailableCore,

    #[error("Core {0} is not part of this fleet")]
    #[diagnostic(code("FLEET-003"))]
    UnknownCore(CoreId),

    #[error("Task {0} is not known to this fleet")]
    #[diagnostic(code("FLEET-004"))]
    UnknownTask(TaskId),

    #[error(transparent)]
    #[diagnostic(code("FLEET-005"))]
    TaskExecution(#[from] TaskExecutionError),

    #[error("Core {core_id} failed: {reason}")]
    #[diagnostic(code("FLEET-006"))]
    CoreFailure { core_id: CoreId, reason: String },

    #[error("Recovery of core {core_id} failed: {reason}")]
    #[diagnostic(code("FLEET-007"))]
    RecoveryFailure { core_id: CoreId, reason: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidHierarchy(#[from] SyncError),

    #[error("Core {0} is already running")]
    #[diagnostic(code("FLEET-008"))]
    AlreadyRunning(CoreId),

    #[error("Failed to spawn thread {thread}")]
    #[diagnostic(code("FLEET-009"))]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read configuration file {}", .path.display())]
    #[diagnostic(code("FLEET-010"))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    #[diagnostic(code("FLEET-011"), help("The configuration is TOML; see FleetConfig for keys"))]
    ConfigParse(String),
}

fn core_suffix(core_id: &Option<CoreId>) -> String {
    core_id.map(|id| format!(" for core {id}")).unwrap_or_default()
}

impl FleetError {
    pub fn configuration(core_id: Option<CoreId>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            core_id,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
