//! Traits for the collaborators a fleet drives but does not implement.
//!
//! Resource, cache and accelerator managers are provisioned per core by a
//! [`ResourceProvider`]. Task bodies run through an [`Executor`]. No-op
//! implementations are provided for tests and for fleets that do not need a
//! particular collaborator.

use crate::config::CoreConfig;
use crate::error::{CollaboratorError, TaskExecutionError};
use crate::task::{CoreId, Task};
use std::sync::Arc;

/// Usage figures reported by a core's resource manager, as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_usage: f64,
}

/// Opaque state captured before a core is reinitialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot(pub Vec<u8>);

pub trait ResourceManager: Send + Sync {
    fn get_metrics(&self) -> ResourceUsage;
    fn compact_memory(&self);
    fn verify_memory(&self) -> bool;

    fn bind_numa_node(&self, _node: usize) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn set_memory_limit(&self, _bytes: u64) {}

    fn backup_state(&self) -> Option<StateSnapshot> {
        None
    }

    fn restore_state(&self, _snapshot: StateSnapshot) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

pub trait CacheManager: Send + Sync {
    fn prefetch_hot_data(&self);
    fn set_cache_line_size(&self, bytes: usize);
    fn verify_cache(&self) -> bool;
}

pub trait AcceleratorManager: Send + Sync {
    fn initialize_gpu(&self) -> Result<(), CollaboratorError>;
    fn initialize_fpga(&self) -> Result<(), CollaboratorError>;
    fn verify_accelerators(&self) -> bool;
}

/// The managers owned by one core.
#[derive(Clone)]
pub struct CoreResources {
    pub resources: Arc<dyn ResourceManager>,
    pub cache: Arc<dyn CacheManager>,
    pub accelerators: Arc<dyn AcceleratorManager>,
}

impl CoreResources {
    pub fn noop() -> Self {
        let noop = Arc::new(NoopResources);
        Self {
            resources: noop.clone(),
            cache: noop.clone(),
            accelerators: noop,
        }
    }

    /// Memory, cache and accelerators all report healthy.
    pub fn verify(&self) -> bool {
        self.resources.verify_memory()
            && self.cache.verify_cache()
            && self.accelerators.verify_accelerators()
    }
}

impl std::fmt::Debug for CoreResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreResources").finish_non_exhaustive()
    }
}

/// Builds the managers for a core. Called on initialization and again on
/// every reinitialization after a failure.
pub trait ResourceProvider: Send + Sync {
    fn provision(&self, config: &CoreConfig) -> Result<CoreResources, CollaboratorError>;
}

/// Runs task bodies. One executor instance is shared by every core of a fleet.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: &Task) -> Result<(), TaskExecutionError>;
}

impl<F> Executor for F
where
    F: Fn(&Task) -> Result<(), TaskExecutionError> + Send + Sync + 'static,
{
    fn execute(&self, task: &Task) -> Result<(), TaskExecutionError> {
        self(task)
    }
}

/// Per-core tuning hooks invoked by the load balancer.
pub trait CoreTuning {
    /// Cache-level optimization for a core running hot or far from the average.
    fn optimize_core(&self, core: CoreId);
    /// Memory-level adjustment for a core under memory pressure.
    fn adjust_core_resources(&self, core: CoreId);
}

/// Collaborator that does nothing and always reports healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResources;

impl ResourceManager for NoopResources {
    fn get_metrics(&self) -> ResourceUsage {
        ResourceUsage::default()
    }

    fn compact_memory(&self) {}

    fn verify_memory(&self) -> bool {
        true
    }
}

impl CacheManager for NoopResources {
    fn prefetch_hot_data(&self) {}

    fn set_cache_line_size(&self, _bytes: usize) {}

    fn verify_cache(&self) -> bool {
        true
    }
}

impl AcceleratorManager for NoopResources {
    fn initialize_gpu(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn initialize_fpga(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn verify_accelerators(&self) -> bool {
        true
    }
}

/// Provisions [`NoopResources`] for every core.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

impl ResourceProvider for NoopProvider {
    fn provision(&self, _config: &CoreConfig) -> Result<CoreResources, CollaboratorError> {
        Ok(CoreResources::noop())
    }
}
