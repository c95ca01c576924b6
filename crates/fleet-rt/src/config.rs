use crate::error::{FleetError, Result};
use crate::task::CoreId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Per-core settings. Immutable once the core's worker has been created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Fleet-unique core id
    pub core_id: CoreId,

    /// NUMA node the core's memory should be bound to
    #[serde(default)]
    pub numa_node: usize,

    /// Cache budget in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Memory limit in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    #[serde(default)]
    pub enable_simd: bool,

    #[serde(default)]
    pub enable_gpu: bool,

    #[serde(default)]
    pub enable_fpga: bool,
}

impl CoreConfig {
    pub fn new(core_id: CoreId) -> Self {
        Self {
            core_id,
            numa_node: 0,
            cache_size: default_cache_size(),
            memory_limit: default_memory_limit(),
            enable_simd: false,
            enable_gpu: false,
            enable_fpga: false,
        }
    }

    pub fn with_numa_node(mut self, node: usize) -> Self {
        self.numa_node = node;
        self
    }

    pub fn with_simd(mut self, enabled: bool) -> Self {
        self.enable_simd = enabled;
        self
    }

    pub fn with_accelerators(mut self, gpu: bool, fpga: bool) -> Self {
        self.enable_gpu = gpu;
        self.enable_fpga = fpga;
        self
    }

    pub fn validate(&self, numa_nodes: usize) -> Result<()> {
        let fail = |reason: String| Err(FleetError::configuration(Some(self.core_id), reason));
        if self.cache_size == 0 {
            return fail("cache_size must be non-zero".to_string());
        }
        if self.memory_limit == 0 {
            return fail("memory_limit must be non-zero".to_string());
        }
        if self.numa_node >= numa_nodes {
            return fail(format!(
                "numa_node {} is out of range (fleet has {} nodes)",
                self.numa_node, numa_nodes
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings for core reinitialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Consecutive failure events after which a core is quarantined
    pub max_attempts: u32,

    /// Delay before the second reinitialization attempt, doubled per attempt
    pub base_backoff_ms: u64,

    /// Upper bound for the reinitialization delay
    pub max_backoff_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 30_000,
        }
    }
}

impl RecoveryPolicy {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Fleet-wide settings, usually loaded from TOML.
///
/// ```toml
/// monitor_interval_ms = 500
///
/// [[cores]]
/// core_id = 0
/// enable_simd = true
///
/// [recovery]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub cores: Vec<CoreConfig>,

    /// Number of NUMA nodes available to the fleet
    pub numa_nodes: usize,

    /// Monitor tick interval
    pub monitor_interval_ms: u64,

    /// Usage level above which a core is considered overloaded
    pub overload_threshold: f64,

    /// CPU deviation from the fleet average that triggers per-core tuning
    pub deviation_threshold: f64,

    /// How long to wait for a worker thread to exit before detaching it
    pub join_timeout_ms: u64,

    /// How long finished tasks stay queryable before the monitor forgets them
    pub task_retention_ms: u64,

    pub recovery: RecoveryPolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            cores: Vec::new(),
            numa_nodes: 1,
            monitor_interval_ms: 1_000,
            overload_threshold: 0.8,
            deviation_threshold: 0.2,
            join_timeout_ms: 5_000,
            task_retention_ms: 300_000,
            recovery: RecoveryPolicy::default(),
        }
    }
}

pub fn default_cache_size() -> usize {
    1 << 20
}

pub fn default_memory_limit() -> u64 {
    1 << 30
}

impl FleetConfig {
    /// A fleet of `count` default cores with ids `0..count`.
    pub fn with_cores(count: usize) -> Self {
        Self {
            cores: (0..count).map(CoreConfig::new).collect(),
            ..Self::default()
        }
    }

    /// One core per available CPU.
    pub fn detect() -> Self {
        let count = num_cpus::get();
        log::debug!("Detected {} CPUs; sizing fleet accordingly.", count);
        Self::with_cores(count)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: FleetConfig =
            toml::from_str(source).map_err(|e| FleetError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| FleetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.numa_nodes == 0 {
            return Err(FleetError::configuration(None, "numa_nodes must be at least 1"));
        }
        if self.monitor_interval_ms == 0 {
            return Err(FleetError::configuration(
                None,
                "monitor_interval_ms must be non-zero",
            ));
        }
        for (name, value) in [
            ("overload_threshold", self.overload_threshold),
            ("deviation_threshold", self.deviation_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(FleetError::configuration(
                    None,
                    format!("{name} must be in (0, 1], got {value}"),
                ));
            }
        }
        if self.recovery.max_attempts == 0 {
            return Err(FleetError::configuration(
                None,
                "recovery.max_attempts must be at least 1",
            ));
        }

        let mut seen = HashSet::with_capacity(self.cores.len());
        for core in &self.cores {
            if !seen.insert(core.core_id) {
                return Err(FleetError::configuration(
                    Some(core.core_id),
                    "duplicate core id",
                ));
            }
            core.validate(self.numa_nodes)?;
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = FleetConfig::from_toml_str(
            r#"
            [[cores]]
            core_id = 3
            enable_simd = true
            "#,
        )
        .unwrap();

        assert_eq!(config.cores.len(), 1);
        assert_eq!(config.cores[0].core_id, 3);
        assert!(config.cores[0].enable_simd);
        assert_eq!(config.cores[0].cache_size, default_cache_size());
        assert_eq!(config.monitor_interval_ms, 1_000);
        assert_eq!(config.recovery.max_attempts, 3);
    }

    #[test]
    fn test_duplicate_core_rejected() {
        let mut config = FleetConfig::with_cores(2);
        config.cores[1].core_id = 0;
        assert!(matches!(
            config.validate(),
            Err(FleetError::Configuration { core_id: Some(0), .. })
        ));
    }

    #[test]
    fn test_numa_node_out_of_range() {
        let mut config = FleetConfig::with_cores(1);
        config.cores[0].numa_node = 2;
        config.numa_nodes = 2;
        assert!(config.validate().is_err());
        config.numa_nodes = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_range() {
        let mut config = FleetConfig::with_cores(1);
        config.overload_threshold = 1.5;
        assert!(config.validate().is_err());
        config.overload_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(
            FleetConfig::from_toml_str("cores = 7"),
            Err(FleetError::ConfigParse(_))
        ));
    }
}
