use crate::task::CoreId;
use fleet_sync::{HierarchicalLock, SyncError};
use std::collections::BTreeMap;
use std::time::Instant;

pub const CPU_WEIGHT: f64 = 0.4;
pub const MEMORY_WEIGHT: f64 = 0.3;
pub const NETWORK_WEIGHT: f64 = 0.3;

/// Last reported load of one core. Usage figures are fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_usage: f64,
    pub queue_size: usize,
    pub active_tasks: usize,
    pub last_update: Instant,
    pub is_healthy: bool,
}

impl CoreMetrics {
    /// A healthy core with no load.
    pub fn idle() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            network_usage: 0.0,
            queue_size: 0,
            active_tasks: 0,
            last_update: Instant::now(),
            is_healthy: true,
        }
    }

    pub fn with_usage(cpu: f64, memory: f64, network: f64) -> Self {
        Self {
            cpu_usage: cpu,
            memory_usage: memory,
            network_usage: network,
            ..Self::idle()
        }
    }

    /// Weighted composite load; lower is better.
    pub fn load_score(&self) -> f64 {
        CPU_WEIGHT * self.cpu_usage
            + MEMORY_WEIGHT * self.memory_usage
            + NETWORK_WEIGHT * self.network_usage
    }

    pub fn is_overloaded(&self, threshold: f64) -> bool {
        self.cpu_usage > threshold
            || self.memory_usage > threshold
            || self.network_usage > threshold
    }

    /// Clamps usage into `[0, 1]`. NaN is read as fully loaded.
    pub(crate) fn sanitized(mut self) -> Self {
        for value in [
            &mut self.cpu_usage,
            &mut self.memory_usage,
            &mut self.network_usage,
        ] {
            *value = if value.is_nan() { 1.0 } else { (*value).clamp(0.0, 1.0) };
        }
        self
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::idle()
    }
}

/// Per-task resource accounting, as reported by executors or collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_usage: f64,
    pub queue_size: usize,
    pub active_tasks: usize,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn live(&self) -> usize {
        self.pending + self.running
    }
}

/// Snapshot handed to metrics callbacks after each monitor tick.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub tick: u64,
    pub cores: BTreeMap<CoreId, CoreMetrics>,
    pub healthy_cores: usize,
    pub queued_tasks: usize,
    pub stranded_tasks: usize,
    pub tasks: StatusCounts,
}

impl SystemMetrics {
    pub fn average_cpu(&self) -> f64 {
        average_healthy_cpu(&self.cores).unwrap_or(0.0)
    }
}

pub(crate) fn average_healthy_cpu(cores: &BTreeMap<CoreId, CoreMetrics>) -> Option<f64> {
    let (sum, count) = cores
        .values()
        .filter(|m| m.is_healthy)
        .fold((0.0, 0usize), |(sum, count), m| (sum + m.cpu_usage, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Least-loaded healthy core, skipping `exclude`. Ties go to the lowest id.
pub fn select_core(cores: &BTreeMap<CoreId, CoreMetrics>, exclude: &[CoreId]) -> Option<CoreId> {
    cores
        .iter()
        .filter(|(id, m)| m.is_healthy && !exclude.contains(*id))
        .min_by(|(a_id, a), (b_id, b)| {
            a.load_score()
                .total_cmp(&b.load_score())
                .then(a_id.cmp(b_id))
        })
        .map(|(id, _)| *id)
}

/// Core metrics behind their own hierarchical lock.
///
/// Never held together with the task table: callers copy a snapshot, release,
/// and then act.
#[derive(Debug, Default)]
pub struct MetricsTable {
    cores: HierarchicalLock<BTreeMap<CoreId, CoreMetrics>>,
}

impl MetricsTable {
    pub const LOCK_LEVEL: u64 = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<BTreeMap<CoreId, CoreMetrics>, SyncError> {
        Ok(self.cores.lock(Self::LOCK_LEVEL)?.clone())
    }

    pub fn get(&self, core: CoreId) -> Result<Option<CoreMetrics>, SyncError> {
        Ok(self.cores.lock(Self::LOCK_LEVEL)?.get(&core).copied())
    }

    pub fn contains(&self, core: CoreId) -> Result<bool, SyncError> {
        Ok(self.cores.lock(Self::LOCK_LEVEL)?.contains_key(&core))
    }

    /// Last write wins.
    pub fn update(&self, core: CoreId, metrics: CoreMetrics) -> Result<(), SyncError> {
        self.cores
            .lock(Self::LOCK_LEVEL)?
            .insert(core, metrics.sanitized());
        Ok(())
    }

    /// Flags the core unhealthy. Returns whether it was healthy before.
    pub fn mark_unhealthy(&self, core: CoreId) -> Result<bool, SyncError> {
        let mut cores = self.cores.lock(Self::LOCK_LEVEL)?;
        Ok(match cores.get_mut(&core) {
            Some(metrics) => {
                let was_healthy = metrics.is_healthy;
                metrics.is_healthy = false;
                metrics.last_update = Instant::now();
                was_healthy
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(CoreId, CoreMetrics)]) -> BTreeMap<CoreId, CoreMetrics> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_composite_score_weights() {
        let m = CoreMetrics::with_usage(1.0, 0.5, 0.0);
        assert!((m.load_score() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_select_lowest_score() {
        let cores = table(&[
            (0, CoreMetrics::with_usage(0.9, 0.9, 0.9)),
            (1, CoreMetrics::with_usage(0.1, 0.1, 0.1)),
            (2, CoreMetrics::with_usage(0.5, 0.5, 0.5)),
        ]);
        assert_eq!(select_core(&cores, &[]), Some(1));
        assert_eq!(select_core(&cores, &[1]), Some(2));
    }

    #[test]
    fn test_ties_break_to_lowest_id() {
        let cores = table(&[
            (4, CoreMetrics::with_usage(0.2, 0.2, 0.2)),
            (2, CoreMetrics::with_usage(0.2, 0.2, 0.2)),
            (7, CoreMetrics::with_usage(0.2, 0.2, 0.2)),
        ]);
        for _ in 0..10 {
            assert_eq!(select_core(&cores, &[]), Some(2));
        }
    }

    #[test]
    fn test_unhealthy_cores_never_selected() {
        let mut sick = CoreMetrics::idle();
        sick.is_healthy = false;
        let cores = table(&[(0, sick)]);
        assert_eq!(select_core(&cores, &[]), None);
        assert_eq!(select_core(&BTreeMap::new(), &[]), None);
    }

    #[test]
    fn test_sanitize_clamps_and_rejects_nan() {
        let m = CoreMetrics::with_usage(f64::NAN, 1.7, -0.3).sanitized();
        assert_eq!(m.cpu_usage, 1.0);
        assert_eq!(m.memory_usage, 1.0);
        assert_eq!(m.network_usage, 0.0);
    }

    #[test]
    fn test_mark_unhealthy_reports_previous_state() {
        let metrics = MetricsTable::new();
        metrics.update(3, CoreMetrics::idle()).unwrap();
        assert!(metrics.mark_unhealthy(3).unwrap());
        assert!(!metrics.mark_unhealthy(3).unwrap());
        assert!(!metrics.get(3).unwrap().unwrap().is_healthy);
        assert!(!metrics.mark_unhealthy(9).unwrap());
    }
}
