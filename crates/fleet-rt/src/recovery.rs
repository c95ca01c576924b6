//! Failure detection follow-up: migrating work off unhealthy cores.
//!
//! For a failed core the coordinator
//!
//! 1. marks it unhealthy so the balancer stops selecting it,
//! 2. takes a backup of its queued and orphaned tasks and external state,
//! 3. if the breaker admits an attempt, tears it down and reinitializes it
//!    (a core that is down anyway is torn down regardless),
//! 4. on success restores its state, restarts it and redistributes the backup,
//! 5. on failure sweeps every unhealthy core and redistributes what it finds.
//!
//! Concurrent calls for the same core are collapsed by a per-core in-flight
//! marker, so each task is migrated exactly once. A circuit breaker spaces out
//! reinitialization attempts and quarantines cores whose reinitialization
//! keeps failing.

use crate::balancer::LoadBalancer;
use crate::collab::StateSnapshot;
use crate::config::RecoveryPolicy;
use crate::error::{FleetError, Result};
use crate::registry::{CoreState, Registry};
use crate::task::{CoreId, Task};
use dashmap::{DashMap, DashSet};
use fleet_sync::RetryBackoff;
use std::sync::Arc;
use std::time::Instant;

/// A core failure noticed by a worker thread or an external health check.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub core_id: CoreId,
    pub reason: String,
    pub reported_at: Instant,
}

impl FailureReport {
    pub fn new(core_id: CoreId, reason: impl Into<String>) -> Self {
        Self {
            core_id,
            reason: reason.into(),
            reported_at: Instant::now(),
        }
    }
}

/// Operations the coordinator needs from whoever owns the workers.
pub trait CoreControl {
    fn backup_core_state(&self, core: CoreId) -> Option<StateSnapshot>;
    /// Stops the core's thread and returns any tasks it still held.
    fn cleanup_core(&self, core: CoreId) -> Vec<Task>;
    fn initialize_core(&self, core: CoreId) -> Result<()>;
    fn restore_core_state(&self, core: CoreId, snapshot: StateSnapshot) -> Result<()>;
    fn start_core(&self, core: CoreId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The core was reinitialized; its tasks went to healthy cores.
    Recovered { migrated: usize },
    /// Reinitialization failed or was deferred; tasks were swept.
    Redistributed { migrated: usize },
    /// The breaker is open. The core stays down until its breaker is reset.
    Quarantined { migrated: usize },
    /// Another thread is already handling this core.
    AlreadyInProgress,
}

impl RecoveryOutcome {
    pub fn migrated(&self) -> usize {
        match *self {
            RecoveryOutcome::Recovered { migrated }
            | RecoveryOutcome::Redistributed { migrated }
            | RecoveryOutcome::Quarantined { migrated } => migrated,
            RecoveryOutcome::AlreadyInProgress => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Attempt(u32),
    Backoff,
    Open,
}

#[derive(Debug, Default, Clone, Copy)]
struct Breaker {
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
}

/// Removes the in-flight marker when recovery ends, including on early return.
struct InFlight<'a> {
    cores: &'a DashSet<CoreId>,
    core: CoreId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cores.remove(&self.core);
    }
}

pub struct FailureRecoveryCoordinator {
    balancer: Arc<LoadBalancer>,
    registry: Arc<Registry>,
    policy: RecoveryPolicy,
    backoff: RetryBackoff,
    in_flight: DashSet<CoreId>,
    breakers: DashMap<CoreId, Breaker>,
}

impl FailureRecoveryCoordinator {
    pub fn new(balancer: Arc<LoadBalancer>, registry: Arc<Registry>, policy: RecoveryPolicy) -> Self {
        let backoff = RetryBackoff::new(policy.base_backoff(), policy.max_backoff()).with_jitter();
        Self {
            balancer,
            registry,
            policy,
            backoff,
            in_flight: DashSet::new(),
            breakers: DashMap::new(),
        }
    }

    pub fn handle_core_failure(
        &self,
        core: CoreId,
        control: &dyn CoreControl,
    ) -> Result<RecoveryOutcome> {
        let slot = self
            .registry
            .get(core)
            .ok_or(FleetError::UnknownCore(core))?;

        if !self.in_flight.insert(core) {
            log::debug!("Recovery of core {} already in progress.", core);
            return Ok(RecoveryOutcome::AlreadyInProgress);
        }
        let _marker = InFlight {
            cores: &self.in_flight,
            core,
        };
        log::warn!("Handling failure of core {}.", core);

        // --- 1. Stop routing new work to the core ---
        self.balancer.mark_core_unhealthy(core)?;

        // --- 2. Backup ---
        let mut backlog = slot.queue.drain();
        backlog.extend(slot.take_orphans());
        let state = control.backup_core_state(core);
        log::debug!("Core {}: backed up {} tasks.", core, backlog.len());

        // --- 3. Teardown and reinitialization ---
        let admission = self.admit(core);
        let live = matches!(slot.state(), CoreState::Running | CoreState::Paused);
        let recovered = match admission {
            Admission::Attempt(attempt) => {
                backlog.extend(control.cleanup_core(core));
                log::info!("Reinitializing core {} (attempt {}).", core, attempt);
                match self.reinitialize(core, state, control) {
                    Ok(()) => {
                        self.record_success(core);
                        true
                    }
                    Err(e) => {
                        log::error!("{}", e);
                        slot.set_state(CoreState::Failed);
                        false
                    }
                }
            }
            Admission::Backoff | Admission::Open => {
                // A core still running keeps its thread; a dead one is torn
                // down so its leftovers are collected.
                if !live {
                    backlog.extend(control.cleanup_core(core));
                }
                if admission == Admission::Open {
                    log::warn!("Core {} is quarantined; not reinitializing.", core);
                } else {
                    log::info!("Core {}: reinitialization deferred by backoff.", core);
                }
                false
            }
        };

        // --- 4. Success: redistribute the backup ---
        if recovered {
            let migrated = self.balancer.redistribute(backlog)?;
            log::info!("Core {} recovered; migrated {} tasks.", core, migrated);
            return Ok(RecoveryOutcome::Recovered { migrated });
        }

        // --- 5. Failure: sweep every unhealthy core ---
        backlog.extend(self.sweep_unhealthy(Some(core))?);
        let migrated = self.balancer.redistribute(backlog)?;
        log::info!(
            "Core {} left down; redistributed {} tasks from unhealthy cores.",
            core,
            migrated
        );
        Ok(if admission == Admission::Open {
            RecoveryOutcome::Quarantined { migrated }
        } else {
            RecoveryOutcome::Redistributed { migrated }
        })
    }

    fn reinitialize(
        &self,
        core: CoreId,
        state: Option<StateSnapshot>,
        control: &dyn CoreControl,
    ) -> Result<()> {
        let wrap = |e: FleetError| FleetError::RecoveryFailure {
            core_id: core,
            reason: e.to_string(),
        };
        control.initialize_core(core).map_err(wrap)?;
        if let Some(snapshot) = state {
            control.restore_core_state(core, snapshot).map_err(wrap)?;
        }
        control.start_core(core).map_err(wrap)
    }

    /// Drains queued and orphaned tasks from every unhealthy core that is not
    /// under recovery elsewhere. `current` is the core the caller is
    /// recovering, if any.
    pub fn sweep_unhealthy(&self, current: Option<CoreId>) -> Result<Vec<Task>> {
        let snapshot = self.balancer.core_metrics()?;
        let mut swept = Vec::new();
        for (&core, metrics) in &snapshot {
            if metrics.is_healthy || (Some(core) != current && self.in_flight.contains(&core)) {
                continue;
            }
            if let Some(slot) = self.registry.get(core) {
                let before = swept.len();
                swept.extend(slot.queue.drain());
                swept.extend(slot.take_orphans());
                if swept.len() > before {
                    log::debug!("Swept {} tasks from core {}.", swept.len() - before, core);
                }
            }
        }
        Ok(swept)
    }

    /// Decides whether to try reinitializing the core now. An attempt counts
    /// against the breaker until it succeeds.
    fn admit(&self, core: CoreId) -> Admission {
        let now = Instant::now();
        let mut breaker = self.breakers.entry(core).or_default();

        if breaker.consecutive_failures >= self.policy.max_attempts {
            return Admission::Open;
        }
        if breaker.next_attempt.is_some_and(|at| at > now) {
            return Admission::Backoff;
        }

        breaker.consecutive_failures += 1;
        let attempt = breaker.consecutive_failures;
        breaker.next_attempt = Some(now + self.backoff.delay_for(attempt));
        Admission::Attempt(attempt)
    }

    /// A successful reinitialization clears the failure count but keeps the
    /// backoff window, so a burst of reports does not tear the core down again.
    fn record_success(&self, core: CoreId) {
        if let Some(mut breaker) = self.breakers.get_mut(&core) {
            breaker.consecutive_failures = 0;
        }
    }

    /// Called when the core is seen healthy again; closes its breaker.
    pub fn note_healthy(&self, core: CoreId) {
        if self.breakers.remove(&core).is_some() {
            log::debug!("Core {} healthy again; breaker reset.", core);
        }
    }

    /// Operator override for a quarantined core.
    pub fn reset_breaker(&self, core: CoreId) {
        self.breakers.remove(&core);
        log::info!("Breaker for core {} reset.", core);
    }

    pub fn is_quarantined(&self, core: CoreId) -> bool {
        self.breakers
            .get(&core)
            .is_some_and(|b| b.consecutive_failures >= self.policy.max_attempts)
    }

    /// True when an unhealthy core may be reinitialized again: not quarantined
    /// and past its backoff.
    pub fn retry_due(&self, core: CoreId) -> bool {
        if self.in_flight.contains(&core) {
            return false;
        }
        let now = Instant::now();
        self.breakers.get(&core).map_or(true, |b| {
            b.consecutive_failures < self.policy.max_attempts
                && b.next_attempt.map_or(true, |at| at <= now)
        })
    }

    pub fn is_in_flight(&self, core: CoreId) -> bool {
        self.in_flight.contains(&core)
    }
}
