use crossbeam_utils::Backoff;
use rand::Rng;
use std::time::Duration;

/// Unbounded spin-wait used by the blocking paths of the primitives
/// (lock acquisition, grace-period waits).
///
/// Spins with crossbeam's `Backoff` first, then falls back to yielding the
/// thread once spinning stops paying off, and finally to short sleeps.
#[derive(Debug, Default)]
pub struct SpinWait {
    backoff: Backoff,
    yields: u32,
}

impl SpinWait {
    const MAX_YIELDS: u32 = 64;
    const PARK_INTERVAL: Duration = Duration::from_micros(50);

    pub fn new() -> Self {
        Self::default()
    }

    /// Waits one step. Never gives up; callers loop until their condition holds.
    pub fn wait(&mut self) {
        if !self.backoff.is_completed() {
            self.backoff.snooze();
        } else if self.yields < Self::MAX_YIELDS {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Self::PARK_INTERVAL);
        }
    }

    /// Resets the wait state after progress was made.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.yields = 0;
    }
}

/// Exponential delay schedule with optional jitter.
///
/// Used for spacing out retries of expensive operations such as core
/// reinitialization. The schedule is stateless: callers pass the attempt
/// number and get back the delay to wait before that attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    use_jitter: bool,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            use_jitter: false,
        }
    }

    /// Enables randomized jitter: the delay is drawn from `[d/2, d]`.
    pub fn with_jitter(mut self) -> Self {
        self.use_jitter = true;
        self
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 has no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);

        if self.use_jitter && !delay.is_zero() {
            let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
            let half = nanos / 2;
            let jittered = half + rand::rng().random_range(0..=nanos - half);
            Duration::from_nanos(jittered)
        } else {
            delay
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff =
            RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter();
        for _ in 0..100 {
            let delay = backoff.delay_for(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_spin_wait_escalates_without_panicking() {
        let mut wait = SpinWait::new();
        for _ in 0..200 {
            wait.wait();
        }
        wait.reset();
        wait.wait();
    }
}
