use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are skipped until `until`.
    Open { until: Instant },
    /// One trial call is in flight; others are skipped until it reports back.
    HalfOpen,
}

/// Opens after `failure_threshold` consecutive failures, lets a single trial call
/// through once `cooldown` has elapsed, and closes again on success.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a call may proceed at `now`. An expired open breaker moves to
    /// half-open and admits the caller as the trial call.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen => false,
        }
    }

    /// The trial call admitted by [`try_acquire`](Self::try_acquire) was cancelled
    /// before reporting back. Says nothing about the encoder, so no failure is
    /// counted; the next caller becomes the trial call.
    pub fn abandon(&mut self, now: Instant) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open { until: now };
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    /// Count a failure or timeout.
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = match self.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.consecutive_failures >= self.failure_threshold,
            BreakerState::Open { .. } => false,
        };
        if trip {
            self.state = BreakerState::Open {
                until: now + self.cooldown,
            };
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "rerank circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(10);

    #[test]
    fn opens_after_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, COOLDOWN);
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire(now));

        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Open { until: now + COOLDOWN });
        assert!(!breaker.try_acquire(now));
    }

    #[test]
    fn success_resets_failure_count() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, COOLDOWN);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn half_open_admits_one_trial_call() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure(now);

        let later = now + COOLDOWN;
        assert!(breaker.try_acquire(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.try_acquire(later));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire(later));
    }

    #[test]
    fn abandoned_trial_call_admits_the_next_caller() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure(now);

        let later = now + COOLDOWN;
        assert!(breaker.try_acquire(later));
        breaker.abandon(later);
        assert_eq!(breaker.consecutive_failures(), 1);
        assert!(breaker.try_acquire(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn abandon_leaves_closed_and_open_alone() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.abandon(now);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure(now);
        breaker.abandon(now);
        assert_eq!(breaker.state(), BreakerState::Open { until: now + COOLDOWN });
    }

    #[test]
    fn failed_trial_call_reopens() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(5, COOLDOWN);
        for _ in 0..5 {
            breaker.record_failure(now);
        }
        let later = now + COOLDOWN;
        assert!(breaker.try_acquire(later));
        breaker.record_failure(later);
        assert_eq!(breaker.state(), BreakerState::Open { until: later + COOLDOWN });
    }
}
