use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conclave_core::config::BreakerConfig;

/// Breaker position for one (agent, tool-server) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure-isolation state machine for one (agent, tool-server) pair.
///
/// Opens after `failure_threshold` consecutive failures from closed. Once
/// `next_retry_at` elapses, exactly one probe call is allowed (half-open);
/// a probe success fully resets the breaker, a probe failure reopens it
/// with doubled backoff up to `max_backoff_ms`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    current_backoff: Duration,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let base = Duration::from_millis(config.base_backoff_ms);
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            current_backoff: base,
            last_failure_at: None,
            next_retry_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Milliseconds until the next probe is allowed, if the breaker is open.
    pub fn retry_in_ms(&self) -> Option<u64> {
        match self.state {
            BreakerState::Open => self.next_retry_at.map(|at| {
                at.saturating_duration_since(Instant::now()).as_millis() as u64
            }),
            _ => None,
        }
    }

    /// Whether a call may proceed right now. Transitions open → half-open
    /// when the retry deadline has elapsed; half-open admits exactly one
    /// probe at a time.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let due = self
                    .next_retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    debug!("Breaker entering half-open probe");
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                debug!("Breaker probe succeeded, closing");
                self.reset();
            }
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_at = Some(Instant::now());
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.current_backoff = Duration::from_millis(self.config.base_backoff_ms);
                    self.open();
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: reopen with doubled backoff, capped.
                let doubled = self.current_backoff.as_millis() as u64 * 2;
                self.current_backoff =
                    Duration::from_millis(doubled.min(self.config.max_backoff_ms));
                self.probe_in_flight = false;
                self.open();
            }
            BreakerState::Open => {}
        }
    }

    fn open(&mut self) {
        warn!(
            backoff_ms = self.current_backoff.as_millis() as u64,
            failures = self.failure_count,
            "Breaker opened"
        );
        self.state = BreakerState::Open;
        // Jitter the retry deadline (1.0x to 1.2x) so a herd of breakers
        // for the same flapping server does not probe in lockstep.
        let jitter = 1.0 + rand::random::<f64>() * 0.2;
        let wait = Duration::from_millis((self.current_backoff.as_millis() as f64 * jitter) as u64);
        self.next_retry_at = Some(Instant::now() + wait);
    }

    fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.current_backoff = Duration::from_millis(self.config.base_backoff_ms);
        self.next_retry_at = None;
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            base_backoff_ms: 20,
            max_backoff_ms: 80,
            call_timeout_secs: 1,
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // Two failures after the reset — still below the threshold of 3.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.can_execute());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Probe in flight — no second call allowed.
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn half_open_failure_doubles_backoff_to_ceiling() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.current_backoff.as_millis(), 20);

        // Fail three probes: 20 → 40 → 80 → 80 (capped).
        for expected_ms in [40u128, 80, 80] {
            // Sleep past the jittered deadline (backoff * 1.2 at most).
            tokio::time::sleep(breaker.current_backoff * 2).await;
            assert!(breaker.can_execute());
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Open);
            assert_eq!(breaker.current_backoff.as_millis(), expected_ms);
        }
    }

    #[tokio::test]
    async fn retry_deadline_is_reported_while_open() {
        let mut breaker = CircuitBreaker::new(fast_config());
        assert!(breaker.retry_in_ms().is_none());
        for _ in 0..3 {
            breaker.record_failure();
        }
        let remaining = breaker.retry_in_ms().expect("open breaker reports deadline");
        assert!(remaining <= 24);
    }
}
