//! Per-unit circuit breakers.
//!
//! After `failure_threshold` consecutive failures a breaker opens and
//! refuses work for `reset_timeout`. It then admits exactly one probe
//! (half-open); a successful probe closes it, a failed one reopens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, work proceeds normally.
    Closed,
    /// Circuit is open, work is refused.
    Open,
    /// Cooldown elapsed, one probe is allowed through.
    HalfOpen,
}

/// Cumulative statistics for one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub unit_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub times_opened: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for one unit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    /// Current state.
    state: CircuitState,

    /// Number of consecutive failures.
    failure_count: u32,

    /// Failure threshold to open circuit.
    failure_threshold: u32,

    /// Time to wait before transitioning to half-open.
    reset_timeout: Duration,

    /// Time when circuit was opened.
    opened_at: Option<Instant>,

    /// Successful probes needed in half-open to close circuit.
    success_threshold: u32,

    /// Current success count in half-open state.
    half_open_successes: u32,

    /// A half-open probe has been admitted and not yet reported.
    probe_in_flight: bool,

    successes: u64,
    failures: u64,
    rejections: u64,
    times_opened: u64,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            opened_at: None,
            success_threshold: success_threshold.max(1),
            half_open_successes: 0,
            probe_in_flight: false,
            successes: 0,
            failures: 0,
            rejections: 0,
            times_opened: 0,
            last_failure_at: None,
        }
    }

    /// Get current state (may transition to half-open).
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.probe_in_flight = false;
                }
            }
        }
        self.state
    }

    /// Check if the circuit admits a request. In half-open only one probe
    /// is admitted until it reports back.
    pub fn allow_request(&mut self) -> bool {
        let allowed = match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => false,
        };
        if !allowed {
            self.rejections += 1;
        }
        allowed
    }

    /// Record a successful operation.
    pub fn record_success(&mut self) {
        self.successes += 1;
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.half_open_successes += 1;
                if self.half_open_successes >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation. Returns true if this call opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        self.last_failure_at = Some(Utc::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.open();
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.open();
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Release an admitted probe that ended without a verdict (e.g. cancelled).
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Time left before an open circuit admits a probe.
    pub fn retry_after(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.reset_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Reset the circuit breaker. Cumulative statistics are kept.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.half_open_successes = 0;
        self.probe_in_flight = false;
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
        self.times_opened += 1;
    }

    fn stats(&mut self, unit_id: &str) -> BreakerStats {
        BreakerStats {
            unit_id: unit_id.to_string(),
            state: self.state(),
            consecutive_failures: self.failure_count,
            failure_threshold: self.failure_threshold,
            cooldown_ms: self.reset_timeout.as_millis() as u64,
            successes: self.successes,
            failures: self.failures,
            rejections: self.rejections,
            times_opened: self.times_opened,
            last_failure_at: self.last_failure_at,
        }
    }
}

/// Breakers keyed by unit id, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold, cooldown, breakers: Mutex::new(HashMap::new()) }
    }

    /// Admit a request or fail with `CircuitOpen`.
    pub fn check(&self, unit_id: &str) -> BridgeResult<()> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(unit_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown, 1));

        if breaker.allow_request() {
            Ok(())
        } else {
            Err(BridgeError::CircuitOpen {
                unit: unit_id.to_string(),
                retry_after_ms: breaker.retry_after().as_millis() as u64,
            })
        }
    }

    pub fn record_success(&self, unit_id: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(unit_id) {
            breaker.record_success();
        }
    }

    /// Returns true if this failure opened the circuit.
    pub fn record_failure(&self, unit_id: &str) -> bool {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(unit_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown, 1));
        breaker.record_failure()
    }

    pub fn release_probe(&self, unit_id: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(unit_id) {
            breaker.release_probe();
        }
    }

    pub fn state(&self, unit_id: &str) -> CircuitState {
        self.breakers.lock().get_mut(unit_id).map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    pub fn stats(&self, unit_id: &str) -> Option<BreakerStats> {
        self.breakers.lock().get_mut(unit_id).map(|b| b.stats(unit_id))
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> =
            self.breakers.lock().iter_mut().map(|(id, b)| b.stats(id)).collect();
        stats.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        stats
    }

    /// Units whose breaker is currently refusing work.
    pub fn open_units(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .lock()
            .iter_mut()
            .filter_map(|(id, b)| (b.state() == CircuitState::Open).then(|| id.clone()))
            .collect();
        open.sort();
        open
    }

    pub fn reset(&self, unit_id: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(unit_id) {
            breaker.reset();
        }
    }

    pub fn remove(&self, unit_id: &str) {
        self.breakers.lock().remove(unit_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60), 1);

        assert!(cb.allow_request());
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(cb.retry_after() > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60), 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(!cb.allow_request(), "only one probe in flight");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_released_probe_can_be_retried() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        cb.release_probe();
        assert!(cb.allow_request());
    }

    #[test]
    fn test_registry_check_and_stats() {
        let breakers = CircuitBreakers::new(2, Duration::from_secs(60));
        assert!(breakers.check("acme.flaky").is_ok());
        breakers.record_failure("acme.flaky");
        breakers.record_failure("acme.flaky");

        let err = breakers.check("acme.flaky").unwrap_err();
        assert!(matches!(err, BridgeError::CircuitOpen { .. }));
        assert_eq!(breakers.open_units(), vec!["acme.flaky".to_string()]);

        let stats = breakers.stats("acme.flaky").unwrap();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.rejections, 1);
        assert_eq!(stats.times_opened, 1);

        breakers.reset("acme.flaky");
        assert!(breakers.check("acme.flaky").is_ok());
        assert_eq!(breakers.state("unknown"), CircuitState::Closed);
    }

    #[test]
    fn test_open_units_skips_cooled_down_breakers() {
        let cooled = CircuitBreakers::new(1, Duration::ZERO);
        cooled.record_failure("acme.quick");
        assert!(cooled.open_units().is_empty());
        assert_eq!(cooled.state("acme.quick"), CircuitState::HalfOpen);

        let held = CircuitBreakers::new(1, Duration::from_secs(60));
        held.record_failure("acme.slow");
        held.record_failure("acme.other");
        assert_eq!(held.open_units(), vec!["acme.other".to_string(), "acme.slow".to_string()]);
    }
}
