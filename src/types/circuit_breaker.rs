#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{FailureType, TenantId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: closed=0, half_open=1, open=2.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl TryFrom<&str> for CircuitState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" | "half-open" => Ok(Self::HalfOpen),
            _ => Err(format!("Unknown circuit state: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl CircuitConfig {
    #[must_use]
    pub const fn new(failure_threshold: u32, window_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            failure_threshold,
            window_secs,
            cooldown_secs,
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::new(5, 300, 300)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakerKey {
    pub tenant_id: TenantId,
    pub failure_type: FailureType,
}

impl BreakerKey {
    #[must_use]
    pub const fn new(tenant_id: TenantId, failure_type: FailureType) -> Self {
        Self {
            tenant_id,
            failure_type,
        }
    }
}

/// Breaker state for one `(tenant, failure class)`.
///
/// Failures are counted over a time-based rolling window of `window_secs`.
/// A half-open breaker admits exactly one trial at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub key: BreakerKey,
    pub state: CircuitState,
    pub failure_times: VecDeque<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
    pub updated_at: DateTime<Utc>,
    pub config: CircuitConfig,
}

impl CircuitBreakerRecord {
    #[must_use]
    pub fn new(key: BreakerKey, config: CircuitConfig) -> Self {
        Self {
            key,
            state: CircuitState::Closed,
            failure_times: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
            updated_at: Utc::now(),
            config,
        }
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failure_times.len()
    }

    fn prune_window(&mut self, now: DateTime<Utc>) {
        let window = Duration::seconds(i64::try_from(self.config.window_secs).unwrap_or(i64::MAX));
        while self
            .failure_times
            .front()
            .is_some_and(|oldest| now.signed_duration_since(*oldest) > window)
        {
            self.failure_times.pop_front();
        }
    }

    #[must_use]
    pub fn should_open(&self) -> bool {
        self.reaches(self.config.failure_threshold)
    }

    fn reaches(&self, threshold: u32) -> bool {
        matches!(self.state, CircuitState::Closed) && self.failure_count() >= threshold as usize
    }

    /// Move `open` to `half_open` once the cooldown elapsed.
    #[must_use]
    pub fn try_half_open(mut self, now: DateTime<Utc>) -> Self {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                let elapsed = u64::try_from(now.signed_duration_since(opened_at).num_seconds())
                    .unwrap_or(0);
                if elapsed >= self.config.cooldown_secs {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                    self.updated_at = now;
                }
            }
        }
        self
    }

    /// Whether a retry may proceed. A half-open breaker hands out one trial.
    #[must_use]
    pub fn admit(mut self, now: DateTime<Utc>) -> (Self, bool) {
        self = self.try_half_open(now);
        let admitted = match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                // A trial whose outcome never arrived is abandoned after one cooldown.
                let trial_abandoned = u64::try_from(
                    now.signed_duration_since(self.updated_at).num_seconds(),
                )
                .is_ok_and(|elapsed| elapsed >= self.config.cooldown_secs);
                if self.trial_in_flight && !trial_abandoned {
                    false
                } else {
                    self.trial_in_flight = true;
                    self.updated_at = now;
                    true
                }
            }
        };
        (self, admitted)
    }

    #[must_use]
    pub fn record_failure(self, now: DateTime<Utc>) -> Self {
        let threshold = self.config.failure_threshold;
        self.record_failure_against(now, threshold)
    }

    /// Record a failure, opening a closed breaker once `threshold` failures
    /// sit in the window.
    #[must_use]
    pub fn record_failure_against(mut self, now: DateTime<Utc>, threshold: u32) -> Self {
        self.updated_at = now;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_in_flight = false;
                self.failure_times.push_back(now);
                self.prune_window(now);
            }
            CircuitState::Closed => {
                self.failure_times.push_back(now);
                self.prune_window(now);
                if self.reaches(threshold) {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Open => {
                self.failure_times.push_back(now);
                self.prune_window(now);
            }
        }
        self
    }

    #[must_use]
    pub fn record_success(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = now;
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.opened_at = None;
            self.trial_in_flight = false;
            self.failure_times.clear();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window_secs: u64, cooldown_secs: u64) -> CircuitBreakerRecord {
        CircuitBreakerRecord::new(
            BreakerKey::new(TenantId::new("acme"), FailureType::Transient),
            CircuitConfig::new(threshold, window_secs, cooldown_secs),
        )
    }

    #[test]
    fn circuit_state_roundtrip_preserves_values() {
        let cases = [
            (CircuitState::Closed, "closed"),
            (CircuitState::Open, "open"),
            (CircuitState::HalfOpen, "half_open"),
        ];

        for (state, expected) in cases {
            assert_eq!(state.as_str(), expected);
            assert_eq!(CircuitState::try_from(expected), Ok(state));
        }
        assert_eq!(
            CircuitState::try_from("half-open"),
            Ok(CircuitState::HalfOpen)
        );
    }

    #[test]
    fn circuit_breaker_record_transitions_to_open_after_failures() {
        let now = Utc::now();
        let record = breaker(3, 300, 60)
            .record_failure(now)
            .record_failure(now)
            .record_failure(now);
        assert_eq!(record.state, CircuitState::Open);
        assert!(record.opened_at.is_some());
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let start = Utc::now();
        let record = breaker(3, 60, 60)
            .record_failure(start)
            .record_failure(start)
            .record_failure(start + Duration::seconds(120));
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count(), 1);
    }

    #[test]
    fn half_open_admits_single_trial_then_closes_on_success() {
        let start = Utc::now();
        let record = breaker(1, 300, 60).record_failure(start);
        let (record, admitted) = record.admit(start + Duration::seconds(10));
        assert!(!admitted);
        assert_eq!(record.state, CircuitState::Open);

        let later = start + Duration::seconds(61);
        let (record, first) = record.admit(later);
        let (record, second) = record.admit(later);
        assert!(first);
        assert!(!second);
        assert_eq!(record.state, CircuitState::HalfOpen);

        let record = record.record_success(later);
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count(), 0);
    }

    #[test]
    fn abandoned_half_open_trial_is_reissued_after_cooldown() {
        let start = Utc::now();
        let later = start + Duration::seconds(61);
        let (record, first) = breaker(1, 300, 60).record_failure(start).admit(later);
        assert!(first);
        let (record, blocked) = record.admit(later + Duration::seconds(30));
        assert!(!blocked);
        let (record, reissued) = record.admit(later + Duration::seconds(61));
        assert!(reissued);
        assert_eq!(record.state, CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_trial_failure_reopens() {
        let start = Utc::now();
        let later = start + Duration::seconds(61);
        let (record, admitted) = breaker(1, 300, 60).record_failure(start).admit(later);
        assert!(admitted);
        let record = record.record_failure(later);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_at, Some(later));
    }

    #[test]
    fn circuit_config_default_provides_sensible_defaults() {
        let config = CircuitConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.window_secs, 300);
        assert_eq!(config.cooldown_secs, 300);
    }
}
