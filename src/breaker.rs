#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::EngineConfig;
use crate::metrics::{names, MetricsRegistry};
use crate::types::{
    BreakerKey, BuildRun, CircuitBreakerRecord, CircuitConfig, CircuitState, FailureType, TenantId,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

type Slot = Arc<Mutex<CircuitBreakerRecord>>;

/// Shared breakers keyed by `(tenant, failure class)`.
///
/// The outer map is only write-locked to insert a new key; every state change
/// happens under that key's own mutex.
pub struct CircuitBreakerRegistry {
    slots: RwLock<HashMap<BreakerKey, Slot>>,
    default_config: CircuitConfig,
    tenant_thresholds: HashMap<TenantId, u32>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(default_config: CircuitConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            default_config,
            tenant_thresholds: HashMap::new(),
            metrics,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let tenant_thresholds = config
            .tenants
            .iter()
            .filter_map(|(tenant, overrides)| {
                overrides
                    .circuit_failure_threshold
                    .map(|threshold| (TenantId::new(tenant.clone()), threshold))
            })
            .collect();
        Self {
            tenant_thresholds,
            ..Self::new(config.circuit_breaker, metrics)
        }
    }

    fn config_for(&self, tenant: &TenantId) -> CircuitConfig {
        self.tenant_thresholds
            .get(tenant)
            .map_or(self.default_config, |threshold| CircuitConfig {
                failure_threshold: *threshold,
                ..self.default_config
            })
    }

    async fn slot(&self, key: &BreakerKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitBreakerRecord::new(
                key.clone(),
                self.config_for(&key.tenant_id),
            )))
        }))
    }

    /// Whether a real retry may go ahead for this failure class.
    ///
    /// An open breaker refuses; a half-open breaker hands out a single trial.
    pub async fn admit(&self, tenant: &TenantId, failure_type: FailureType) -> bool {
        self.admit_at(tenant, failure_type, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        tenant: &TenantId,
        failure_type: FailureType,
        now: DateTime<Utc>,
    ) -> bool {
        let key = BreakerKey::new(tenant.clone(), failure_type);
        let slot = self.slot(&key).await;
        let mut record = slot.lock().await;
        let before = record.state;
        let (next, admitted) = record.clone().admit(now);
        *record = next;
        self.publish(&record, before).await;
        admitted
    }

    /// Current state without consuming a half-open trial.
    pub async fn state(&self, tenant: &TenantId, failure_type: FailureType) -> CircuitState {
        let key = BreakerKey::new(tenant.clone(), failure_type);
        let existing = self.slots.read().await.get(&key).map(Arc::clone);
        match existing {
            Some(slot) => slot.lock().await.clone().try_half_open(Utc::now()).state,
            None => CircuitState::Closed,
        }
    }

    pub async fn record_failure(&self, tenant: &TenantId, failure_type: FailureType) {
        self.record_failure_at(tenant, failure_type, Utc::now()).await;
    }

    pub async fn record_failure_at(
        &self,
        tenant: &TenantId,
        failure_type: FailureType,
        now: DateTime<Utc>,
    ) {
        self.record_failure_with(tenant, failure_type, None, now).await;
    }

    /// Record a failure seen by `run`. Its own threshold, when set, decides
    /// whether the tenant's breaker opens.
    pub async fn record_run_failure(&self, run: &BuildRun, failure_type: FailureType) {
        self.record_failure_with(
            &run.tenant_id,
            failure_type,
            run.circuit_failure_threshold,
            Utc::now(),
        )
        .await;
    }

    async fn record_failure_with(
        &self,
        tenant: &TenantId,
        failure_type: FailureType,
        threshold: Option<u32>,
        now: DateTime<Utc>,
    ) {
        let key = BreakerKey::new(tenant.clone(), failure_type);
        let slot = self.slot(&key).await;
        let mut record = slot.lock().await;
        let before = record.state;
        let threshold = threshold.unwrap_or(record.config.failure_threshold);
        *record = record.clone().record_failure_against(now, threshold);
        self.publish(&record, before).await;
    }

    pub async fn record_success(&self, tenant: &TenantId, failure_type: FailureType) {
        let key = BreakerKey::new(tenant.clone(), failure_type);
        let existing = self.slots.read().await.get(&key).map(Arc::clone);
        if let Some(slot) = existing {
            let mut record = slot.lock().await;
            let before = record.state;
            *record = record.clone().record_success(Utc::now());
            self.publish(&record, before).await;
        }
    }

    pub async fn snapshot(&self) -> Vec<CircuitBreakerRecord> {
        let slots: Vec<Slot> = self.slots.read().await.values().map(Arc::clone).collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.lock().await.clone());
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    async fn publish(&self, record: &CircuitBreakerRecord, before: CircuitState) {
        if record.state != before {
            let tenant_id = record.key.tenant_id.value();
            let failure_type = record.key.failure_type.as_str();
            match record.state {
                CircuitState::Open => warn!(
                    tenant_id,
                    failure_type,
                    failures = record.failure_count(),
                    "circuit breaker opened"
                ),
                CircuitState::HalfOpen | CircuitState::Closed => info!(
                    tenant_id,
                    failure_type,
                    from = before.as_str(),
                    to = record.state.as_str(),
                    "circuit breaker transition"
                ),
            }
        }
        self.metrics
            .set_gauge(
                names::CIRCUIT_BREAKER_STATE,
                &[
                    ("tenant", record.key.tenant_id.value()),
                    ("failure_type", record.key.failure_type.as_str()),
                ],
                record.state.as_gauge(),
            )
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::TenantOverrides;
    use chrono::Duration;

    fn registry(threshold: u32) -> (CircuitBreakerRegistry, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        (
            CircuitBreakerRegistry::new(
                CircuitConfig::new(threshold, 300, 60),
                Arc::clone(&metrics),
            ),
            metrics,
        )
    }

    #[tokio::test]
    async fn given_threshold_failures_when_admitting_then_retry_is_refused() {
        let (breakers, metrics) = registry(2);
        let tenant = TenantId::new("acme");
        assert!(breakers.admit(&tenant, FailureType::Transient).await);

        breakers.record_failure(&tenant, FailureType::Transient).await;
        breakers.record_failure(&tenant, FailureType::Transient).await;

        assert!(!breakers.admit(&tenant, FailureType::Transient).await);
        assert_eq!(
            breakers.state(&tenant, FailureType::Transient).await,
            CircuitState::Open
        );
        let snapshot = metrics.snapshot().await;
        assert_eq!(
            snapshot.gauge(
                names::CIRCUIT_BREAKER_STATE,
                &[("tenant", "acme"), ("failure_type", "transient")]
            ),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn breakers_are_partitioned_by_tenant_and_failure_class() {
        let (breakers, _) = registry(1);
        let acme = TenantId::new("acme");
        let globex = TenantId::new("globex");

        breakers.record_failure(&acme, FailureType::RateLimit).await;

        assert!(!breakers.admit(&acme, FailureType::RateLimit).await);
        assert!(breakers.admit(&acme, FailureType::Lint).await);
        assert!(breakers.admit(&globex, FailureType::RateLimit).await);
    }

    #[tokio::test]
    async fn cooldown_allows_one_trial_and_success_closes() {
        let (breakers, _) = registry(1);
        let tenant = TenantId::new("acme");
        let start = Utc::now();
        breakers
            .record_failure_at(&tenant, FailureType::Timeout, start)
            .await;

        let later = start + Duration::seconds(61);
        assert!(breakers.admit_at(&tenant, FailureType::Timeout, later).await);
        assert!(!breakers.admit_at(&tenant, FailureType::Timeout, later).await);

        breakers.record_success(&tenant, FailureType::Timeout).await;
        assert_eq!(
            breakers.state(&tenant, FailureType::Timeout).await,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn tenant_threshold_override_applies() {
        let mut config = EngineConfig::default();
        config.tenants.insert(
            "fragile".to_string(),
            TenantOverrides {
                circuit_failure_threshold: Some(1),
                budget: None,
            },
        );
        let breakers = CircuitBreakerRegistry::from_config(&config, Arc::new(MetricsRegistry::new()));

        breakers
            .record_failure(&TenantId::new("fragile"), FailureType::Lint)
            .await;
        breakers
            .record_failure(&TenantId::new("sturdy"), FailureType::Lint)
            .await;

        let snapshot = breakers.snapshot().await;
        let states: Vec<_> = snapshot
            .iter()
            .map(|record| (record.key.tenant_id.value().to_string(), record.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("fragile".to_string(), CircuitState::Open),
                ("sturdy".to_string(), CircuitState::Closed),
            ]
        );
    }

    fn run_with_threshold(threshold: Option<u32>) -> BuildRun {
        BuildRun::new(
            &crate::types::SubmitBuild {
                tenant_id: TenantId::new("acme"),
                spec_id: crate::types::SpecId::new("contacts"),
                plan_id: crate::types::PlanId::new("plan-1"),
                goal_text: "add a contacts page".to_string(),
                max_iterations: 3,
                budgets: None,
                circuit_failure_threshold: threshold,
            },
            crate::types::BudgetLimits::default(),
            "v1",
        )
    }

    #[tokio::test]
    async fn run_threshold_overrides_the_tenant_threshold() {
        let (breakers, _) = registry(5);
        let tenant = TenantId::new("acme");

        breakers
            .record_run_failure(&run_with_threshold(None), FailureType::Lint)
            .await;
        assert_eq!(breakers.state(&tenant, FailureType::Lint).await, CircuitState::Closed);

        breakers
            .record_run_failure(&run_with_threshold(Some(2)), FailureType::Lint)
            .await;
        assert_eq!(breakers.state(&tenant, FailureType::Lint).await, CircuitState::Open);
        assert!(!breakers.admit(&tenant, FailureType::Lint).await);
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let (breakers, _) = registry(1_000);
        let breakers = Arc::new(breakers);
        let tenant = TenantId::new("acme");

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let breakers = Arc::clone(&breakers);
                let tenant = tenant.clone();
                tokio::spawn(async move {
                    breakers.record_failure(&tenant, FailureType::Transient).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = breakers.snapshot().await;
        assert_eq!(snapshot[0].failure_count(), 50);
    }
}
