#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::QuarantineConfig;
use crate::error::{EngineError, Result};
use crate::store::RunStore;
use crate::types::{
    CaseKey, QuarantineCase, QuarantineGating, QuarantineId, QuarantineStatus, SuiteId, TenantId,
};
use chrono::{DateTime, Duration, Utc};
use futures_util::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Lifecycle of quarantined evaluation cases, scoped per (tenant, suite, case).
pub struct QuarantineManager {
    store: Arc<dyn RunStore>,
    ttl: Duration,
    gating: QuarantineGating,
    // Serialises check-then-insert in `add`.
    admission: Mutex<()>,
}

impl QuarantineManager {
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, config: QuarantineConfig) -> Self {
        Self {
            store,
            ttl: Duration::seconds(
                i64::try_from(config.ttl_secs)
                    .unwrap_or(MAX_TTL_SECS)
                    .min(MAX_TTL_SECS),
            ),
            gating: config.gating,
            admission: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn gating(&self) -> QuarantineGating {
        self.gating
    }

    /// Quarantine a case. While an active, unexpired record exists for the key
    /// it is returned unchanged instead of creating a second one.
    ///
    /// # Errors
    /// Returns a store error if the record cannot be read or written.
    pub async fn add(&self, key: CaseKey, reason: &str, flake_score: f64) -> Result<QuarantineCase> {
        self.add_at(key, reason, flake_score, Utc::now()).await
    }

    /// # Errors
    /// Returns a store error if the record cannot be read or written.
    pub async fn add_at(
        &self,
        key: CaseKey,
        reason: &str,
        flake_score: f64,
        now: DateTime<Utc>,
    ) -> Result<QuarantineCase> {
        let _admission = self.admission.lock().await;

        if let Some(existing) = self.store.find_active_quarantine(key.clone()).await? {
            if existing.is_in_force(now) {
                debug!(
                    tenant_id = key.tenant_id.value(),
                    suite_id = key.suite_id.value(),
                    case_id = key.case_id.value(),
                    quarantine_id = %existing.id,
                    "case already quarantined"
                );
                return Ok(existing);
            }
            self.expire_if_active(existing, now).await?;
        }

        let case = QuarantineCase {
            id: QuarantineId::generate(),
            key: key.clone(),
            reason: reason.to_string(),
            flake_score: flake_score.clamp(0.0, 1.0),
            status: QuarantineStatus::Active,
            created_at: now,
            expires_at: now + self.ttl,
            updated_at: now,
        };
        match self.store.insert_quarantine(case.clone()).await {
            Ok(()) => {
                info!(
                    tenant_id = key.tenant_id.value(),
                    suite_id = key.suite_id.value(),
                    case_id = key.case_id.value(),
                    quarantine_id = %case.id,
                    flake_score = case.flake_score,
                    expires_at = %case.expires_at,
                    "case quarantined"
                );
                Ok(case)
            }
            // Another process won the race; its record is the active one.
            Err(EngineError::Duplicate(_)) => self
                .store
                .find_active_quarantine(key)
                .await?
                .ok_or_else(|| EngineError::Internal("active quarantine vanished".to_string())),
            Err(error) => Err(error),
        }
    }

    /// # Errors
    /// Returns a store error if the lookup fails.
    pub async fn is_quarantined(&self, key: &CaseKey) -> Result<bool> {
        self.is_quarantined_at(key, Utc::now()).await
    }

    /// # Errors
    /// Returns a store error if the lookup fails.
    pub async fn is_quarantined_at(&self, key: &CaseKey, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .store
            .find_active_quarantine(key.clone())
            .await?
            .is_some_and(|case| case.is_in_force(now)))
    }

    /// # Errors
    /// Returns `EngineError::QuarantineNotFound` for an unknown id and
    /// `EngineError::InvalidTransition` when the record is no longer active.
    pub async fn release(&self, id: QuarantineId) -> Result<QuarantineCase> {
        let _admission = self.admission.lock().await;
        let mut case = self
            .store
            .get_quarantine(id)
            .await?
            .ok_or_else(|| EngineError::QuarantineNotFound(id.to_string()))?;
        if case.status != QuarantineStatus::Active {
            return Err(EngineError::InvalidTransition {
                from: case.status.as_str().to_string(),
                to: QuarantineStatus::ManualReleased.as_str().to_string(),
            });
        }
        case.status = QuarantineStatus::ManualReleased;
        case.updated_at = Utc::now();
        self.store.update_quarantine(case.clone()).await?;
        info!(
            tenant_id = case.key.tenant_id.value(),
            suite_id = case.key.suite_id.value(),
            case_id = case.key.case_id.value(),
            quarantine_id = %case.id,
            "quarantine released"
        );
        Ok(case)
    }

    /// Mark every active record past its TTL as expired.
    ///
    /// # Errors
    /// Returns a store error if records cannot be read or written.
    pub async fn sweep(&self) -> Result<Vec<QuarantineCase>> {
        self.sweep_at(Utc::now()).await
    }

    /// # Errors
    /// Returns a store error if records cannot be read or written.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<QuarantineCase>> {
        let lapsed = self
            .store
            .list_active_quarantine()
            .await?
            .into_iter()
            .filter(|case| now >= case.expires_at)
            .map(|case| self.expire_if_active(case, now));
        Ok(try_join_all(lapsed).await?.into_iter().flatten().collect())
    }

    /// # Errors
    /// Returns a store error if the listing fails.
    pub async fn list(&self, tenant_id: TenantId, suite_id: SuiteId) -> Result<Vec<QuarantineCase>> {
        self.store.list_quarantine(tenant_id, suite_id).await
    }

    /// Expire a record unless another writer already moved it out of `active`.
    async fn expire_if_active(
        &self,
        case: QuarantineCase,
        now: DateTime<Utc>,
    ) -> Result<Option<QuarantineCase>> {
        let id = case.id;
        match self.expire(case, now).await {
            Ok(expired) => Ok(Some(expired)),
            Err(EngineError::InvalidTransition { from, .. }) => {
                debug!(quarantine_id = %id, status = %from, "quarantine left before expiry");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn expire(&self, mut case: QuarantineCase, now: DateTime<Utc>) -> Result<QuarantineCase> {
        case.status = QuarantineStatus::Expired;
        case.updated_at = now;
        self.store.update_quarantine(case.clone()).await?;
        info!(
            tenant_id = case.key.tenant_id.value(),
            suite_id = case.key.suite_id.value(),
            case_id = case.key.case_id.value(),
            quarantine_id = %case.id,
            "quarantine expired"
        );
        Ok(case)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::InMemoryRunStore;
    use crate::types::CaseId;

    fn manager() -> QuarantineManager {
        QuarantineManager::new(Arc::new(InMemoryRunStore::new()), QuarantineConfig::default())
    }

    fn key(tenant: &str) -> CaseKey {
        CaseKey::new(
            TenantId::new(tenant),
            SuiteId::new("smoke"),
            CaseId::new("checkout"),
        )
    }

    #[tokio::test]
    async fn given_active_record_when_added_again_then_existing_is_returned() {
        let manager = manager();
        let first = manager.add(key("acme"), "flaky", 0.8).await.unwrap();
        let second = manager.add(key("acme"), "flaky again", 0.9).await.unwrap();

        assert_eq!(first.id, second.id);
        let listed = manager
            .list(TenantId::new("acme"), SuiteId::new("smoke"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_adds_create_one_active_record() {
        let manager = Arc::new(manager());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.add(key("acme"), "flaky", 0.8).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let listed = manager
            .list(TenantId::new("acme"), SuiteId::new("smoke"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn quarantine_is_scoped_per_tenant() {
        let manager = manager();
        manager.add(key("acme"), "flaky", 0.8).await.unwrap();

        assert!(manager.is_quarantined(&key("acme")).await.unwrap());
        assert!(!manager.is_quarantined(&key("globex")).await.unwrap());
    }

    #[tokio::test]
    async fn release_marks_manual_released_once() {
        let manager = manager();
        let case = manager.add(key("acme"), "flaky", 0.8).await.unwrap();

        let released = manager.release(case.id).await.unwrap();
        assert_eq!(released.status, QuarantineStatus::ManualReleased);
        assert!(!manager.is_quarantined(&key("acme")).await.unwrap());
        assert_eq!(manager.release(case.id).await.unwrap_err().code(), "CONFLICT");
        assert_eq!(
            manager.release(QuarantineId::generate()).await.unwrap_err().code(),
            "NOTFOUND"
        );
    }

    #[tokio::test]
    async fn sweep_expires_records_past_ttl() {
        let manager = manager();
        let start = Utc::now() - Duration::days(8);
        manager.add_at(key("acme"), "flaky", 0.8, start).await.unwrap();

        assert!(!manager.is_quarantined(&key("acme")).await.unwrap());
        let expired = manager.sweep().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, QuarantineStatus::Expired);
        assert!(manager.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_that_lands_before_expiry_write_is_kept() {
        let store = Arc::new(InMemoryRunStore::new());
        let manager = QuarantineManager::new(store.clone(), QuarantineConfig::default());
        let start = Utc::now() - Duration::days(8);
        let listed_by_sweep = manager.add_at(key("acme"), "flaky", 0.8, start).await.unwrap();

        manager.release(listed_by_sweep.id).await.unwrap();
        let expired = manager
            .expire_if_active(listed_by_sweep.clone(), Utc::now())
            .await
            .unwrap();

        assert!(expired.is_none());
        let stored = store.get_quarantine(listed_by_sweep.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QuarantineStatus::ManualReleased);
    }

    #[tokio::test]
    async fn release_after_expiry_is_a_conflict() {
        let manager = manager();
        let start = Utc::now() - Duration::days(8);
        let case = manager.add_at(key("acme"), "flaky", 0.8, start).await.unwrap();

        assert_eq!(manager.sweep().await.unwrap().len(), 1);
        assert_eq!(manager.release(case.id).await.unwrap_err().code(), "CONFLICT");
    }

    #[tokio::test]
    async fn lapsed_record_is_replaced_on_add() {
        let manager = manager();
        let start = Utc::now() - Duration::days(8);
        let old = manager.add_at(key("acme"), "flaky", 0.8, start).await.unwrap();
        let fresh = manager.add(key("acme"), "still flaky", 0.9).await.unwrap();

        assert_ne!(old.id, fresh.id);
        let listed = manager
            .list(TenantId::new("acme"), SuiteId::new("smoke"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed
                .iter()
                .filter(|case| case.status == QuarantineStatus::Active)
                .count(),
            1
        );
    }
}
