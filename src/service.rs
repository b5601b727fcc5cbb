#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::canary::CanaryComparison;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::flake::{FlakeAnalysis, FlakeClass, FlakeDetector};
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::{EnginePorts, RunOrchestrator};
use crate::ports::{CodeGenBackend, EvalHarness};
use crate::store::{InMemoryRunStore, PgRunStore, RunStore};
use crate::types::{
    BuildRun, CaseKey, CircuitBreakerRecord, EvalSuite, QuarantineCase, QuarantineId,
    ReplanRequest, ReviewerId, RunEvent, RunId, RunStatusView, SpecId, SubmitBuild,
    SubmitReceipt, SuiteId, TenantId,
};
use crate::worker::WorkerPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Flake analysis of one case, plus the quarantine record it triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReview {
    pub key: CaseKey,
    pub analysis: FlakeAnalysis,
    pub quarantine: Option<QuarantineCase>,
}

/// Public entry point: submit, poll and administer build runs.
pub struct BuildLoopEngine {
    orchestrator: Arc<RunOrchestrator>,
    flake: FlakeDetector,
    pool: RwLock<Option<WorkerPool>>,
}

impl BuildLoopEngine {
    #[must_use]
    pub fn new(config: EngineConfig, ports: EnginePorts) -> Self {
        let flake = FlakeDetector::new(config.flake.clone());
        Self {
            orchestrator: Arc::new(RunOrchestrator::new(config, ports)),
            flake,
            pool: RwLock::new(None),
        }
    }

    /// Build an engine whose store follows `database_url`: Postgres when set,
    /// in-memory otherwise.
    ///
    /// # Errors
    /// Returns a store error if Postgres is unreachable or the schema fails to apply.
    pub async fn from_config(
        config: EngineConfig,
        backend: Arc<dyn CodeGenBackend>,
        harness: Arc<dyn EvalHarness>,
    ) -> Result<Self> {
        let store: Arc<dyn RunStore> = match config.database_url.as_deref() {
            Some(url) => {
                let max_connections =
                    u32::try_from(config.worker.pool_size.saturating_add(2)).unwrap_or(u32::MAX);
                let store = PgRunStore::connect(url, max_connections).await?;
                store.initialize_schema().await?;
                Arc::new(store)
            }
            None => Arc::new(InMemoryRunStore::new()),
        };
        Ok(Self::new(
            config,
            EnginePorts {
                store,
                backend,
                harness,
            },
        ))
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    /// Start the worker pool and re-enqueue runs left unfinished by a previous
    /// process. Returns how many runs were recovered.
    ///
    /// # Errors
    /// Returns `EngineError::WorkerError` if already started or the queue overflows.
    pub async fn start(&self) -> Result<usize> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Err(EngineError::WorkerError("engine already started".to_string()));
        }
        let recovered = self.orchestrator.recover_incomplete_runs().await?;
        let pool = slot.insert(WorkerPool::start(
            Arc::clone(&self.orchestrator),
            self.orchestrator.config().worker,
        ));
        for run_id in &recovered {
            pool.enqueue(*run_id).await?;
        }
        Ok(recovered.len())
    }

    pub async fn register_suite(&self, spec_id: SpecId, suite: EvalSuite) {
        self.orchestrator.register_suite(spec_id, suite).await;
    }

    /// Persist a new run and schedule it on the worker pool. A run the pool
    /// refuses is failed with `NotScheduled` before the error is returned.
    ///
    /// # Errors
    /// Returns `EngineError::ConfigError` for invalid requests and
    /// `EngineError::WorkerError` when the engine is not running or its queue is full.
    pub async fn submit(&self, request: SubmitBuild) -> Result<SubmitReceipt> {
        let pool = self.pool.read().await;
        let pool = pool
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("engine not started".to_string()))?;
        let run = self.orchestrator.submit(request).await?;
        let run_id = run.id;
        if let Err(error) = pool.enqueue(run_id).await {
            self.orchestrator
                .abandon_unscheduled(run, error.to_string())
                .await?;
            return Err(error);
        }
        Ok(SubmitReceipt { run_id })
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` for an unknown run.
    pub async fn poll(&self, run_id: RunId) -> Result<RunStatusView> {
        self.orchestrator.status_view(run_id).await
    }

    /// Poll until the run no longer needs a worker.
    ///
    /// # Errors
    /// Returns `EngineError::WorkerError` if the run is still moving after `timeout`.
    pub async fn wait_until_settled(&self, run_id: RunId, timeout: Duration) -> Result<RunStatusView> {
        tokio::time::timeout(timeout, self.settled(run_id)).await.map_err(|_| {
            EngineError::WorkerError(format!(
                "run {run_id} did not settle within {}ms",
                timeout.as_millis()
            ))
        })?
    }

    async fn settled(&self, run_id: RunId) -> Result<RunStatusView> {
        loop {
            let view = self.poll(run_id).await?;
            if !view.status.needs_worker() {
                return Ok(view);
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// # Errors
    /// Returns `EngineError::ApprovalError` unless the run waits on that gate.
    pub async fn approve(&self, run_id: RunId, iteration: u32, reviewer: ReviewerId) -> Result<BuildRun> {
        self.orchestrator
            .resolve_approval(run_id, iteration, reviewer, true)
            .await
    }

    /// # Errors
    /// Returns `EngineError::ApprovalError` unless the run waits on that gate.
    pub async fn reject(&self, run_id: RunId, iteration: u32, reviewer: ReviewerId) -> Result<BuildRun> {
        self.orchestrator
            .resolve_approval(run_id, iteration, reviewer, false)
            .await
    }

    /// # Errors
    /// Returns `EngineError::InvalidTransition` for a finished run.
    pub async fn cancel(&self, run_id: RunId) -> Result<BuildRun> {
        self.orchestrator.cancel(run_id).await
    }

    /// # Errors
    /// Returns `EngineError::InvalidTransition` unless the run is `completed`.
    pub async fn rollback(&self, run_id: RunId) -> Result<BuildRun> {
        self.orchestrator.rollback(run_id).await
    }

    /// # Errors
    /// Returns a store error if the log cannot be read.
    pub async fn events(&self, run_id: RunId) -> Result<Vec<RunEvent>> {
        self.orchestrator.store().list_events(run_id).await
    }

    /// # Errors
    /// Returns a store error if the requests cannot be read.
    pub async fn replans(&self, run_id: RunId) -> Result<Vec<ReplanRequest>> {
        self.orchestrator.store().list_replans(run_id).await
    }

    /// # Errors
    /// Returns a store error if the listing fails.
    pub async fn list_quarantine(
        &self,
        tenant_id: TenantId,
        suite_id: SuiteId,
    ) -> Result<Vec<QuarantineCase>> {
        self.orchestrator.quarantine().list(tenant_id, suite_id).await
    }

    /// # Errors
    /// Returns `EngineError::QuarantineNotFound` or `EngineError::InvalidTransition`.
    pub async fn release_quarantine(&self, id: QuarantineId) -> Result<QuarantineCase> {
        self.orchestrator.quarantine().release(id).await
    }

    /// # Errors
    /// Returns a store error if records cannot be read or written.
    pub async fn sweep_quarantine(&self) -> Result<Vec<QuarantineCase>> {
        self.orchestrator.quarantine().sweep().await
    }

    /// Score a case's history and quarantine it when the detector recommends so.
    ///
    /// # Errors
    /// Returns a store error if history or quarantine records are unavailable.
    pub async fn review_case(&self, key: CaseKey) -> Result<CaseReview> {
        let history = self.orchestrator.store().case_history(key.clone()).await?;
        let analysis = self.flake.analyze_case_flakiness(&history);
        let quarantine = if analysis.class == FlakeClass::QuarantineRecommended {
            let reason = analysis.reasons.join("; ");
            Some(
                self.orchestrator
                    .quarantine()
                    .add(key.clone(), &reason, analysis.score)
                    .await?,
            )
        } else {
            None
        };
        info!(
            tenant_id = key.tenant_id.value(),
            suite_id = key.suite_id.value(),
            case_id = key.case_id.value(),
            flake_score = analysis.score,
            class = analysis.class.as_str(),
            "case reviewed"
        );
        Ok(CaseReview {
            key,
            analysis,
            quarantine,
        })
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.orchestrator.metrics().snapshot().await
    }

    pub async fn breakers(&self) -> Vec<CircuitBreakerRecord> {
        self.orchestrator.breakers().snapshot().await
    }

    pub async fn canary_comparison(&self) -> CanaryComparison {
        self.orchestrator.canary().compare().await
    }

    /// Stop the worker pool after it drains queued runs.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::scripted_backend::ScriptedBackend;
    use crate::types::{CaseId, CaseRunRecord, PlanId, RunStatus};

    async fn engine() -> BuildLoopEngine {
        let backend = Arc::new(ScriptedBackend::demo());
        let engine = BuildLoopEngine::from_config(EngineConfig::default(), backend.clone(), backend)
            .await
            .unwrap();
        engine
            .register_suite(SpecId::new("contacts"), ScriptedBackend::demo_suite())
            .await;
        engine
    }

    fn request() -> SubmitBuild {
        SubmitBuild {
            tenant_id: TenantId::new("acme"),
            spec_id: SpecId::new("contacts"),
            plan_id: PlanId::new("plan-1"),
            goal_text: "add a contacts page".to_string(),
            max_iterations: 5,
            budgets: None,
            circuit_failure_threshold: None,
        }
    }

    #[tokio::test]
    async fn submit_requires_a_started_engine() {
        let engine = engine().await;
        let error = engine.submit(request()).await.unwrap_err();
        assert_eq!(error.code(), "DEPENDENCY");
    }

    #[tokio::test]
    async fn given_started_engine_when_run_submitted_then_poll_reports_completion() {
        let engine = engine().await;
        assert_eq!(engine.start().await.unwrap(), 0);

        let receipt = engine.submit(request()).await.unwrap();
        let view = engine
            .wait_until_settled(receipt.run_id, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(view.status, RunStatus::Completed);
        assert_eq!(view.failure_code, None);
        assert!(!engine.events(receipt.run_id).await.unwrap().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn run_refused_by_a_full_queue_is_not_left_pending() {
        let backend = Arc::new(ScriptedBackend::demo().with_generate_delay(Duration::from_secs(60)));
        let config = EngineConfig {
            worker: crate::config::WorkerConfig {
                pool_size: 1,
                queue_capacity: 1,
                ..crate::config::WorkerConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = BuildLoopEngine::new(
            config,
            EnginePorts {
                store: Arc::new(InMemoryRunStore::new()),
                backend: backend.clone(),
                harness: backend,
            },
        );
        engine
            .register_suite(SpecId::new("contacts"), ScriptedBackend::demo_suite())
            .await;
        engine.start().await.unwrap();

        let mut accepted = Vec::new();
        let mut refusal = None;
        for _ in 0..5 {
            match engine.submit(request()).await {
                Ok(receipt) => accepted.push(receipt.run_id),
                Err(error) => {
                    refusal = Some(error);
                    break;
                }
            }
        }

        assert_eq!(refusal.unwrap().code(), "DEPENDENCY");
        let waiting = engine.orchestrator().recover_incomplete_runs().await.unwrap();
        assert_eq!(waiting.len(), accepted.len());
        assert!(waiting.iter().all(|run_id| accepted.contains(run_id)));
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let engine = engine().await;
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn flaky_history_is_quarantined_on_review() {
        let engine = engine().await;
        let key = CaseKey::new(
            TenantId::new("acme"),
            SuiteId::new("contacts-smoke"),
            CaseId::new("greets-visitor"),
        );
        let store = engine.orchestrator().store();
        for (passed, latency_ms, error) in [
            (true, 10, None),
            (false, 100, Some("HTTP 503 service unavailable")),
            (true, 1_500, None),
            (false, 100, Some("provider rate limit hit")),
            (true, 20, None),
            (false, 100, Some("upstream timed out")),
            (true, 2_000, None),
        ] {
            store
                .record_case_run(
                    key.clone(),
                    CaseRunRecord::new(passed, latency_ms, error.map(str::to_string)),
                )
                .await
                .unwrap();
        }

        let review = engine.review_case(key.clone()).await.unwrap();
        assert_eq!(review.analysis.class, FlakeClass::QuarantineRecommended);
        let first = review.quarantine.unwrap();

        let again = engine.review_case(key).await.unwrap();
        assert_eq!(again.quarantine.unwrap().id, first.id);
        let listed = engine
            .list_quarantine(TenantId::new("acme"), SuiteId::new("contacts-smoke"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn steady_case_is_left_alone() {
        let engine = engine().await;
        let review = engine
            .review_case(CaseKey::new(
                TenantId::new("acme"),
                SuiteId::new("contacts-smoke"),
                CaseId::new("greets-visitor"),
            ))
            .await
            .unwrap();
        assert_eq!(review.analysis.class, FlakeClass::Stable);
        assert!(review.quarantine.is_none());
    }
}
