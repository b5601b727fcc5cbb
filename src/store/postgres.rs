use super::RunStore;
use crate::error::{EngineError, Result};
use crate::ports::PortFuture;
use crate::types::{
    ApprovalGate, BuildRun, BuildStep, CaseKey, CaseRunRecord, DiffArtifact, EvalReport,
    QuarantineCase, QuarantineId, ReplanRequest, RunEvent, RunEventKind, RunId, RunStatus,
    StepName, SuiteId, TenantId,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgPool};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

pub const SCHEMA_SQL: &str = include_str!("../../schema.sql");

#[derive(sqlx::FromRow)]
struct RecordRow {
    record: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    record: serde_json::Value,
    cancel_requested: bool,
}

#[derive(sqlx::FromRow)]
struct StepOutputRow {
    name: String,
    record: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    kind: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

/// `RunStore` over Postgres. Each record is kept whole as JSONB next to the
/// columns that carry its keys and uniqueness constraints.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// # Errors
    /// Returns `EngineError::SqlxError` when the pool cannot connect.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL run store");
        Ok(Self { pool })
    }

    #[must_use]
    pub const fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns `EngineError::StoreError` when a statement fails.
    pub async fn initialize_schema(&self) -> Result<()> {
        self.initialize_schema_from_sql(SCHEMA_SQL).await
    }

    /// # Errors
    /// Returns `EngineError::StoreError` when a statement fails.
    pub async fn initialize_schema_from_sql(&self, schema_sql: &str) -> Result<()> {
        sqlx::raw_sql(schema_sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to initialize schema"))
    }
}

fn store_error(context: &'static str) -> impl Fn(sqlx::Error) -> EngineError {
    move |error| match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            EngineError::Duplicate(format!("{context}: {}", db.message()))
        }
        _ => EngineError::StoreError(format!("{context}: {error}")),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(EngineError::from)
}

fn decode<T: DeserializeOwned>(record: serde_json::Value) -> Result<T> {
    serde_json::from_value(record).map_err(EngineError::from)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn decode_run(row: RunRow) -> Result<BuildRun> {
    decode::<BuildRun>(row.record).map(|mut run| {
        run.cancel_requested |= row.cancel_requested;
        run
    })
}

fn incomplete_statuses() -> Vec<String> {
    RunStatus::ALL
        .into_iter()
        .filter(RunStatus::needs_worker)
        .map(|status| status.as_str().to_string())
        .collect()
}

impl PgRunStore {
    async fn fetch_record<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        run_id: RunId,
        iteration: u32,
        context: &'static str,
    ) -> Result<Option<T>> {
        sqlx::query_as::<_, RecordRow>(sql)
            .bind(run_id.as_uuid())
            .bind(to_i32(iteration))
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error(context))?
            .map(|row| decode(row.record))
            .transpose()
    }

    async fn fetch_records<T: DeserializeOwned>(
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, RecordRow, sqlx::postgres::PgArguments>,
        pool: &PgPool,
        context: &'static str,
    ) -> Result<Vec<T>> {
        query
            .fetch_all(pool)
            .await
            .map_err(store_error(context))?
            .into_iter()
            .map(|row| decode(row.record))
            .collect()
    }

    async fn upsert_quarantine(&self, case: &QuarantineCase, insert: bool) -> Result<()> {
        let record = encode(case)?;
        let sql = if insert {
            "INSERT INTO quarantine_cases
                 (id, tenant_id, suite_id, case_id, status, expires_at, record, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        } else {
            "UPDATE quarantine_cases
             SET tenant_id = $2, suite_id = $3, case_id = $4, status = $5, expires_at = $6,
                 record = $7, created_at = $8
             WHERE id = $1 AND status = 'active'"
        };
        let result = sqlx::query(sql)
            .bind(case.id.as_uuid())
            .bind(case.key.tenant_id.value())
            .bind(case.key.suite_id.value())
            .bind(case.key.case_id.value())
            .bind(case.status.as_str())
            .bind(case.expires_at)
            .bind(record)
            .bind(case.created_at)
            .execute(&self.pool)
            .await
            .map_err(store_error("Failed to write quarantine record"))?;
        if !insert && result.rows_affected() == 0 {
            return Err(match self.get_quarantine(case.id).await? {
                Some(stored) => EngineError::InvalidTransition {
                    from: stored.status.as_str().to_string(),
                    to: case.status.as_str().to_string(),
                },
                None => EngineError::QuarantineNotFound(case.id.to_string()),
            });
        }
        Ok(())
    }
}

impl RunStore for PgRunStore {
    fn insert_run(&self, run: BuildRun) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO build_runs (run_id, tenant_id, status, cancel_requested, record, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(run.id.as_uuid())
            .bind(run.tenant_id.value())
            .bind(run.status.as_str())
            .bind(run.cancel_requested)
            .bind(encode(&run)?)
            .bind(run.created_at)
            .bind(run.updated_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to insert run"))
        })
    }

    fn update_run(&self, mut run: BuildRun) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            let cancel_requested: Option<bool> = sqlx::query_scalar(
                "UPDATE build_runs
                 SET status = $2, cancel_requested = cancel_requested OR $3, record = $4, updated_at = $5
                 WHERE run_id = $1
                 RETURNING cancel_requested",
            )
            .bind(run.id.as_uuid())
            .bind(run.status.as_str())
            .bind(run.cancel_requested)
            .bind(encode(&run)?)
            .bind(run.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("Failed to update run"))?;
            let cancel_requested =
                cancel_requested.ok_or_else(|| EngineError::RunNotFound(run.id.to_string()))?;
            run.cancel_requested = cancel_requested;
            Ok(run)
        })
    }

    fn get_run(&self, run_id: RunId) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            sqlx::query_as::<_, RunRow>(
                "SELECT record, cancel_requested FROM build_runs WHERE run_id = $1",
            )
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("Failed to load run"))?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
            .and_then(decode_run)
        })
    }

    fn request_cancel(&self, run_id: RunId) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            sqlx::query_as::<_, RunRow>(
                "UPDATE build_runs SET cancel_requested = TRUE, updated_at = NOW()
                 WHERE run_id = $1
                 RETURNING record, cancel_requested",
            )
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("Failed to request cancel"))?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
            .and_then(decode_run)
        })
    }

    fn list_incomplete(&self) -> PortFuture<'_, Vec<BuildRun>> {
        Box::pin(async move {
            sqlx::query_as::<_, RunRow>(
                "SELECT record, cancel_requested FROM build_runs
                 WHERE status = ANY($1)
                 ORDER BY created_at ASC",
            )
            .bind(incomplete_statuses())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("Failed to list incomplete runs"))?
            .into_iter()
            .map(decode_run)
            .collect()
        })
    }

    fn record_step(&self, step: BuildStep) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO build_steps (step_id, run_id, iteration, name, status, record, started_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(step.id)
            .bind(step.run_id.as_uuid())
            .bind(to_i32(step.iteration))
            .bind(step.name.as_str())
            .bind(step.status.as_str())
            .bind(encode(&step)?)
            .bind(step.started_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to record step"))
        })
    }

    fn latest_step_outputs(
        &self,
        run_id: RunId,
    ) -> PortFuture<'_, BTreeMap<StepName, serde_json::Value>> {
        Box::pin(async move {
            sqlx::query_as::<_, StepOutputRow>(
                "SELECT DISTINCT ON (name) name, record FROM build_steps
                 WHERE run_id = $1
                 ORDER BY name, ordinal DESC",
            )
            .bind(run_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("Failed to load step outputs"))?
            .into_iter()
            .map(|row| {
                let name = StepName::try_from(row.name.as_str()).map_err(EngineError::StoreError)?;
                let step: BuildStep = decode(row.record)?;
                Ok((name, step.output))
            })
            .collect()
        })
    }

    fn insert_diff(&self, diff: DiffArtifact) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO diff_artifacts (run_id, iteration, content_hash, risk_score, record, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(diff.run_id.as_uuid())
            .bind(to_i32(diff.iteration))
            .bind(&diff.content_hash)
            .bind(diff.risk_score)
            .bind(encode(&diff)?)
            .bind(diff.created_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to insert diff artifact"))
        })
    }

    fn get_diff(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<DiffArtifact>> {
        Box::pin(self.fetch_record(
            "SELECT record FROM diff_artifacts WHERE run_id = $1 AND iteration = $2",
            run_id,
            iteration,
            "Failed to load diff artifact",
        ))
    }

    fn insert_report(&self, report: EvalReport) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO eval_reports (run_id, iteration, pass_rate, record, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(report.run_id.as_uuid())
            .bind(to_i32(report.iteration))
            .bind(report.pass_rate)
            .bind(encode(&report)?)
            .bind(report.created_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to insert eval report"))
        })
    }

    fn get_report(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<EvalReport>> {
        Box::pin(self.fetch_record(
            "SELECT record FROM eval_reports WHERE run_id = $1 AND iteration = $2",
            run_id,
            iteration,
            "Failed to load eval report",
        ))
    }

    fn insert_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO approval_gates (run_id, iteration, status, record, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(gate.run_id.as_uuid())
            .bind(to_i32(gate.iteration))
            .bind(gate.status.as_str())
            .bind(encode(&gate)?)
            .bind(gate.created_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to insert approval gate"))
        })
    }

    fn get_gate(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<ApprovalGate>> {
        Box::pin(self.fetch_record(
            "SELECT record FROM approval_gates WHERE run_id = $1 AND iteration = $2",
            run_id,
            iteration,
            "Failed to load approval gate",
        ))
    }

    fn update_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE approval_gates SET status = $3, record = $4
                 WHERE run_id = $1 AND iteration = $2",
            )
            .bind(gate.run_id.as_uuid())
            .bind(to_i32(gate.iteration))
            .bind(gate.status.as_str())
            .bind(encode(&gate)?)
            .execute(&self.pool)
            .await
            .map_err(store_error("Failed to update approval gate"))?;
            if result.rows_affected() == 0 {
                return Err(EngineError::ApprovalError(format!(
                    "no approval gate for run {} iteration {}",
                    gate.run_id, gate.iteration
                )));
            }
            Ok(())
        })
    }

    fn insert_replan(&self, request: ReplanRequest) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO replan_requests (run_id, iteration, record, created_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(request.run_id.as_uuid())
            .bind(to_i32(request.iteration))
            .bind(encode(&request)?)
            .bind(request.created_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to insert replan request"))
        })
    }

    fn list_replans(&self, run_id: RunId) -> PortFuture<'_, Vec<ReplanRequest>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, RecordRow>(
                "SELECT record FROM replan_requests WHERE run_id = $1 ORDER BY ordinal ASC",
            )
            .bind(run_id.as_uuid());
            Self::fetch_records(query, &self.pool, "Failed to list replan requests").await
        })
    }

    fn append_event(
        &self,
        run_id: RunId,
        kind: RunEventKind,
        payload: serde_json::Value,
    ) -> PortFuture<'_, RunEvent> {
        Box::pin(async move {
            let created_at = Utc::now();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(store_error("Failed to begin tx"))?;
            let conn = tx
                .acquire()
                .await
                .map_err(store_error("Failed to acquire tx conn"))?;

            // Serialises appends for one run on its row lock.
            sqlx::query("SELECT 1 FROM build_runs WHERE run_id = $1 FOR UPDATE")
                .bind(run_id.as_uuid())
                .fetch_optional(&mut *conn)
                .await
                .map_err(store_error("Failed to lock run for event append"))?;

            let seq: i64 = sqlx::query_scalar(
                "INSERT INTO run_events (run_id, seq, kind, payload, created_at)
                 SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4
                 FROM run_events WHERE run_id = $1
                 RETURNING seq",
            )
            .bind(run_id.as_uuid())
            .bind(kind.as_str())
            .bind(&payload)
            .bind(created_at)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_error("Failed to append run event"))?;

            tx.commit()
                .await
                .map_err(store_error("Failed to commit tx"))?;

            Ok(RunEvent {
                seq: u64::try_from(seq).unwrap_or(0),
                run_id,
                kind,
                payload,
                created_at,
            })
        })
    }

    fn list_events(&self, run_id: RunId) -> PortFuture<'_, Vec<RunEvent>> {
        Box::pin(async move {
            sqlx::query_as::<_, EventRow>(
                "SELECT seq, kind, payload, created_at FROM run_events
                 WHERE run_id = $1 ORDER BY seq ASC",
            )
            .bind(run_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("Failed to list run events"))?
            .into_iter()
            .map(|row| {
                Ok(RunEvent {
                    seq: u64::try_from(row.seq).unwrap_or(0),
                    run_id,
                    kind: decode(serde_json::Value::String(row.kind))?,
                    payload: row.payload,
                    created_at: row.created_at,
                })
            })
            .collect()
        })
    }

    fn record_case_run(&self, key: CaseKey, record: CaseRunRecord) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO case_runs (tenant_id, suite_id, case_id, record, recorded_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(key.tenant_id.value())
            .bind(key.suite_id.value())
            .bind(key.case_id.value())
            .bind(encode(&record)?)
            .bind(record.recorded_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error("Failed to record case run"))
        })
    }

    fn case_history(&self, key: CaseKey) -> PortFuture<'_, Vec<CaseRunRecord>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, RecordRow>(
                "SELECT record FROM case_runs
                 WHERE tenant_id = $1 AND suite_id = $2 AND case_id = $3
                 ORDER BY ordinal ASC",
            )
            .bind(key.tenant_id.value().to_string())
            .bind(key.suite_id.value().to_string())
            .bind(key.case_id.value().to_string());
            Self::fetch_records(query, &self.pool, "Failed to load case history").await
        })
    }

    fn insert_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()> {
        Box::pin(async move { self.upsert_quarantine(&case, true).await })
    }

    fn update_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()> {
        Box::pin(async move { self.upsert_quarantine(&case, false).await })
    }

    fn get_quarantine(&self, id: QuarantineId) -> PortFuture<'_, Option<QuarantineCase>> {
        Box::pin(async move {
            sqlx::query_as::<_, RecordRow>("SELECT record FROM quarantine_cases WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error("Failed to load quarantine record"))?
                .map(|row| decode(row.record))
                .transpose()
        })
    }

    fn find_active_quarantine(&self, key: CaseKey) -> PortFuture<'_, Option<QuarantineCase>> {
        Box::pin(async move {
            sqlx::query_as::<_, RecordRow>(
                "SELECT record FROM quarantine_cases
                 WHERE tenant_id = $1 AND suite_id = $2 AND case_id = $3 AND status = 'active'",
            )
            .bind(key.tenant_id.value())
            .bind(key.suite_id.value())
            .bind(key.case_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("Failed to find active quarantine"))?
            .map(|row| decode(row.record))
            .transpose()
        })
    }

    fn list_quarantine(
        &self,
        tenant_id: TenantId,
        suite_id: SuiteId,
    ) -> PortFuture<'_, Vec<QuarantineCase>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, RecordRow>(
                "SELECT record FROM quarantine_cases
                 WHERE tenant_id = $1 AND suite_id = $2
                 ORDER BY created_at ASC",
            )
            .bind(tenant_id.value().to_string())
            .bind(suite_id.value().to_string());
            Self::fetch_records(query, &self.pool, "Failed to list quarantine").await
        })
    }

    fn list_active_quarantine(&self) -> PortFuture<'_, Vec<QuarantineCase>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, RecordRow>(
                "SELECT record FROM quarantine_cases WHERE status = 'active' ORDER BY created_at ASC",
            );
            Self::fetch_records(query, &self.pool, "Failed to list active quarantine").await
        })
    }
}

#[cfg(all(test, feature = "db-tests"))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::{BudgetLimits, PlanId, SpecId, SubmitBuild};
    use serde_json::json;

    async fn given_store() -> Option<PgRunStore> {
        let url = std::env::var("BUILDLOOP_TEST_DATABASE_URL").ok()?;
        let store = PgRunStore::connect(&url, 4).await.ok()?;
        store.initialize_schema().await.ok()?;
        Some(store)
    }

    fn given_a_run() -> BuildRun {
        BuildRun::new(
            &SubmitBuild {
                tenant_id: TenantId::new("acme"),
                spec_id: SpecId::new("spec-1"),
                plan_id: PlanId::new("plan-1"),
                goal_text: "contacts page".to_string(),
                max_iterations: 3,
                budgets: None,
                circuit_failure_threshold: None,
            },
            BudgetLimits::default(),
            "v1",
        )
    }

    #[tokio::test]
    async fn pg_store_keeps_cancel_flag_and_sequences_events() {
        let Some(store) = given_store().await else {
            return;
        };
        let mut run = given_a_run();
        store.insert_run(run.clone()).await.unwrap();
        store.request_cancel(run.id).await.unwrap();

        run.transition_to(RunStatus::Planning).unwrap();
        let stored = store.update_run(run.clone()).await.unwrap();
        assert!(stored.cancel_requested);

        store
            .append_event(run.id, RunEventKind::Submitted, json!({}))
            .await
            .unwrap();
        let second = store
            .append_event(run.id, RunEventKind::CancelRequested, json!({}))
            .await
            .unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(store.list_events(run.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pg_store_rejects_duplicate_reports() {
        let Some(store) = given_store().await else {
            return;
        };
        let report = EvalReport {
            run_id: RunId::generate(),
            iteration: 0,
            scores: BTreeMap::new(),
            failed_cases: vec![],
            pass_rate: 1.0,
            required_failed: 0,
            all_required_passed: true,
            created_at: Utc::now(),
        };
        store.insert_report(report.clone()).await.unwrap();
        let error = store.insert_report(report).await.unwrap_err();
        assert_eq!(error.code(), "CONFLICT");
    }
}
