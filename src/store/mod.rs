mod memory;
mod postgres;

pub use memory::InMemoryRunStore;
pub use postgres::{PgRunStore, SCHEMA_SQL};

use crate::ports::PortFuture;
use crate::types::{
    ApprovalGate, BuildRun, BuildStep, CaseKey, CaseRunRecord, DiffArtifact, EvalReport,
    QuarantineCase, QuarantineId, ReplanRequest, RunEvent, RunEventKind, RunId, StepName, SuiteId,
    TenantId,
};
use std::collections::BTreeMap;

/// Durable home of runs and everything recorded against them.
///
/// Per-iteration records (diffs, reports, gates) are write-once: a second
/// insert for the same `(run_id, iteration)` fails with `EngineError::Duplicate`.
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: BuildRun) -> PortFuture<'_, ()>;

    /// Persist a run's new state and return what was stored. A cancel request
    /// recorded concurrently is never cleared by a stale copy.
    fn update_run(&self, run: BuildRun) -> PortFuture<'_, BuildRun>;

    fn get_run(&self, run_id: RunId) -> PortFuture<'_, BuildRun>;

    fn request_cancel(&self, run_id: RunId) -> PortFuture<'_, BuildRun>;

    /// Runs a worker still has to drive, oldest first.
    fn list_incomplete(&self) -> PortFuture<'_, Vec<BuildRun>>;

    fn record_step(&self, step: BuildStep) -> PortFuture<'_, ()>;

    fn latest_step_outputs(
        &self,
        run_id: RunId,
    ) -> PortFuture<'_, BTreeMap<StepName, serde_json::Value>>;

    fn insert_diff(&self, diff: DiffArtifact) -> PortFuture<'_, ()>;

    fn get_diff(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<DiffArtifact>>;

    fn insert_report(&self, report: EvalReport) -> PortFuture<'_, ()>;

    fn get_report(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<EvalReport>>;

    fn insert_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()>;

    fn get_gate(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<ApprovalGate>>;

    fn update_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()>;

    fn insert_replan(&self, request: ReplanRequest) -> PortFuture<'_, ()>;

    fn list_replans(&self, run_id: RunId) -> PortFuture<'_, Vec<ReplanRequest>>;

    /// Append to the run's audit log; sequence numbers start at 1 per run.
    fn append_event(
        &self,
        run_id: RunId,
        kind: RunEventKind,
        payload: serde_json::Value,
    ) -> PortFuture<'_, RunEvent>;

    fn list_events(&self, run_id: RunId) -> PortFuture<'_, Vec<RunEvent>>;

    fn record_case_run(&self, key: CaseKey, record: CaseRunRecord) -> PortFuture<'_, ()>;

    /// Execution history of one case, oldest first.
    fn case_history(&self, key: CaseKey) -> PortFuture<'_, Vec<CaseRunRecord>>;

    /// Fails with `EngineError::Duplicate` if the key already has an active record.
    fn insert_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()>;

    /// Persist a change to a record that is still `active` in the store.
    /// Fails with `EngineError::InvalidTransition` once another writer has
    /// released or expired it, so neither change is overwritten.
    fn update_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()>;

    fn get_quarantine(&self, id: QuarantineId) -> PortFuture<'_, Option<QuarantineCase>>;

    fn find_active_quarantine(&self, key: CaseKey) -> PortFuture<'_, Option<QuarantineCase>>;

    fn list_quarantine(
        &self,
        tenant_id: TenantId,
        suite_id: SuiteId,
    ) -> PortFuture<'_, Vec<QuarantineCase>>;

    /// Every active record, across tenants, for the expiry sweep.
    fn list_active_quarantine(&self) -> PortFuture<'_, Vec<QuarantineCase>>;
}
