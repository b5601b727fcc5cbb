use crate::autofix::RepairStrategy;
use crate::types::{CaseId, EvalCase, FailureSignal, ReplanRequest, RunId, SuiteId, TenantId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub goal_text: String,
    pub iteration: u32,
    /// Present when the plan is a delta re-plan after a failure.
    pub replan: Option<ReplanRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<String>,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub iteration: u32,
    pub goal_text: String,
    pub plan: Plan,
    /// Patch accepted by the previous repair, to be folded into this generation.
    pub patch: Option<PatchProposal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeneratedChange {
    pub unified_diff: String,
    pub files_changed: Vec<String>,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub iteration: u32,
    pub signal: FailureSignal,
    pub strategy: RepairStrategy,
    pub failed_cases: Vec<CaseId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PatchProposal {
    pub patches: Vec<FilePatch>,
    pub rationale: String,
    pub cost_usd: f64,
}

impl PatchProposal {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRequest {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub suite_id: SuiteId,
    pub iteration: u32,
    pub case: EvalCase,
}

/// Raw result of executing one evaluation case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CaseExecution {
    pub payload: serde_json::Value,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub cost_usd: f64,
}

/// Pluggable code-generation and patch backend.
pub trait CodeGenBackend: Send + Sync {
    fn plan(&self, request: PlanRequest) -> PortFuture<'_, Plan>;

    fn generate(&self, request: GenerateRequest) -> PortFuture<'_, GeneratedChange>;

    fn patch(&self, request: PatchRequest) -> PortFuture<'_, PatchProposal>;
}

/// Executes one evaluation case against the current iteration's change.
pub trait EvalHarness: Send + Sync {
    fn run_case(&self, request: CaseRequest) -> PortFuture<'_, CaseExecution>;
}
