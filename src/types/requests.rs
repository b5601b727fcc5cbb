use super::{
    BudgetLimits, BudgetUsage, PlanId, RunFailureReason, RunId, RunStatus, SpecId, StepName,
    StepStatus, TenantId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Input of the submit-build operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitBuild {
    pub tenant_id: TenantId,
    pub spec_id: SpecId,
    pub plan_id: PlanId,
    pub goal_text: String,
    pub max_iterations: u32,
    /// Per-run limits; tenant or system defaults apply when absent.
    #[serde(default)]
    pub budgets: Option<BudgetLimits>,
    /// Failures that open this tenant's shared breaker when recorded by this
    /// run; the tenant or system threshold applies when absent.
    #[serde(default)]
    pub circuit_failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub run_id: RunId,
}

/// Output of the poll-run-status operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_step_outputs: BTreeMap<StepName, serde_json::Value>,
    pub budgets_consumed: BudgetUsage,
    pub budget_limits: BudgetLimits,
    pub failure_reason: Option<RunFailureReason>,
    pub failure_code: Option<String>,
}

/// Completion notice for one step; the only input the failure classifier sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub run_id: RunId,
    pub step_name: StepName,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub logs: Vec<String>,
    pub artifacts: BTreeMap<String, serde_json::Value>,
}
