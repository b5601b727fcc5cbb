use super::{RunId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Submitted,
    StatusChanged,
    StepCompleted,
    AutoFixDecision,
    ReplanRequested,
    BudgetExceeded,
    ApprovalResolved,
    CancelRequested,
    RolledBack,
}

impl RunEventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::StatusChanged => "status_changed",
            Self::StepCompleted => "step_completed",
            Self::AutoFixDecision => "auto_fix_decision",
            Self::ReplanRequested => "replan_requested",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ApprovalResolved => "approval_resolved",
            Self::CancelRequested => "cancel_requested",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Append-only audit record for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "sequence")]
    pub seq: u64,
    pub run_id: RunId,
    pub kind: RunEventKind,
    pub payload: serde_json::Value,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Delta re-plan emitted when a failure needs a new plan instead of a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanRequest {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub iteration: u32,
    pub delta_goal: String,
    pub root_cause_summary: String,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
}
