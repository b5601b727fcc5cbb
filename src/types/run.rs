#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{
    BudgetDimension, BudgetLimits, BudgetUsage, FailureType, PlanId, RetryState, RunId, SpecId,
    TenantId,
};
use crate::error::code;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    Generating,
    Evaluating,
    Repairing,
    AwaitingApproval,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Planning,
        Self::Generating,
        Self::Evaluating,
        Self::Repairing,
        Self::AwaitingApproval,
        Self::Completed,
        Self::Failed,
        Self::RolledBack,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Generating => "generating",
            Self::Evaluating => "evaluating",
            Self::Repairing => "repairing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Terminal runs are immutable history. `Completed` stays open only to the
    /// manual rollback action.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Whether a worker still has to drive this run.
    #[must_use]
    pub const fn needs_worker(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Planning | Self::Generating | Self::Evaluating | Self::Repairing
        )
    }

    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Planning | Self::Failed)
                | (Self::Planning, Self::Generating | Self::Repairing | Self::Failed)
                | (
                    Self::Generating,
                    Self::Evaluating | Self::Repairing | Self::Failed
                )
                | (
                    Self::Evaluating,
                    Self::Repairing | Self::AwaitingApproval | Self::Completed | Self::Failed
                )
                | (
                    Self::Repairing,
                    Self::Generating | Self::Planning | Self::Failed
                )
                | (Self::AwaitingApproval, Self::Completed | Self::Failed)
                | (Self::Completed, Self::RolledBack)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RunStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("Unknown run status: {value}"))
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunFailureReason {
    BudgetExceeded { dimension: BudgetDimension },
    MaxIterationsReached,
    CircuitOpen { failure_type: FailureType },
    NotRetryable { failure_type: FailureType },
    PatchBackendFailed { detail: String },
    ApprovalRejected,
    Cancelled,
    InvalidEvaluation { detail: String },
    BackendError { detail: String },
    NotScheduled { detail: String },
}

impl RunFailureReason {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } | Self::MaxIterationsReached => code::BUDGET,
            Self::CircuitOpen { .. }
            | Self::PatchBackendFailed { .. }
            | Self::BackendError { .. }
            | Self::NotScheduled { .. } => code::DEPENDENCY,
            Self::NotRetryable { .. } | Self::InvalidEvaluation { .. } => code::INVALID,
            Self::ApprovalRejected | Self::Cancelled => code::CONFLICT,
        }
    }
}

/// One end-to-end build/repair job for a tenant's goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRun {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub spec_id: SpecId,
    pub plan_id: PlanId,
    pub goal_text: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub budget_limits: BudgetLimits,
    pub budget_usage: BudgetUsage,
    pub retry_state: RetryState,
    #[serde(default)]
    pub circuit_failure_threshold: Option<u32>,
    pub pipeline_version: String,
    pub cancel_requested: bool,
    pub failure_reason: Option<RunFailureReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BuildRun {
    #[must_use]
    pub fn new(
        request: &super::SubmitBuild,
        budget_limits: BudgetLimits,
        pipeline_version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            tenant_id: request.tenant_id.clone(),
            spec_id: request.spec_id.clone(),
            plan_id: request.plan_id.clone(),
            goal_text: request.goal_text.clone(),
            status: RunStatus::Pending,
            iteration: 0,
            max_iterations: request.max_iterations,
            budget_limits,
            budget_usage: BudgetUsage::default(),
            retry_state: RetryState::default(),
            circuit_failure_threshold: request.circuit_failure_threshold,
            pipeline_version: pipeline_version.into(),
            cancel_requested: false,
            failure_reason: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Apply a status transition, enforcing the run lifecycle.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidTransition` when the lifecycle forbids the move.
    pub fn transition_to(&mut self, next: RunStatus) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::EngineError::invalid_transition(self.status, next));
        }
        let now = Utc::now();
        if self.status == RunStatus::Pending {
            self.started_at = Some(now);
        }
        if next.is_terminal() && next != RunStatus::RolledBack {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `failed` and record the reason.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidTransition` if the run is already terminal.
    pub fn fail(&mut self, reason: RunFailureReason) -> crate::Result<()> {
        self.transition_to(RunStatus::Failed)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Count a finished generate+evaluate cycle. Never exceeds `max_iterations`.
    ///
    /// # Errors
    /// Returns `EngineError::Internal` if the ceiling was already reached.
    pub fn complete_iteration(&mut self) -> crate::Result<()> {
        if self.iteration >= self.max_iterations {
            return Err(crate::EngineError::Internal(format!(
                "iteration ceiling {} reached for run {}",
                self.max_iterations, self.id
            )));
        }
        self.iteration += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    #[must_use]
    pub const fn has_iterations_left(&self) -> bool {
        self.iteration < self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubmitBuild;

    fn given_a_run(max_iterations: u32) -> BuildRun {
        let request = SubmitBuild {
            tenant_id: TenantId::new("acme"),
            spec_id: SpecId::new("spec-1"),
            plan_id: PlanId::new("plan-1"),
            goal_text: "add a contacts page".to_string(),
            max_iterations,
            budgets: None,
            circuit_failure_threshold: None,
        };
        BuildRun::new(&request, BudgetLimits::default(), "v1")
    }

    #[test]
    fn run_status_roundtrip_preserves_values() {
        for status in RunStatus::ALL {
            assert_eq!(RunStatus::try_from(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn when_run_walks_happy_path_then_every_transition_is_accepted() -> crate::Result<()> {
        let mut run = given_a_run(3);
        for next in [
            RunStatus::Planning,
            RunStatus::Generating,
            RunStatus::Evaluating,
            RunStatus::Repairing,
            RunStatus::Generating,
            RunStatus::Evaluating,
            RunStatus::AwaitingApproval,
            RunStatus::Completed,
            RunStatus::RolledBack,
        ] {
            run.transition_to(next)?;
        }
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());
        Ok(())
    }

    #[test]
    fn when_run_failed_then_rollback_is_rejected() -> crate::Result<()> {
        let mut run = given_a_run(3);
        run.fail(RunFailureReason::Cancelled)?;
        assert!(run.transition_to(RunStatus::RolledBack).is_err());
        assert!(run.transition_to(RunStatus::Generating).is_err());
        assert_eq!(run.failure_reason, Some(RunFailureReason::Cancelled));
        Ok(())
    }

    #[test]
    fn when_iterations_reach_ceiling_then_counter_stops() -> crate::Result<()> {
        let mut run = given_a_run(2);
        run.complete_iteration()?;
        run.complete_iteration()?;
        assert!(!run.has_iterations_left());
        assert!(run.complete_iteration().is_err());
        assert_eq!(run.iteration, 2);
        Ok(())
    }

    #[test]
    fn completed_is_only_left_through_rollback() {
        for status in RunStatus::ALL {
            let allowed = RunStatus::Completed.can_transition_to(status);
            assert_eq!(allowed, status == RunStatus::RolledBack, "{status}");
        }
    }
}
