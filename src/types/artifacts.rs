use super::{CaseId, ReviewerId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output of one completed generate step. Unique per `(run_id, iteration)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffArtifact {
    pub run_id: RunId,
    pub iteration: u32,
    pub unified_diff: String,
    pub files_changed: Vec<String>,
    pub risk_score: f64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Score of a single evaluation case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseScore {
    pub passed: usize,
    pub total: usize,
    pub required_failed: usize,
    pub quarantined: bool,
}

/// Output of one completed evaluate step. Unique per `(run_id, iteration)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub run_id: RunId,
    pub iteration: u32,
    pub scores: BTreeMap<CaseId, CaseScore>,
    pub failed_cases: Vec<CaseId>,
    pub pass_rate: f64,
    pub required_failed: usize,
    pub all_required_passed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// # Errors
    /// Returns a message naming the unrecognized value.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown approval status: {value}")),
        }
    }
}

/// Human review checkpoint. Unique per `(run_id, iteration)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub run_id: RunId,
    pub iteration: u32,
    pub required: bool,
    pub status: ApprovalStatus,
    pub reviewer_id: Option<ReviewerId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(run_id: RunId, iteration: u32, required: bool) -> Self {
        Self {
            run_id,
            iteration,
            required,
            status: if required {
                ApprovalStatus::Pending
            } else {
                ApprovalStatus::Approved
            },
            reviewer_id: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[must_use]
    pub fn blocks_progress(&self) -> bool {
        self.required && self.status == ApprovalStatus::Pending
    }

    /// # Errors
    /// Returns `EngineError::ApprovalError` when the gate was already resolved.
    pub fn resolve(&mut self, approved: bool, reviewer: ReviewerId) -> crate::Result<()> {
        if self.status != ApprovalStatus::Pending {
            return Err(crate::EngineError::ApprovalError(format!(
                "gate for run {} iteration {} already {}",
                self.run_id,
                self.iteration,
                self.status.as_str()
            )));
        }
        self.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.reviewer_id = Some(reviewer);
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}
