use super::{CaseId, QuarantineId, SuiteId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Active,
    ManualReleased,
    Expired,
}

impl QuarantineStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ManualReleased => "manual_released",
            Self::Expired => "expired",
        }
    }
}

/// How active quarantine records affect evaluation gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineGating {
    /// Execute the case and record history, but ignore its failures when gating.
    #[default]
    MonitorOnly,
    /// Do not execute the case at all.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaseKey {
    pub tenant_id: TenantId,
    pub suite_id: SuiteId,
    pub case_id: CaseId,
}

impl CaseKey {
    #[must_use]
    pub const fn new(tenant_id: TenantId, suite_id: SuiteId, case_id: CaseId) -> Self {
        Self {
            tenant_id,
            suite_id,
            case_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineCase {
    pub id: QuarantineId,
    pub key: CaseKey,
    pub reason: String,
    pub flake_score: f64,
    pub status: QuarantineStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuarantineCase {
    /// Active and not yet past its TTL.
    #[must_use]
    pub fn is_in_force(&self, now: DateTime<Utc>) -> bool {
        self.status == QuarantineStatus::Active && now < self.expires_at
    }
}
