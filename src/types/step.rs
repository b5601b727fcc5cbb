#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{FailureSignal, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Plan,
    Codegen,
    Evaluate,
    Repair,
    Approval,
}

impl StepName {
    pub const ALL: [Self; 5] = [
        Self::Plan,
        Self::Codegen,
        Self::Evaluate,
        Self::Repair,
        Self::Approval,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Codegen => "codegen",
            Self::Evaluate => "evaluate",
            Self::Repair => "repair",
            Self::Approval => "approval",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for StepName {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == value)
            .ok_or_else(|| format!("Unknown step name: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// One stage within an iteration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStep {
    pub id: Uuid,
    pub run_id: RunId,
    pub iteration: u32,
    pub name: StepName,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub failure: Option<FailureSignal>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildStep {
    #[must_use]
    pub fn start(run_id: RunId, iteration: u32, name: StepName, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            iteration,
            name,
            status: StepStatus::Running,
            input,
            output: serde_json::Value::Null,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[must_use]
    pub fn succeed(mut self, output: serde_json::Value) -> Self {
        self.status = StepStatus::Succeeded;
        self.output = output;
        self.finished_at = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn fail(mut self, output: serde_json::Value, signal: FailureSignal) -> Self {
        self.status = StepStatus::Failed;
        self.output = output;
        self.failure = Some(signal);
        self.finished_at = Some(Utc::now());
        self
    }

    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| u64::try_from((end - self.started_at).num_milliseconds()).unwrap_or(0))
    }
}
