use super::{CaseId, SuiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One check run against a case's result payload.
///
/// `kind` stays a raw string until evaluation so a malformed suite surfaces as
/// an error at evaluation time instead of at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub expected: serde_json::Value,
    #[serde(default)]
    pub optional: bool,
}

impl Assertion {
    #[must_use]
    pub fn new(kind: impl Into<String>, key: impl Into<String>, expected: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            expected,
            optional: false,
        }
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    pub case_id: CaseId,
    #[serde(default)]
    pub input: serde_json::Value,
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSuite {
    pub suite_id: SuiteId,
    pub cases: Vec<EvalCase>,
}

/// Historical execution of one case, the flake detector's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRunRecord {
    pub passed: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl CaseRunRecord {
    #[must_use]
    pub fn new(passed: bool, latency_ms: u64, error: Option<String>) -> Self {
        Self {
            passed,
            latency_ms,
            error,
            recorded_at: Utc::now(),
        }
    }
}
