#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Evidence key carrying a server-specified backoff.
pub const RETRY_AFTER_SECONDS: &str = "retry_after_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    TestAssert,
    Lint,
    Timeout,
    RateLimit,
    Transient,
    Dependency,
    Unknown,
}

impl FailureType {
    pub const ALL: [Self; 7] = [
        Self::TestAssert,
        Self::Lint,
        Self::Timeout,
        Self::RateLimit,
        Self::Transient,
        Self::Dependency,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TestAssert => "test_assert",
            Self::Lint => "lint",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Transient => "transient",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for FailureType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("Unknown failure type: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Classified description of why a step failed. Lives inside its step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub source: String,
    pub message: String,
    pub severity: Severity,
    pub can_retry: bool,
    pub requires_replan: bool,
    pub evidence: BTreeMap<String, serde_json::Value>,
}

impl FailureSignal {
    #[must_use]
    pub fn new(failure_type: FailureType, source: impl Into<String>, message: impl Into<String>) -> Self {
        let (severity, can_retry, requires_replan) = failure_type.default_disposition();
        Self {
            failure_type,
            source: source.into(),
            message: message.into(),
            severity,
            can_retry,
            requires_replan,
            evidence: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn unknown(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureType::Unknown, source, message)
    }

    #[must_use]
    pub fn with_evidence(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.evidence.insert(key.into(), value);
        self
    }

    /// Server-specified backoff, when one was captured and is a non-negative integer.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.evidence
            .get(RETRY_AFTER_SECONDS)
            .and_then(serde_json::Value::as_u64)
    }
}

impl FailureType {
    /// `(severity, can_retry, requires_replan)` used when a rule does not override them.
    #[must_use]
    pub const fn default_disposition(&self) -> (Severity, bool, bool) {
        match self {
            Self::TestAssert => (Severity::Medium, true, false),
            Self::Lint => (Severity::Low, true, false),
            Self::Timeout => (Severity::Medium, true, false),
            Self::RateLimit => (Severity::Low, true, false),
            Self::Transient => (Severity::Low, true, false),
            Self::Dependency => (Severity::High, true, true),
            Self::Unknown => (Severity::High, false, false),
        }
    }
}
