//! Failure classification: raw step logs and artifacts to a typed [`FailureSignal`].
//!
//! Rules are evaluated in order and the first match wins. Classification never
//! fails outward: any internal error becomes an `unknown` signal that carries
//! the error text.

use crate::diagnostics::{redact_sensitive, truncate_message};
use crate::types::{FailureSignal, FailureType, Severity, StepCompletion, RETRY_AFTER_SECONDS};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("malformed artifact `{key}`: {detail}")]
    MalformedArtifact { key: String, detail: String },
    #[error("malformed retry-after value `{0}`")]
    MalformedRetryAfter(String),
    #[error("invalid rule `{name}`: {source}")]
    InvalidRule {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Declarative form of a rule, as written in code or configuration.
#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub name: &'static str,
    pub pattern: &'static str,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub can_retry: bool,
    pub requires_replan: bool,
}

impl RuleSpec {
    const fn for_type(name: &'static str, pattern: &'static str, failure_type: FailureType) -> Self {
        let (severity, can_retry, requires_replan) = failure_type.default_disposition();
        Self {
            name,
            pattern,
            failure_type,
            severity,
            can_retry,
            requires_replan,
        }
    }
}

/// Ordered rules used by [`FailureClassifier::standard`].
pub const STANDARD_RULES: &[RuleSpec] = &[
    RuleSpec::for_type(
        "http_rate_limit",
        r"(?i)((http|status)[ =:]*429\b|too many requests|rate.?limit)",
        FailureType::RateLimit,
    ),
    RuleSpec::for_type(
        "timeout",
        r"(?i)(timed? ?out|deadline exceeded|ETIMEDOUT)",
        FailureType::Timeout,
    ),
    RuleSpec::for_type(
        "http_server_error",
        r"(?i)((http|status)[ =:]*5\d\d\b|connection (reset|refused)|ECONNRESET|broken pipe|service unavailable|temporarily unavailable)",
        FailureType::Transient,
    ),
    RuleSpec::for_type(
        "missing_dependency",
        r"(?i)(cannot find module|module not found|ModuleNotFoundError|could not resolve (dependency|package)|no matching version|unresolved import|package \S+ not found)",
        FailureType::Dependency,
    ),
    RuleSpec::for_type(
        "lint",
        r"(?i)(\blint(er)?\b|eslint|clippy::|flake8|ruff|prettier|\b[EW]\d{3,4}\b)",
        FailureType::Lint,
    ),
    RuleSpec::for_type(
        "test_assertion",
        r"(?i)(assert(ion)?(error| failed|_eq)|expected .+ (got|received|found)|tests? failed|\bFAILED\b)",
        FailureType::TestAssert,
    ),
];

#[derive(Debug, Clone)]
struct ClassificationRule {
    name: &'static str,
    pattern: Regex,
    failure_type: FailureType,
    severity: Severity,
    can_retry: bool,
    requires_replan: bool,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<ClassificationRule>,
    retry_after: Option<Regex>,
}

impl FailureClassifier {
    /// Compile an ordered rule set.
    ///
    /// # Errors
    /// Returns `ClassifierError::InvalidRule` for the first pattern that fails to compile.
    pub fn new(specs: &[RuleSpec]) -> Result<Self, ClassifierError> {
        let rules = specs
            .iter()
            .map(|spec| {
                Regex::new(spec.pattern)
                    .map(|pattern| ClassificationRule {
                        name: spec.name,
                        pattern,
                        failure_type: spec.failure_type,
                        severity: spec.severity,
                        can_retry: spec.can_retry,
                        requires_replan: spec.requires_replan,
                    })
                    .map_err(|source| ClassifierError::InvalidRule {
                        name: spec.name.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            retry_after: Regex::new(r"(?i)retry[-_ ]after(?:[-_ ]seconds)?\s*[:=]?\s*(\S+)").ok(),
        })
    }

    /// Classifier with [`STANDARD_RULES`].
    #[must_use]
    pub fn standard() -> Self {
        Self::new(STANDARD_RULES).unwrap_or_else(|error| {
            warn!(%error, "standard classification rules failed to compile");
            Self {
                rules: Vec::new(),
                retry_after: None,
            }
        })
    }

    /// Classify a failed step. Never fails: internal errors become `unknown`.
    #[must_use]
    pub fn classify(&self, logs: &[String], artifacts: &BTreeMap<String, Value>) -> FailureSignal {
        self.try_classify(logs, artifacts).unwrap_or_else(|error| {
            warn!(%error, "failure classification raised; emitting unknown signal");
            FailureSignal::unknown(
                "classifier",
                format!("classification error: {error}"),
            )
        })
    }

    /// Classify using the step name as the signal source.
    #[must_use]
    pub fn classify_completion(&self, completion: &StepCompletion) -> FailureSignal {
        let mut signal = self.classify(&completion.logs, &completion.artifacts);
        if signal.source != "classifier" {
            signal.source = completion.step_name.as_str().to_string();
        }
        signal
    }

    fn try_classify(
        &self,
        logs: &[String],
        artifacts: &BTreeMap<String, Value>,
    ) -> Result<FailureSignal, ClassifierError> {
        let haystack = build_haystack(logs, artifacts)?;
        let source = artifacts
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("step_logs")
            .to_string();

        let Some((rule, matched_line)) = self.first_match(&haystack) else {
            debug!("no classification rule matched");
            let message = haystack
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map_or_else(
                    || "no classification rule matched".to_string(),
                    |line| truncate_message(&redact_sensitive(line), MAX_MESSAGE_CHARS),
                );
            return Ok(FailureSignal::unknown(source, message));
        };

        let mut signal = FailureSignal {
            failure_type: rule.failure_type,
            source,
            message: truncate_message(&redact_sensitive(matched_line), MAX_MESSAGE_CHARS),
            severity: rule.severity,
            can_retry: rule.can_retry,
            requires_replan: rule.requires_replan,
            evidence: BTreeMap::new(),
        }
        .with_evidence("matched_rule", json!(rule.name));

        if rule.failure_type == FailureType::RateLimit {
            if let Some(seconds) = self.retry_after_seconds(&haystack, artifacts)? {
                signal = signal.with_evidence(RETRY_AFTER_SECONDS, json!(seconds));
            }
        }

        debug!(
            failure_type = %signal.failure_type,
            rule = rule.name,
            "classified step failure"
        );
        Ok(signal)
    }

    fn first_match<'h>(&self, haystack: &'h str) -> Option<(&ClassificationRule, &'h str)> {
        self.rules.iter().find_map(|rule| {
            haystack
                .lines()
                .find(|line| rule.pattern.is_match(line))
                .map(|line| (rule, line))
        })
    }

    fn retry_after_seconds(
        &self,
        haystack: &str,
        artifacts: &BTreeMap<String, Value>,
    ) -> Result<Option<u64>, ClassifierError> {
        if let Some(value) = artifacts.get(RETRY_AFTER_SECONDS) {
            return value
                .as_u64()
                .map(Some)
                .ok_or_else(|| ClassifierError::MalformedRetryAfter(value.to_string()));
        }

        let Some(pattern) = &self.retry_after else {
            return Ok(None);
        };
        pattern
            .captures(haystack)
            .and_then(|captures| captures.get(1))
            .map(|raw| {
                let trimmed = raw.as_str().trim_end_matches(|c: char| !c.is_ascii_digit());
                trimmed
                    .parse::<u64>()
                    .map_err(|_| ClassifierError::MalformedRetryAfter(raw.as_str().to_string()))
            })
            .transpose()
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::standard()
    }
}

/// Flatten logs plus the textual artifacts into one searchable body.
fn build_haystack(
    logs: &[String],
    artifacts: &BTreeMap<String, Value>,
) -> Result<String, ClassifierError> {
    let mut lines: Vec<String> = Vec::new();

    if let Some(status) = artifacts.get("http_status") {
        let code = status.as_u64().ok_or_else(|| ClassifierError::MalformedArtifact {
            key: "http_status".to_string(),
            detail: format!("expected integer, got {status}"),
        })?;
        lines.push(format!("http_status={code}"));
    }

    for key in ["stderr", "stdout", "error"] {
        match artifacts.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => lines.extend(text.lines().map(str::to_string)),
            Some(other) => {
                return Err(ClassifierError::MalformedArtifact {
                    key: key.to_string(),
                    detail: format!("expected string, got {other}"),
                })
            }
        }
    }

    lines.extend(logs.iter().flat_map(|log| log.lines().map(str::to_string)));
    Ok(lines.join("\n"))
}
