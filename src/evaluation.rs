#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{EngineError, Result};
use crate::types::{Assertion, CaseId, CaseScore, EvalCase, EvalReport, RunId};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    RegexMatch,
    RegexNotMatch,
    IsEmpty,
    NotEmpty,
    IsTrue,
    IsFalse,
}

impl AssertionKind {
    pub const ALL: [Self; 12] = [
        Self::Contains,
        Self::NotContains,
        Self::Equals,
        Self::NotEquals,
        Self::GreaterThan,
        Self::LessThan,
        Self::RegexMatch,
        Self::RegexNotMatch,
        Self::IsEmpty,
        Self::NotEmpty,
        Self::IsTrue,
        Self::IsFalse,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::RegexMatch => "regex_match",
            Self::RegexNotMatch => "regex_not_match",
            Self::IsEmpty => "is_empty",
            Self::NotEmpty => "not_empty",
            Self::IsTrue => "is_true",
            Self::IsFalse => "is_false",
        }
    }

    /// Outcome when the key resolves nowhere. Only checks that assert absence pass.
    #[must_use]
    pub const fn passes_when_absent(&self) -> bool {
        matches!(self, Self::NotContains | Self::RegexNotMatch | Self::IsEmpty)
    }

    /// Parse a kind, accepting any case and `-` for `_`.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownAssertion` for anything outside the twelve kinds.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| EngineError::UnknownAssertion(raw.to_string()))
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub kind: AssertionKind,
    pub key: String,
    pub passed: bool,
    pub optional: bool,
    pub actual_value: Option<Value>,
    pub expected: Value,
    pub message: String,
}

/// Scored result of one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub case_id: CaseId,
    pub results: Vec<AssertionResult>,
    pub passed: usize,
    pub total: usize,
    pub required_failed: usize,
    pub pass_rate: f64,
    pub all_required_passed: bool,
}

impl CaseOutcome {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.passed < self.total
    }
}

/// A case outcome plus whether quarantine excludes it from gating.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedOutcome {
    pub outcome: CaseOutcome,
    pub quarantined: bool,
}

/// Executes assertions against a case's result payload.
#[derive(Debug, Clone, Default)]
pub struct EvaluationEngine {
    context: Map<String, Value>,
}

impl EvaluationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset values consulted when the payload does not carry a key.
    #[must_use]
    pub fn with_context(context: Map<String, Value>) -> Self {
        Self { context }
    }

    /// Resolve `key`: direct (or dotted path) lookup, then a depth-first search
    /// through nested objects, then the preset context.
    #[must_use]
    pub fn resolve(&self, key: &str, payload: &Value) -> Option<Value> {
        lookup_path(payload, key)
            .or_else(|| search_nested(payload, key))
            .or_else(|| self.context.get(key))
            .cloned()
    }

    /// # Errors
    /// Returns `EngineError::UnknownAssertion` when the assertion kind is not recognized.
    pub fn evaluate_assertion(&self, assertion: &Assertion, payload: &Value) -> Result<AssertionResult> {
        let kind = AssertionKind::parse(&assertion.kind)?;
        let actual = self.resolve(&assertion.key, payload);
        let (passed, message) = match &actual {
            None => (
                kind.passes_when_absent(),
                format!("`{}` not found", assertion.key),
            ),
            Some(value) => check(kind, value, &assertion.expected),
        };
        Ok(AssertionResult {
            kind,
            key: assertion.key.clone(),
            passed,
            optional: assertion.optional,
            actual_value: actual,
            expected: assertion.expected.clone(),
            message,
        })
    }

    /// Score every assertion of a case.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownAssertion` on the first unrecognized kind.
    pub fn evaluate_case(&self, case: &EvalCase, payload: &Value) -> Result<CaseOutcome> {
        let results = case
            .assertions
            .iter()
            .map(|assertion| self.evaluate_assertion(assertion, payload))
            .collect::<Result<Vec<_>>>()?;
        Ok(score_case(case.case_id.clone(), results))
    }
}

/// `pass_rate = passed / total` with optional assertions in the denominator;
/// `required_failed` counts only non-optional failures.
#[must_use]
pub fn score_case(case_id: CaseId, results: Vec<AssertionResult>) -> CaseOutcome {
    let total = results.len();
    let passed = results.iter().filter(|result| result.passed).count();
    let required_failed = results
        .iter()
        .filter(|result| !result.passed && !result.optional)
        .count();
    CaseOutcome {
        case_id,
        results,
        passed,
        total,
        required_failed,
        pass_rate: ratio(passed, total),
        all_required_passed: required_failed == 0,
    }
}

/// Aggregate case outcomes into the iteration's report. Quarantined outcomes are
/// kept in `scores` but excluded from the pass rate and required-failure count.
#[must_use]
pub fn build_report(run_id: RunId, iteration: u32, outcomes: &[GatedOutcome]) -> EvalReport {
    let scores: BTreeMap<CaseId, CaseScore> = outcomes
        .iter()
        .map(|gated| {
            (
                gated.outcome.case_id.clone(),
                CaseScore {
                    passed: gated.outcome.passed,
                    total: gated.outcome.total,
                    required_failed: gated.outcome.required_failed,
                    quarantined: gated.quarantined,
                },
            )
        })
        .collect();

    let gating = outcomes.iter().filter(|gated| !gated.quarantined);
    let (passed, total, required_failed, failed_cases) = gating.fold(
        (0_usize, 0_usize, 0_usize, Vec::new()),
        |(passed, total, required_failed, mut failed), gated| {
            if gated.outcome.has_failures() {
                failed.push(gated.outcome.case_id.clone());
            }
            (
                passed + gated.outcome.passed,
                total + gated.outcome.total,
                required_failed + gated.outcome.required_failed,
                failed,
            )
        },
    );

    EvalReport {
        run_id,
        iteration,
        scores,
        failed_cases,
        pass_rate: ratio(passed, total),
        required_failed,
        all_required_passed: required_failed == 0,
        created_at: Utc::now(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(passed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        passed as f64 / total as f64
    }
}

fn lookup_path<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    let object = payload.as_object()?;
    if let Some(direct) = object.get(key) {
        return Some(direct);
    }
    if !key.contains('.') {
        return None;
    }
    key.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn search_nested<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    match payload {
        Value::Object(map) => map.get(key).or_else(|| {
            map.values()
                .filter(|value| value.is_object())
                .find_map(|value| search_nested(value, key))
        }),
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(_), Value::Number(_)) => {
            number_of(actual).zip(number_of(expected)).is_some_and(|(a, e)| (a - e).abs() < f64::EPSILON)
        }
        _ => actual == expected,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        other => text_of(other).contains(&text_of(expected)),
    }
}

fn regex_matches(actual: &Value, pattern: &Value) -> std::result::Result<bool, String> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| format!("pattern must be a string, got {pattern}"))?;
    Regex::new(pattern)
        .map(|regex| regex.is_match(&text_of(actual)))
        .map_err(|e| format!("invalid pattern `{pattern}`: {e}"))
}

fn truthiness(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn check(kind: AssertionKind, actual: &Value, expected: &Value) -> (bool, String) {
    let compare = |op: fn(f64, f64) -> bool, symbol: &str| match (number_of(actual), number_of(expected)) {
        (Some(a), Some(e)) => (op(a, e), format!("{a} {symbol} {e}")),
        _ => (false, format!("cannot compare {actual} {symbol} {expected} numerically")),
    };

    match kind {
        AssertionKind::Contains => {
            let passed = contains(actual, expected);
            (passed, format!("{actual} contains {expected}: {passed}"))
        }
        AssertionKind::NotContains => {
            let passed = !contains(actual, expected);
            (passed, format!("{actual} lacks {expected}: {passed}"))
        }
        AssertionKind::Equals => {
            let passed = values_equal(actual, expected);
            (passed, format!("{actual} == {expected}: {passed}"))
        }
        AssertionKind::NotEquals => {
            let passed = !values_equal(actual, expected);
            (passed, format!("{actual} != {expected}: {passed}"))
        }
        AssertionKind::GreaterThan => compare(|a, e| a > e, ">"),
        AssertionKind::LessThan => compare(|a, e| a < e, "<"),
        AssertionKind::RegexMatch => match regex_matches(actual, expected) {
            Ok(matched) => (matched, format!("{actual} matches {expected}: {matched}")),
            Err(reason) => (false, reason),
        },
        AssertionKind::RegexNotMatch => match regex_matches(actual, expected) {
            Ok(matched) => (!matched, format!("{actual} avoids {expected}: {}", !matched)),
            Err(reason) => (false, reason),
        },
        AssertionKind::IsEmpty => {
            let passed = is_empty_value(actual);
            (passed, format!("{actual} is empty: {passed}"))
        }
        AssertionKind::NotEmpty => {
            let passed = !is_empty_value(actual);
            (passed, format!("{actual} is non-empty: {passed}"))
        }
        AssertionKind::IsTrue => {
            let passed = truthiness(actual) == Some(true);
            (passed, format!("{actual} is true: {passed}"))
        }
        AssertionKind::IsFalse => {
            let passed = truthiness(actual) == Some(false);
            (passed, format!("{actual} is false: {passed}"))
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_kind(kind: &str, key: &str, expected: Value, payload: &Value) -> AssertionResult {
        EvaluationEngine::new()
            .evaluate_assertion(&Assertion::new(kind, key, expected), payload)
            .unwrap()
    }

    #[test]
    fn given_contains_hello_when_output_matches_then_passes_with_actual_value() {
        let result = assert_kind("CONTAINS", "output", json!("hello"), &json!({"output": "hello world"}));
        assert!(result.passed);
        assert_eq!(result.actual_value, Some(json!("hello world")));
        assert_eq!(result.kind, AssertionKind::Contains);
    }

    #[test]
    fn given_one_required_and_one_optional_failure_then_scores_follow_rules() {
        let case = EvalCase {
            case_id: CaseId::new("c1"),
            input: Value::Null,
            assertions: vec![
                Assertion::new("equals", "status", json!(200)),
                Assertion::new("contains", "body", json!("welcome")).optional(),
                Assertion::new("not_empty", "body", Value::Null),
                Assertion::new("is_true", "ok", Value::Null),
            ],
        };
        let payload = json!({"status": 500, "body": "error page", "ok": true});
        let outcome = EvaluationEngine::new().evaluate_case(&case, &payload).unwrap();

        assert_eq!(outcome.required_failed, 1);
        assert!(!outcome.all_required_passed);
        assert!((outcome.pass_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn given_unknown_kind_when_evaluating_then_error_is_raised() {
        let result = EvaluationEngine::new().evaluate_assertion(
            &Assertion::new("roughly_equals", "output", json!(1)),
            &json!({"output": 1}),
        );
        assert!(matches!(result, Err(EngineError::UnknownAssertion(kind)) if kind == "roughly_equals"));
    }

    #[test]
    fn unknown_kind_fails_the_whole_case() {
        let case = EvalCase {
            case_id: CaseId::new("c1"),
            input: Value::Null,
            assertions: vec![
                Assertion::new("equals", "a", json!(1)),
                Assertion::new("fuzzy", "a", json!(1)),
            ],
        };
        assert!(EvaluationEngine::new().evaluate_case(&case, &json!({"a": 1})).is_err());
    }

    #[test]
    fn resolution_prefers_direct_then_nested_then_context() {
        let mut context = Map::new();
        context.insert("region".to_string(), json!("eu-west"));
        context.insert("status".to_string(), json!("from-context"));
        let engine = EvaluationEngine::with_context(context);
        let payload = json!({
            "status": "direct",
            "response": {"meta": {"region": "us-east", "latency_ms": 12}}
        });

        assert_eq!(engine.resolve("status", &payload), Some(json!("direct")));
        assert_eq!(engine.resolve("latency_ms", &payload), Some(json!(12)));
        assert_eq!(engine.resolve("response.meta.region", &payload), Some(json!("us-east")));
        assert_eq!(engine.resolve("region", &json!({})), Some(json!("eu-west")));
        assert_eq!(engine.resolve("missing", &payload), None);
    }

    #[test]
    fn absent_values_pass_only_absence_checks() {
        let payload = json!({"other": 1});
        for kind in AssertionKind::ALL {
            let result = assert_kind(kind.as_str(), "missing", json!("x"), &payload);
            assert_eq!(result.passed, kind.passes_when_absent(), "{kind}");
            assert_eq!(result.actual_value, None);
        }
    }

    #[test]
    fn every_kind_evaluates_against_present_values() {
        let payload = json!({
            "text": "order 42 created",
            "tags": ["crm", "deals"],
            "count": 7,
            "count_text": "7.5",
            "empty": "",
            "flag": true,
            "off": "false"
        });
        let cases = [
            ("contains", "tags", json!("crm"), true),
            ("not_contains", "text", json!("deleted"), true),
            ("equals", "count", json!(7.0), true),
            ("not_equals", "count", json!(8), true),
            ("greater_than", "count_text", json!(7), true),
            ("less_than", "count", json!(3), false),
            ("regex_match", "text", json!(r"order \d+"), true),
            ("regex_not_match", "text", json!(r"^error"), true),
            ("is_empty", "empty", Value::Null, true),
            ("not_empty", "tags", Value::Null, true),
            ("is_true", "flag", Value::Null, true),
            ("is_false", "off", Value::Null, true),
            ("is_false", "flag", Value::Null, false),
        ];
        for (kind, key, expected, should_pass) in cases {
            let result = assert_kind(kind, key, expected, &payload);
            assert_eq!(result.passed, should_pass, "{kind} on {key}: {}", result.message);
        }
    }

    #[test]
    fn invalid_regex_fails_instead_of_erroring() {
        let result = assert_kind("regex_match", "text", json!("(unclosed"), &json!({"text": "x"}));
        assert!(!result.passed);
        assert!(result.message.contains("invalid pattern"));
    }

    #[test]
    fn report_excludes_quarantined_cases_from_gating() {
        let passing = score_case(
            CaseId::new("stable"),
            vec![AssertionResult {
                kind: AssertionKind::Equals,
                key: "a".to_string(),
                passed: true,
                optional: false,
                actual_value: Some(json!(1)),
                expected: json!(1),
                message: String::new(),
            }],
        );
        let mut failing = passing.clone();
        failing.case_id = CaseId::new("flaky");
        failing.results[0].passed = false;
        let failing = score_case(failing.case_id, failing.results);

        let run_id = RunId::generate();
        let gated = build_report(
            run_id,
            1,
            &[
                GatedOutcome { outcome: passing.clone(), quarantined: false },
                GatedOutcome { outcome: failing.clone(), quarantined: true },
            ],
        );
        assert!((gated.pass_rate - 1.0).abs() < f64::EPSILON);
        assert!(gated.all_required_passed);
        assert!(gated.failed_cases.is_empty());
        assert!(gated.scores[&CaseId::new("flaky")].quarantined);

        let strict = build_report(
            run_id,
            1,
            &[
                GatedOutcome { outcome: passing, quarantined: false },
                GatedOutcome { outcome: failing, quarantined: false },
            ],
        );
        assert!((strict.pass_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(strict.required_failed, 1);
        assert_eq!(strict.failed_cases, vec![CaseId::new("flaky")]);
    }
}
