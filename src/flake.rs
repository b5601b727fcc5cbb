#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::FlakeConfig;
use crate::types::CaseRunRecord;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const INSUFFICIENT_DATA: &str = "insufficient data";
pub const INCONSISTENT_PATTERN: &str = "inconsistent pass/fail pattern";
pub const HIGH_LATENCY_VARIANCE: &str = "high latency variance";
pub const PROVIDER_ERRORS: &str = "intermittent provider errors";

const FLAKY_FROM: f64 = 0.3;
const QUARANTINE_FROM: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlakeClass {
    Stable,
    Flaky,
    QuarantineRecommended,
}

impl FlakeClass {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < FLAKY_FROM {
            Self::Stable
        } else if score < QUARANTINE_FROM {
            Self::Flaky
        } else {
            Self::QuarantineRecommended
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "STABLE",
            Self::Flaky => "FLAKY",
            Self::QuarantineRecommended => "QUARANTINE_RECOMMENDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakeAnalysis {
    pub score: f64,
    pub class: FlakeClass,
    pub reasons: Vec<String>,
    pub runs_analyzed: usize,
    pub alternations: usize,
    pub latency_cv: Option<f64>,
    pub provider_error_rate: f64,
}

impl FlakeAnalysis {
    fn insufficient(runs: usize, min_runs: usize) -> Self {
        Self {
            score: 0.0,
            class: FlakeClass::Stable,
            reasons: vec![format!("{INSUFFICIENT_DATA}: {runs} of {min_runs} runs")],
            runs_analyzed: runs,
            alternations: 0,
            latency_cv: None,
            provider_error_rate: 0.0,
        }
    }
}

/// Scores how non-deterministically a case passes, from its execution history.
#[derive(Debug, Clone)]
pub struct FlakeDetector {
    config: FlakeConfig,
    provider_patterns: Vec<Regex>,
}

impl Default for FlakeDetector {
    fn default() -> Self {
        Self::new(FlakeConfig::default())
    }
}

impl FlakeDetector {
    /// Patterns that fail to compile are logged and skipped.
    #[must_use]
    pub fn new(config: FlakeConfig) -> Self {
        let provider_patterns = config
            .provider_error_patterns
            .iter()
            .filter_map(|pattern| {
                Regex::new(pattern)
                    .map_err(|error| warn!(pattern, %error, "ignoring provider error pattern"))
                    .ok()
            })
            .collect();
        Self {
            config,
            provider_patterns,
        }
    }

    /// Additive score in `[0, 1]` over pass/fail alternation, latency spread and
    /// provider error rate, each contributing once its threshold is crossed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn analyze_case_flakiness(&self, history: &[CaseRunRecord]) -> FlakeAnalysis {
        let runs = history.len();
        if runs < self.config.min_runs.max(2) {
            return FlakeAnalysis::insufficient(runs, self.config.min_runs);
        }

        let mut score = 0.0;
        let mut reasons = Vec::new();

        let alternations = history
            .iter()
            .tuple_windows()
            .filter(|(previous, next)| previous.passed != next.passed)
            .count();
        if alternations > self.config.alternation_threshold {
            let ratio = alternations as f64 / (runs - 1) as f64;
            score += self.config.alternation_weight * ratio;
            reasons.push(format!(
                "{INCONSISTENT_PATTERN} ({alternations} flips in {runs} runs)"
            ));
        }

        let latency_cv = coefficient_of_variation(history);
        if let Some(cv) = latency_cv.filter(|cv| *cv > self.config.latency_cv_threshold) {
            score += self.config.latency_weight * cv.min(1.0);
            reasons.push(format!("{HIGH_LATENCY_VARIANCE} (cv {cv:.2})"));
        }

        let provider_errors = history
            .iter()
            .filter(|record| {
                record.error.as_deref().is_some_and(|error| {
                    self.provider_patterns
                        .iter()
                        .any(|pattern| pattern.is_match(error))
                })
            })
            .count();
        let provider_error_rate = provider_errors as f64 / runs as f64;
        if provider_error_rate > self.config.provider_error_threshold {
            score += self.config.provider_error_weight * provider_error_rate;
            reasons.push(format!(
                "{PROVIDER_ERRORS} ({provider_errors} of {runs} runs)"
            ));
        }

        let score = score.clamp(0.0, 1.0);
        FlakeAnalysis {
            score,
            class: FlakeClass::from_score(score),
            reasons,
            runs_analyzed: runs,
            alternations,
            latency_cv,
            provider_error_rate,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn coefficient_of_variation(history: &[CaseRunRecord]) -> Option<f64> {
    let count = history.len() as f64;
    let mean = history.iter().map(|record| record.latency_ms as f64).sum::<f64>() / count;
    if mean <= 0.0 || !mean.is_finite() {
        return None;
    }
    let variance = history
        .iter()
        .map(|record| (record.latency_ms as f64 - mean).powi(2))
        .sum::<f64>()
        / count;
    Some(variance.sqrt() / mean)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn run(passed: bool, latency_ms: u64) -> CaseRunRecord {
        CaseRunRecord::new(passed, latency_ms, None)
    }

    fn failed_with(error: &str) -> CaseRunRecord {
        CaseRunRecord::new(false, 100, Some(error.to_string()))
    }

    #[test]
    fn given_four_runs_when_analyzing_then_insufficient_data_is_stable() {
        let history: Vec<_> = (0..4).map(|n| run(n % 2 == 0, 100)).collect();
        let analysis = FlakeDetector::default().analyze_case_flakiness(&history);

        assert!(analysis.score.abs() < f64::EPSILON);
        assert_eq!(analysis.class, FlakeClass::Stable);
        assert!(analysis.reasons[0].contains(INSUFFICIENT_DATA));
    }

    #[test]
    fn given_alternating_results_when_analyzing_then_pattern_is_reported() {
        let history = [
            run(true, 100),
            run(false, 100),
            run(true, 100),
            run(false, 100),
            run(true, 100),
        ];
        let analysis = FlakeDetector::default().analyze_case_flakiness(&history);

        assert!(analysis.score > 0.0);
        assert_eq!(analysis.alternations, 4);
        assert!(analysis
            .reasons
            .iter()
            .any(|reason| reason.contains(INCONSISTENT_PATTERN)));
        assert_eq!(analysis.class, FlakeClass::Flaky);
    }

    #[test]
    fn steady_passing_case_scores_zero() {
        let history: Vec<_> = (0..10).map(|_| run(true, 120)).collect();
        let analysis = FlakeDetector::default().analyze_case_flakiness(&history);

        assert!(analysis.score.abs() < f64::EPSILON);
        assert!(analysis.reasons.is_empty());
        assert_eq!(analysis.class, FlakeClass::Stable);
    }

    #[test]
    fn latency_spread_is_reported() {
        let history = [
            run(true, 10),
            run(true, 900),
            run(true, 15),
            run(true, 1_200),
            run(true, 20),
        ];
        let analysis = FlakeDetector::default().analyze_case_flakiness(&history);

        assert!(analysis.latency_cv.unwrap() > 0.5);
        assert!(analysis
            .reasons
            .iter()
            .any(|reason| reason.contains(HIGH_LATENCY_VARIANCE)));
    }

    #[test]
    fn all_signals_together_recommend_quarantine() {
        let history = [
            run(true, 10),
            failed_with("HTTP 503 service unavailable"),
            run(true, 1_500),
            failed_with("provider rate limit hit"),
            run(true, 20),
            failed_with("upstream timed out"),
            run(true, 2_000),
        ];
        let analysis = FlakeDetector::default().analyze_case_flakiness(&history);

        assert_eq!(analysis.class, FlakeClass::QuarantineRecommended);
        assert_eq!(analysis.reasons.len(), 3);
        assert!(analysis.score <= 1.0);
    }

    #[test]
    fn score_bands_match_thresholds() {
        assert_eq!(FlakeClass::from_score(0.29), FlakeClass::Stable);
        assert_eq!(FlakeClass::from_score(0.3), FlakeClass::Flaky);
        assert_eq!(FlakeClass::from_score(0.69), FlakeClass::Flaky);
        assert_eq!(FlakeClass::from_score(0.7), FlakeClass::QuarantineRecommended);
    }
}
