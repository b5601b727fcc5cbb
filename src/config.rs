#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{EngineError, Result};
use crate::types::{BudgetLimits, CircuitConfig, QuarantineGating, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = ".buildloop/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub log_filter: String,
    pub pipeline_version: String,
    pub default_max_iterations: u32,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitConfig,
    pub budget: BudgetLimits,
    pub evaluation: EvaluationConfig,
    pub flake: FlakeConfig,
    pub quarantine: QuarantineConfig,
    pub canary: CanaryConfig,
    pub worker: WorkerConfig,
    pub tenants: BTreeMap<String, TenantOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            log_filter: "info".to_string(),
            pipeline_version: "v1".to_string(),
            default_max_iterations: 5,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitConfig::default(),
            budget: BudgetLimits::default(),
            evaluation: EvaluationConfig::default(),
            flake: FlakeConfig::default(),
            quarantine: QuarantineConfig::default(),
            canary: CanaryConfig::default(),
            worker: WorkerConfig::default(),
            tenants: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_seconds: u64,
    pub max_seconds: u64,
    /// Returned whenever the backoff computation itself fails.
    pub fallback_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 300,
            fallback_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Minimum pass rate for an iteration to count as passing.
    pub pass_threshold: f64,
    /// Risk score at or above which a passing iteration needs human approval.
    pub approval_risk_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 1.0,
            approval_risk_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakeConfig {
    pub min_runs: usize,
    pub alternation_threshold: usize,
    pub latency_cv_threshold: f64,
    pub provider_error_threshold: f64,
    pub alternation_weight: f64,
    pub latency_weight: f64,
    pub provider_error_weight: f64,
    pub provider_error_patterns: Vec<String>,
}

impl Default for FlakeConfig {
    fn default() -> Self {
        Self {
            min_runs: 5,
            alternation_threshold: 2,
            latency_cv_threshold: 0.5,
            provider_error_threshold: 0.2,
            alternation_weight: 0.4,
            latency_weight: 0.3,
            provider_error_weight: 0.3,
            provider_error_patterns: vec![
                r"(?i)rate.?limit".to_string(),
                r"\b(429|502|503|504)\b".to_string(),
                r"(?i)timed?\s?out".to_string(),
                r"(?i)connection (reset|refused)".to_string(),
                r"(?i)overloaded".to_string(),
                r"ECONNRESET".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub ttl_secs: u64,
    pub gating: QuarantineGating,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            gating: QuarantineGating::MonitorOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub baseline_version: String,
    pub candidate_version: Option<String>,
    /// Share of tenants, 0..=100, routed to the candidate.
    pub percentage: u8,
    /// Runs slower than this count as SLA violations.
    pub sla_latency_ms: u64,
    /// Most recent run latencies kept per version for the p95.
    pub latency_window: usize,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            baseline_version: "v1".to_string(),
            candidate_version: None,
            percentage: 0,
            sla_latency_ms: 600_000,
            latency_window: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub step_timeout_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 256,
            step_timeout_secs: 120,
            heartbeat_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TenantOverrides {
    pub circuit_failure_threshold: Option<u32>,
    pub budget: Option<BudgetLimits>,
}

impl EngineConfig {
    /// Breaker configuration for one tenant, honouring its threshold override.
    #[must_use]
    pub fn circuit_config_for(&self, tenant: &TenantId) -> CircuitConfig {
        self.tenants
            .get(tenant.value())
            .and_then(|overrides| overrides.circuit_failure_threshold)
            .map_or(self.circuit_breaker, |threshold| CircuitConfig {
                failure_threshold: threshold,
                ..self.circuit_breaker
            })
    }

    /// System default budget for a tenant.
    #[must_use]
    pub fn budget_for(&self, tenant: &TenantId) -> BudgetLimits {
        self.tenants
            .get(tenant.value())
            .and_then(|overrides| overrides.budget)
            .unwrap_or(self.budget)
    }

    /// # Errors
    /// Returns `EngineError::ConfigError` for out-of-range values or a bad database URL.
    pub fn validate(&self) -> Result<()> {
        if let Some(database_url) = &self.database_url {
            validate_database_url(database_url)?;
        }
        if !(0.0..=1.0).contains(&self.evaluation.pass_threshold) {
            return Err(EngineError::ConfigError(format!(
                "evaluation.pass_threshold must be within [0, 1], got {}",
                self.evaluation.pass_threshold
            )));
        }
        if self.canary.percentage > 100 {
            return Err(EngineError::ConfigError(format!(
                "canary.percentage must be within [0, 100], got {}",
                self.canary.percentage
            )));
        }
        if self.worker.pool_size == 0 || self.worker.queue_capacity == 0 {
            return Err(EngineError::ConfigError(
                "worker.pool_size and worker.queue_capacity must be positive".to_string(),
            ));
        }
        if self.retry.base_seconds == 0 {
            return Err(EngineError::ConfigError(
                "retry.base_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `BUILDLOOP_*` overrides using the supplied lookup.
    #[must_use]
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(url) = non_empty("BUILDLOOP_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(workers) = non_empty("BUILDLOOP_WORKERS").and_then(|v| v.parse().ok()) {
            self.worker.pool_size = workers;
        }
        if let Some(filter) = non_empty("BUILDLOOP_LOG") {
            self.log_filter = filter;
        }
        self.database_url = self.database_url.map(|url| expand_env_vars(&url, &lookup));
        self
    }
}

/// Load configuration from `path` (or the default location). A missing file
/// yields defaults; environment overrides are applied afterwards.
///
/// # Errors
/// Returns `EngineError::ConfigError` if the file cannot be read, parsed or validated.
pub async fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let base = if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| EngineError::ConfigError(format!("Failed to read config: {e}")))?;
        parse_config_content(&content, &config_path)?
    } else {
        EngineConfig::default()
    };

    let config = base.with_env_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// # Errors
/// Returns `EngineError::ConfigError` when the content is not valid TOML for `EngineConfig`.
pub fn parse_config_content(content: &str, origin: &Path) -> Result<EngineConfig> {
    toml::from_str(content).map_err(|e| {
        EngineError::ConfigError(format!("Invalid config {}: {e}", origin.display()))
    })
}

fn validate_database_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| EngineError::ConfigError(format!("Invalid database URL: {e}")))?;
    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => Err(EngineError::ConfigError(format!(
            "Unsupported database scheme: {other}"
        ))),
    }
}

fn expand_env_vars<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = input.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_part = &result[start + 2..start + end];
            let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
            let value = lookup(var_name).unwrap_or_else(|| default.to_string());
            result.replace_range(start..=(start + end), &value);
        } else {
            break;
        }
    }
    result
}
