#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::CanaryConfig;
use crate::metrics::{names, MetricsRegistry};
use crate::types::{RunId, TenantId};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of one finished run, attributed to the pipeline version that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanarySample {
    pub version: String,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub succeeded: bool,
    /// Time from the first failure to the final passing evaluation.
    pub chaos_recovery_ms: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionStats {
    pub version: String,
    pub runs: usize,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub mean_cost_usd: f64,
    pub sla_violation_rate: f64,
    pub mean_chaos_recovery_ms: Option<f64>,
}

/// Candidate minus baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryDeltas {
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: i64,
    pub mean_cost_usd: f64,
    pub sla_violation_rate: f64,
    pub mean_chaos_recovery_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryComparison {
    pub percentage: u8,
    pub baseline: Option<VersionStats>,
    pub candidate: Option<VersionStats>,
    pub deltas: Option<CanaryDeltas>,
}

/// Running totals for one version. Only the latency window is kept per run,
/// and it never grows past the configured size.
#[derive(Debug, Default)]
struct VersionAggregate {
    runs: usize,
    successes: usize,
    latency_sum_ms: f64,
    cost_sum_usd: f64,
    sla_violations: usize,
    recovery_sum_ms: f64,
    recoveries: usize,
    recent_latencies: VecDeque<u64>,
}

impl VersionAggregate {
    #[allow(clippy::cast_precision_loss)]
    fn absorb(&mut self, sample: &CanarySample, sla_latency_ms: u64, window: usize) {
        self.runs += 1;
        if sample.succeeded {
            self.successes += 1;
        }
        self.latency_sum_ms += sample.latency_ms as f64;
        self.cost_sum_usd += sample.cost_usd;
        if sample.latency_ms > sla_latency_ms {
            self.sla_violations += 1;
        }
        if let Some(recovery) = sample.chaos_recovery_ms {
            self.recovery_sum_ms += recovery as f64;
            self.recoveries += 1;
        }
        self.recent_latencies.push_back(sample.latency_ms);
        while self.recent_latencies.len() > window {
            self.recent_latencies.pop_front();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn stats(&self, version: &str) -> VersionStats {
        let count = self.runs as f64;
        let latencies: Vec<u64> = self.recent_latencies.iter().copied().sorted().collect();
        VersionStats {
            version: version.to_string(),
            runs: self.runs,
            success_rate: self.successes as f64 / count,
            mean_latency_ms: self.latency_sum_ms / count,
            p95_latency_ms: percentile(&latencies, 0.95),
            mean_cost_usd: self.cost_sum_usd / count,
            sla_violation_rate: self.sla_violations as f64 / count,
            mean_chaos_recovery_ms: (self.recoveries > 0)
                .then(|| self.recovery_sum_ms / self.recoveries as f64),
        }
    }
}

/// Routes tenants between pipeline versions and collects per-version outcomes.
/// It reports; rollout decisions are made elsewhere.
pub struct CanaryComparator {
    config: CanaryConfig,
    versions: RwLock<BTreeMap<String, VersionAggregate>>,
    metrics: Arc<MetricsRegistry>,
}

impl CanaryComparator {
    #[must_use]
    pub fn new(config: CanaryConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            versions: RwLock::new(BTreeMap::new()),
            metrics,
        }
    }

    /// Stable bucket in `0..100` derived from the tenant id.
    #[must_use]
    pub fn bucket_for(tenant_id: &TenantId) -> u8 {
        let digest = Sha256::digest(tenant_id.value().as_bytes());
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u8::try_from(u64::from_be_bytes(prefix) % 100).unwrap_or(0)
    }

    /// Pipeline version for a tenant's next run.
    #[must_use]
    pub fn assign(&self, tenant_id: &TenantId) -> String {
        match &self.config.candidate_version {
            Some(candidate) if Self::bucket_for(tenant_id) < self.config.percentage => {
                candidate.clone()
            }
            _ => self.config.baseline_version.clone(),
        }
    }

    pub async fn record(&self, sample: CanarySample) {
        let labels = [
            ("version", sample.version.as_str()),
            ("tenant", sample.tenant_id.value()),
        ];
        #[allow(clippy::cast_precision_loss)]
        let latency_ms = sample.latency_ms as f64;
        self.metrics.increment(names::CANARY_RUNS_TOTAL, &labels).await;
        self.metrics
            .observe(names::CANARY_LATENCY_MS, &labels, latency_ms)
            .await;
        self.metrics
            .observe(names::CANARY_COST_USD, &labels, sample.cost_usd)
            .await;
        if sample.latency_ms > self.config.sla_latency_ms {
            self.metrics
                .increment(names::SLA_VIOLATIONS_TOTAL, &labels)
                .await;
        }
        if let Some(recovery) = sample.chaos_recovery_ms {
            #[allow(clippy::cast_precision_loss)]
            let recovery = recovery as f64;
            self.metrics
                .observe(names::CHAOS_RECOVERY_MS, &labels, recovery)
                .await;
        }
        debug!(
            run_id = %sample.run_id,
            version = sample.version.as_str(),
            latency_ms = sample.latency_ms,
            "canary sample recorded"
        );
        self.versions
            .write()
            .await
            .entry(sample.version.clone())
            .or_default()
            .absorb(&sample, self.config.sla_latency_ms, self.config.latency_window.max(1));
    }

    pub async fn compare(&self) -> CanaryComparison {
        let versions = self.versions.read().await;
        let stats_for = |version: &str| {
            versions
                .get(version)
                .map(|aggregate| aggregate.stats(version))
        };
        let baseline = stats_for(&self.config.baseline_version);
        let candidate = self
            .config
            .candidate_version
            .as_deref()
            .and_then(stats_for);
        let deltas = baseline
            .as_ref()
            .zip(candidate.as_ref())
            .map(|(baseline, candidate)| deltas(baseline, candidate));

        CanaryComparison {
            percentage: self.config.percentage,
            baseline,
            candidate,
            deltas,
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn deltas(baseline: &VersionStats, candidate: &VersionStats) -> CanaryDeltas {
    CanaryDeltas {
        success_rate: candidate.success_rate - baseline.success_rate,
        mean_latency_ms: candidate.mean_latency_ms - baseline.mean_latency_ms,
        p95_latency_ms: i64::try_from(candidate.p95_latency_ms).unwrap_or(i64::MAX)
            - i64::try_from(baseline.p95_latency_ms).unwrap_or(i64::MAX),
        mean_cost_usd: candidate.mean_cost_usd - baseline.mean_cost_usd,
        sla_violation_rate: candidate.sla_violation_rate - baseline.sla_violation_rate,
        mean_chaos_recovery_ms: baseline
            .mean_chaos_recovery_ms
            .zip(candidate.mean_chaos_recovery_ms)
            .map(|(baseline, candidate)| candidate - baseline),
    }
}
