//! Budget types for attempt, wall-clock and cost accounting.
//!
//! Limits are supplied per tenant or per run; usage is accumulated by the
//! budget tracker while a run executes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single budget axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Attempts,
    TimeSeconds,
    CostUsd,
}

impl BudgetDimension {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Attempts => "attempts",
            Self::TimeSeconds => "time_seconds",
            Self::CostUsd => "cost_usd",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Maximum auto-fix attempts across all steps.
    pub attempts: u32,
    /// Maximum wall-clock seconds since the run started.
    pub time_seconds: u64,
    /// Maximum estimated spend.
    pub cost_usd: f64,
}

impl BudgetLimits {
    #[must_use]
    pub const fn new(attempts: u32, time_seconds: u64, cost_usd: f64) -> Self {
        Self {
            attempts,
            time_seconds,
            cost_usd,
        }
    }

    /// First dimension the given usage exceeds, in attempts/time/cost order.
    #[must_use]
    pub fn exceeded_dimension(&self, usage: &BudgetUsage) -> Option<BudgetDimension> {
        if usage.attempts > self.attempts {
            Some(BudgetDimension::Attempts)
        } else if usage.elapsed_seconds > self.time_seconds {
            Some(BudgetDimension::TimeSeconds)
        } else if usage.cost_usd > self.cost_usd {
            Some(BudgetDimension::CostUsd)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_exceeded(&self, usage: &BudgetUsage) -> bool {
        self.exceeded_dimension(usage).is_some()
    }

    /// Calculate remaining budget given current usage.
    #[must_use]
    pub fn remaining(&self, usage: &BudgetUsage) -> BudgetRemaining {
        BudgetRemaining {
            attempts: self.attempts.saturating_sub(usage.attempts),
            time_seconds: self.time_seconds.saturating_sub(usage.elapsed_seconds),
            cost_usd: (self.cost_usd - usage.cost_usd).max(0.0),
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::new(10, 1_800, 10.0)
    }
}

/// Consumed budget for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BudgetUsage {
    pub attempts: u32,
    pub elapsed_seconds: u64,
    pub cost_usd: f64,
}

/// Remaining budget after accounting for usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetRemaining {
    pub attempts: u32,
    pub time_seconds: u64,
    pub cost_usd: f64,
}

impl BudgetRemaining {
    /// Check if any budget dimension is exhausted.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts == 0 || self.time_seconds == 0 || self.cost_usd <= 0.0
    }
}
