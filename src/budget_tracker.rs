#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{EngineError, Result};
use crate::types::{BudgetDimension, BudgetLimits, BudgetRemaining, BudgetUsage, RunId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy)]
struct RunBudget {
    limits: BudgetLimits,
    attempts: u32,
    cost_usd: f64,
    started_at: DateTime<Utc>,
}

impl RunBudget {
    fn usage_at(&self, now: DateTime<Utc>) -> BudgetUsage {
        BudgetUsage {
            attempts: self.attempts,
            elapsed_seconds: u64::try_from(now.signed_duration_since(self.started_at).num_seconds())
                .unwrap_or(0),
            cost_usd: self.cost_usd,
        }
    }
}

/// Attempt, wall-clock and cost accounting per run.
///
/// Each run owns one mutex-guarded counter so concurrent steps touching the same
/// run never lose an update, while different runs never contend.
#[derive(Default)]
pub struct BudgetTracker {
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunBudget>>>>,
}

impl BudgetTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a run. Re-registering keeps the existing counters, so a
    /// recovered run resumes where it stopped.
    pub async fn register(
        &self,
        run_id: RunId,
        limits: BudgetLimits,
        usage: BudgetUsage,
        started_at: DateTime<Utc>,
    ) {
        self.runs.write().await.entry(run_id).or_insert_with(|| {
            Arc::new(Mutex::new(RunBudget {
                limits,
                attempts: usage.attempts,
                cost_usd: usage.cost_usd,
                started_at,
            }))
        });
    }

    async fn slot(&self, run_id: RunId) -> Result<Arc<Mutex<RunBudget>>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::RunNotFound(format!("no budget tracked for run {run_id}")))
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn record_attempt(&self, run_id: RunId) -> Result<BudgetUsage> {
        let slot = self.slot(run_id).await?;
        let mut budget = slot.lock().await;
        budget.attempts = budget.attempts.saturating_add(1);
        Ok(budget.usage_at(Utc::now()))
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn record_cost(&self, run_id: RunId, cost_usd: f64) -> Result<BudgetUsage> {
        let slot = self.slot(run_id).await?;
        let mut budget = slot.lock().await;
        if cost_usd.is_finite() && cost_usd > 0.0 {
            budget.cost_usd += cost_usd;
        }
        Ok(budget.usage_at(Utc::now()))
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn usage(&self, run_id: RunId) -> Result<BudgetUsage> {
        self.usage_at(run_id, Utc::now()).await
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn usage_at(&self, run_id: RunId, now: DateTime<Utc>) -> Result<BudgetUsage> {
        let slot = self.slot(run_id).await?;
        let budget = slot.lock().await;
        Ok(budget.usage_at(now))
    }

    /// The first dimension over its limit, if any.
    ///
    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn exceeded(&self, run_id: RunId) -> Result<Option<BudgetDimension>> {
        self.exceeded_at(run_id, Utc::now()).await
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn exceeded_at(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<Option<BudgetDimension>> {
        let slot = self.slot(run_id).await?;
        let budget = slot.lock().await;
        Ok(budget.limits.exceeded_dimension(&budget.usage_at(now)))
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run was never registered.
    pub async fn remaining(&self, run_id: RunId) -> Result<BudgetRemaining> {
        let slot = self.slot(run_id).await?;
        let budget = slot.lock().await;
        Ok(budget.limits.remaining(&budget.usage_at(Utc::now())))
    }

    /// Stop tracking a finished run and return its final usage.
    pub async fn release(&self, run_id: RunId) -> Option<BudgetUsage> {
        let slot = self.runs.write().await.remove(&run_id)?;
        let budget = slot.lock().await;
        Some(budget.usage_at(Utc::now()))
    }
}
