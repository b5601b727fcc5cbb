use super::StepName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-run retry counters. Mutated only by the auto-fix executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryState {
    pub per_step_attempts: BTreeMap<StepName, u32>,
    pub total_attempts: u32,
    pub last_backoff_seconds: u64,
}

impl RetryState {
    #[must_use]
    pub fn attempts_for(&self, step: StepName) -> u32 {
        self.per_step_attempts.get(&step).copied().unwrap_or(0)
    }

    /// Count one attempt against `step` and the run total.
    pub fn record_attempt(&mut self, step: StepName) {
        let entry = self.per_step_attempts.entry(step).or_insert(0);
        *entry = entry.saturating_add(1);
        self.total_attempts = self.total_attempts.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_attempt_increments_step_and_total() {
        let mut state = RetryState::default();
        state.record_attempt(StepName::Codegen);
        state.record_attempt(StepName::Codegen);
        state.record_attempt(StepName::Evaluate);

        assert_eq!(state.attempts_for(StepName::Codegen), 2);
        assert_eq!(state.attempts_for(StepName::Evaluate), 1);
        assert_eq!(state.attempts_for(StepName::Plan), 0);
        assert_eq!(state.total_attempts, 3);
    }
}
