#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::breaker::CircuitBreakerRegistry;
use crate::budget_tracker::BudgetTracker;
use crate::diagnostics::{redact_sensitive, truncate_message};
use crate::metrics::{names, MetricsRegistry};
use crate::ports::{CodeGenBackend, PatchProposal, PatchRequest};
use crate::retry_policy::RetryPolicy;
use crate::types::{
    BudgetDimension, BuildRun, CaseId, FailureSignal, FailureType, ReplanRequest, RunFailureReason,
    StepName,
};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Repair approach chosen per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    FixFailingAssertions,
    FixLintFindings,
    RetryAfterTimeout,
    RetryAfterRateLimit,
    RetryTransient,
    ResolveDependency,
    Escalate,
}

impl RepairStrategy {
    /// Dispatch table from failure class to repair strategy.
    #[must_use]
    pub const fn for_failure(failure_type: FailureType) -> Self {
        match failure_type {
            FailureType::TestAssert => Self::FixFailingAssertions,
            FailureType::Lint => Self::FixLintFindings,
            FailureType::Timeout => Self::RetryAfterTimeout,
            FailureType::RateLimit => Self::RetryAfterRateLimit,
            FailureType::Transient => Self::RetryTransient,
            FailureType::Dependency => Self::ResolveDependency,
            FailureType::Unknown => Self::Escalate,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FixFailingAssertions => "fix_failing_assertions",
            Self::FixLintFindings => "fix_lint_findings",
            Self::RetryAfterTimeout => "retry_after_timeout",
            Self::RetryAfterRateLimit => "retry_after_rate_limit",
            Self::RetryTransient => "retry_transient",
            Self::ResolveDependency => "resolve_dependency",
            Self::Escalate => "escalate",
        }
    }

    /// Whether the strategy asks the patch backend for code changes. The others
    /// only wait out the backoff and regenerate.
    #[must_use]
    pub const fn uses_patch_backend(&self) -> bool {
        matches!(
            self,
            Self::FixFailingAssertions | Self::FixLintFindings | Self::ResolveDependency
        )
    }

    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let items: &[&str] = match self {
            Self::FixFailingAssertions => &[
                "re-read the failing cases before changing behaviour",
                "keep passing cases green",
            ],
            Self::FixLintFindings => &["apply the linter's suggested fixes", "keep the diff minimal"],
            Self::RetryAfterTimeout => &["reduce work per step", "raise the step timeout"],
            Self::RetryAfterRateLimit => &["honour the provider's retry-after hint"],
            Self::RetryTransient => &["retry once the provider recovers"],
            Self::ResolveDependency => &[
                "declare the missing dependency in the project manifest",
                "pin a version compatible with the existing lockfile",
                "drop the import if the dependency is not needed",
            ],
            Self::Escalate => &["request human review of the failure"],
        };
        items.iter().map(|item| (*item).to_string()).collect()
    }
}

/// Why the executor stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GaveUpReason {
    NotRetryable { failure_type: FailureType },
    CircuitOpen { failure_type: FailureType },
    BudgetExceeded { dimension: BudgetDimension },
    PatchBackendFailed { detail: String },
}

impl From<GaveUpReason> for RunFailureReason {
    fn from(reason: GaveUpReason) -> Self {
        match reason {
            GaveUpReason::NotRetryable { failure_type } => Self::NotRetryable { failure_type },
            GaveUpReason::CircuitOpen { failure_type } => Self::CircuitOpen { failure_type },
            GaveUpReason::BudgetExceeded { dimension } => Self::BudgetExceeded { dimension },
            GaveUpReason::PatchBackendFailed { detail } => Self::PatchBackendFailed { detail },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoFixOutcome {
    PatchApplied {
        patch: PatchProposal,
        rejected_paths: Vec<String>,
    },
    NoOp {
        detail: String,
    },
    GaveUp {
        reason: GaveUpReason,
    },
    ReplanRequested {
        request: ReplanRequest,
    },
}

impl AutoFixOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::PatchApplied { .. } => "PATCH_APPLIED",
            Self::NoOp { .. } => "NO_OP",
            Self::GaveUp { .. } => "GAVE_UP",
            Self::ReplanRequested { .. } => "REPLAN_REQUESTED",
        }
    }
}

/// One executor decision plus the bookkeeping that came with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFixDecision {
    pub step: StepName,
    pub failure_type: FailureType,
    pub strategy: RepairStrategy,
    pub attempt: u32,
    pub backoff_seconds: u64,
    pub outcome: AutoFixOutcome,
}

/// Combines classification, backoff, breakers and budgets into one repair decision.
pub struct AutoFixExecutor {
    backend: Arc<dyn CodeGenBackend>,
    breakers: Arc<CircuitBreakerRegistry>,
    budgets: Arc<BudgetTracker>,
    metrics: Arc<MetricsRegistry>,
    policy: RetryPolicy,
    patch_timeout: Duration,
}

impl AutoFixExecutor {
    #[must_use]
    pub fn new(
        backend: Arc<dyn CodeGenBackend>,
        breakers: Arc<CircuitBreakerRegistry>,
        budgets: Arc<BudgetTracker>,
        metrics: Arc<MetricsRegistry>,
        policy: RetryPolicy,
        patch_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            breakers,
            budgets,
            metrics,
            policy,
            patch_timeout,
        }
    }

    /// Decide how to react to a failed step.
    ///
    /// The attempt is counted on the run's retry state and budget before any
    /// rule is consulted. Patch backend errors become `GaveUp`; a patch backend
    /// timeout feeds the timeout breaker and yields `NoOp`.
    ///
    /// # Errors
    /// Returns `EngineError::RunNotFound` if the run's budget is not tracked.
    pub async fn attempt(
        &self,
        run: &mut BuildRun,
        step: StepName,
        signal: &FailureSignal,
        failed_cases: &[CaseId],
    ) -> Result<AutoFixDecision> {
        let backoff_seconds = self.policy.next_backoff_seconds(signal, step, &run.retry_state);
        run.retry_state.record_attempt(step);
        run.retry_state.last_backoff_seconds = backoff_seconds;
        run.budget_usage = self.budgets.record_attempt(run.id).await?;
        self.metrics
            .increment(
                names::RETRY_ATTEMPTS_TOTAL,
                &[
                    ("tenant", run.tenant_id.value()),
                    ("failure_type", signal.failure_type.as_str()),
                ],
            )
            .await;

        let strategy = RepairStrategy::for_failure(signal.failure_type);
        let outcome = self.decide(run, signal, strategy, failed_cases).await?;

        let decision = AutoFixDecision {
            step,
            failure_type: signal.failure_type,
            strategy,
            attempt: run.retry_state.attempts_for(step),
            backoff_seconds,
            outcome,
        };
        info!(
            run_id = %run.id,
            tenant_id = run.tenant_id.value(),
            step = step.as_str(),
            failure_type = signal.failure_type.as_str(),
            iteration = run.iteration,
            attempt = decision.attempt,
            backoff_seconds,
            outcome = decision.outcome.label(),
            "auto-fix decision"
        );
        Ok(decision)
    }

    async fn decide(
        &self,
        run: &BuildRun,
        signal: &FailureSignal,
        strategy: RepairStrategy,
        failed_cases: &[CaseId],
    ) -> Result<AutoFixOutcome> {
        let failure_type = signal.failure_type;
        if !signal.can_retry {
            return Ok(AutoFixOutcome::GaveUp {
                reason: GaveUpReason::NotRetryable { failure_type },
            });
        }
        if !self.breakers.admit(&run.tenant_id, failure_type).await {
            return Ok(AutoFixOutcome::GaveUp {
                reason: GaveUpReason::CircuitOpen { failure_type },
            });
        }
        if let Some(dimension) = self.budgets.exceeded(run.id).await? {
            return Ok(AutoFixOutcome::GaveUp {
                reason: GaveUpReason::BudgetExceeded { dimension },
            });
        }
        if signal.requires_replan {
            return Ok(AutoFixOutcome::ReplanRequested {
                request: replan_request(run, signal, strategy, failed_cases),
            });
        }
        if !strategy.uses_patch_backend() {
            return Ok(AutoFixOutcome::NoOp {
                detail: format!("{} needs no code change", strategy.as_str()),
            });
        }
        self.request_patch(run, signal, strategy, failed_cases).await
    }

    async fn request_patch(
        &self,
        run: &BuildRun,
        signal: &FailureSignal,
        strategy: RepairStrategy,
        failed_cases: &[CaseId],
    ) -> Result<AutoFixOutcome> {
        let request = PatchRequest {
            run_id: run.id,
            tenant_id: run.tenant_id.clone(),
            iteration: run.iteration,
            signal: signal.clone(),
            strategy,
            failed_cases: failed_cases.to_vec(),
        };

        match tokio::time::timeout(self.patch_timeout, self.backend.patch(request)).await {
            Err(_elapsed) => {
                warn!(
                    run_id = %run.id,
                    timeout_secs = self.patch_timeout.as_secs(),
                    "patch backend timed out"
                );
                self.breakers
                    .record_run_failure(run, FailureType::Timeout)
                    .await;
                Ok(AutoFixOutcome::NoOp {
                    detail: format!(
                        "patch backend timed out after {}s",
                        self.patch_timeout.as_secs()
                    ),
                })
            }
            Ok(Err(error)) => Ok(AutoFixOutcome::GaveUp {
                reason: GaveUpReason::PatchBackendFailed {
                    detail: truncate_message(&redact_sensitive(&error.to_string()), 500),
                },
            }),
            Ok(Ok(proposal)) => {
                if proposal.cost_usd > 0.0 {
                    self.budgets.record_cost(run.id, proposal.cost_usd).await?;
                }
                Ok(restrict_to_allowed_paths(proposal))
            }
        }
    }
}

fn restrict_to_allowed_paths(proposal: PatchProposal) -> AutoFixOutcome {
    let (allowed, rejected): (Vec<_>, Vec<_>) = proposal
        .patches
        .into_iter()
        .partition(|patch| RetryPolicy::is_path_allowed(&patch.path));
    let rejected_paths: Vec<String> = rejected.into_iter().map(|patch| patch.path).collect();
    if !rejected_paths.is_empty() {
        warn!(paths = ?rejected_paths, "patch touched disallowed paths");
    }

    if allowed.is_empty() {
        return AutoFixOutcome::NoOp {
            detail: if rejected_paths.is_empty() {
                "patch backend proposed no changes".to_string()
            } else {
                format!("every proposed path was disallowed: {}", rejected_paths.join(", "))
            },
        };
    }
    AutoFixOutcome::PatchApplied {
        patch: PatchProposal {
            patches: allowed,
            rationale: proposal.rationale,
            cost_usd: proposal.cost_usd,
        },
        rejected_paths,
    }
}

pub(crate) fn replan_request(
    run: &BuildRun,
    signal: &FailureSignal,
    strategy: RepairStrategy,
    failed_cases: &[CaseId],
) -> ReplanRequest {
    let message = truncate_message(&redact_sensitive(&signal.message), 300);
    let mut recommendations = strategy.recommendations();
    if !failed_cases.is_empty() {
        recommendations.push(format!(
            "re-check cases: {}",
            failed_cases
                .iter()
                .map(CaseId::value)
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    ReplanRequest {
        run_id: run.id,
        tenant_id: run.tenant_id.clone(),
        iteration: run.iteration,
        delta_goal: format!("{}\n\nResolve before continuing: {message}", run.goal_text),
        root_cause_summary: format!(
            "{} failure reported by {}: {message}",
            signal.failure_type, signal.source
        ),
        recommendations,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ports::{FilePatch, GenerateRequest, GeneratedChange, Plan, PlanRequest, PortFuture};
    use crate::types::{BudgetLimits, CircuitConfig, PlanId, SpecId, SubmitBuild, TenantId};
    use crate::EngineError;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    enum PatchReply {
        Proposal(PatchProposal),
        Error(String),
        Hang,
    }

    #[derive(Clone)]
    struct FakeBackend {
        reply: PatchReply,
        patch_calls: Arc<Mutex<Vec<PatchRequest>>>,
    }

    impl FakeBackend {
        fn new(reply: PatchReply) -> Self {
            Self {
                reply,
                patch_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl CodeGenBackend for FakeBackend {
        fn plan(&self, _request: PlanRequest) -> PortFuture<'_, Plan> {
            Box::pin(async { Ok(Plan::default()) })
        }

        fn generate(&self, _request: GenerateRequest) -> PortFuture<'_, GeneratedChange> {
            Box::pin(async { Ok(GeneratedChange::default()) })
        }

        fn patch(&self, request: PatchRequest) -> PortFuture<'_, PatchProposal> {
            Box::pin(async move {
                self.patch_calls.lock().await.push(request);
                match self.reply.clone() {
                    PatchReply::Proposal(proposal) => Ok(proposal),
                    PatchReply::Error(detail) => Err(EngineError::BackendError(detail)),
                    PatchReply::Hang => {
                        tokio::time::sleep(Duration::from_secs(3_600)).await;
                        Ok(PatchProposal::default())
                    }
                }
            })
        }
    }

    struct Harness {
        executor: AutoFixExecutor,
        backend: FakeBackend,
        breakers: Arc<CircuitBreakerRegistry>,
        budgets: Arc<BudgetTracker>,
        run: BuildRun,
    }

    async fn harness(reply: PatchReply, limits: BudgetLimits, threshold: u32) -> Harness {
        let metrics = Arc::new(MetricsRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitConfig::new(threshold, 300, 300),
            Arc::clone(&metrics),
        ));
        let budgets = Arc::new(BudgetTracker::new());
        let backend = FakeBackend::new(reply);
        let run = BuildRun::new(
            &SubmitBuild {
                tenant_id: TenantId::new("acme"),
                spec_id: SpecId::new("spec"),
                plan_id: PlanId::new("plan"),
                goal_text: "add a deals board".to_string(),
                max_iterations: 5,
                budgets: Some(limits),
                circuit_failure_threshold: None,
            },
            limits,
            "v1",
        );
        budgets
            .register(run.id, limits, run.budget_usage, Utc::now())
            .await;
        let executor = AutoFixExecutor::new(
            Arc::new(backend.clone()),
            Arc::clone(&breakers),
            Arc::clone(&budgets),
            metrics,
            RetryPolicy::default(),
            Duration::from_millis(50),
        );
        Harness {
            executor,
            backend,
            breakers,
            budgets,
            run,
        }
    }

    fn proposal(paths: &[&str]) -> PatchProposal {
        PatchProposal {
            patches: paths
                .iter()
                .map(|path| FilePatch {
                    path: (*path).to_string(),
                    diff: format!("--- a/{path}\n+++ b/{path}\n"),
                })
                .collect(),
            rationale: "fix".to_string(),
            cost_usd: 0.1,
        }
    }

    fn assertion_failure() -> FailureSignal {
        FailureSignal::new(FailureType::TestAssert, "evaluate", "1 case failed")
    }

    #[tokio::test]
    async fn given_unretryable_signal_then_gives_up_but_counts_attempt() {
        let mut h = harness(PatchReply::Proposal(proposal(&["src/a.rs"])), BudgetLimits::default(), 5).await;
        let signal = FailureSignal::unknown("evaluate", "segfault");

        let decision = h.executor.attempt(&mut h.run, StepName::Evaluate, &signal, &[]).await.unwrap();

        assert_eq!(
            decision.outcome,
            AutoFixOutcome::GaveUp {
                reason: GaveUpReason::NotRetryable {
                    failure_type: FailureType::Unknown
                }
            }
        );
        assert_eq!(h.run.retry_state.attempts_for(StepName::Evaluate), 1);
        assert_eq!(h.run.retry_state.total_attempts, 1);
        assert!(h.backend.patch_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn given_open_breaker_then_gives_up_without_patching() {
        let mut h = harness(PatchReply::Proposal(proposal(&["src/a.rs"])), BudgetLimits::default(), 1).await;
        h.breakers
            .record_failure(&h.run.tenant_id, FailureType::TestAssert)
            .await;

        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();

        assert_eq!(decision.outcome.label(), "GAVE_UP");
        assert!(matches!(
            decision.outcome,
            AutoFixOutcome::GaveUp {
                reason: GaveUpReason::CircuitOpen { .. }
            }
        ));
        assert!(h.backend.patch_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn given_exhausted_attempt_budget_then_gives_up() {
        let mut h = harness(
            PatchReply::Proposal(proposal(&["src/a.rs"])),
            BudgetLimits::new(1, 600, 5.0),
            5,
        )
        .await;
        let first = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();
        assert_eq!(first.outcome.label(), "PATCH_APPLIED");

        let second = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();
        assert_eq!(
            second.outcome,
            AutoFixOutcome::GaveUp {
                reason: GaveUpReason::BudgetExceeded {
                    dimension: BudgetDimension::Attempts
                }
            }
        );
        assert_eq!(h.budgets.usage(h.run.id).await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn given_dependency_failure_then_replan_is_requested() {
        let mut h = harness(PatchReply::Proposal(proposal(&["src/a.rs"])), BudgetLimits::default(), 5).await;
        let signal = FailureSignal::new(FailureType::Dependency, "codegen", "No module named 'stripe'");

        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Codegen, &signal, &[CaseId::new("billing")])
            .await
            .unwrap();

        let AutoFixOutcome::ReplanRequested { request } = decision.outcome else {
            panic!("expected a re-plan request");
        };
        assert!(request.root_cause_summary.contains("dependency"));
        assert!(request.delta_goal.starts_with("add a deals board"));
        assert!(request.recommendations.iter().any(|r| r.contains("billing")));
        assert!(h.backend.patch_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn given_patch_with_denied_paths_then_only_allowed_files_survive() {
        let mut h = harness(
            PatchReply::Proposal(proposal(&["src/deals.rs", ".env", "node_modules/x/index.js"])),
            BudgetLimits::default(),
            5,
        )
        .await;

        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();

        let AutoFixOutcome::PatchApplied { patch, rejected_paths } = decision.outcome else {
            panic!("expected an applied patch");
        };
        assert_eq!(patch.patches.len(), 1);
        assert_eq!(patch.patches[0].path, "src/deals.rs");
        assert_eq!(rejected_paths, vec![".env", "node_modules/x/index.js"]);
        assert!((h.budgets.usage(h.run.id).await.unwrap().cost_usd - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn given_only_denied_paths_then_outcome_is_noop() {
        let mut h = harness(PatchReply::Proposal(proposal(&[".git/config"])), BudgetLimits::default(), 5).await;
        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();
        assert_eq!(decision.outcome.label(), "NO_OP");
        assert_eq!(h.run.retry_state.total_attempts, 1);
    }

    #[tokio::test]
    async fn given_patch_backend_error_then_gives_up_instead_of_propagating() {
        let mut h = harness(
            PatchReply::Error("model crashed api_key=sk-123".to_string()),
            BudgetLimits::default(),
            5,
        )
        .await;
        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();
        let AutoFixOutcome::GaveUp {
            reason: GaveUpReason::PatchBackendFailed { detail },
        } = decision.outcome
        else {
            panic!("expected patch backend failure");
        };
        assert!(detail.contains("model crashed"));
        assert!(!detail.contains("sk-123"));
    }

    #[tokio::test]
    async fn given_hanging_patch_backend_then_timeout_becomes_noop() {
        let mut h = harness(PatchReply::Hang, BudgetLimits::default(), 5).await;
        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Evaluate, &assertion_failure(), &[])
            .await
            .unwrap();
        assert_eq!(decision.outcome.label(), "NO_OP");
        assert_eq!(h.breakers.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_skip_the_patch_backend_and_report_backoff() {
        let mut h = harness(PatchReply::Proposal(proposal(&["src/a.rs"])), BudgetLimits::default(), 5).await;
        let signal = FailureSignal::new(FailureType::Transient, "codegen", "connection reset");
        h.run.retry_state.record_attempt(StepName::Codegen);
        h.run.retry_state.record_attempt(StepName::Codegen);

        let decision = h
            .executor
            .attempt(&mut h.run, StepName::Codegen, &signal, &[])
            .await
            .unwrap();

        assert_eq!(decision.backoff_seconds, 8);
        assert_eq!(decision.attempt, 3);
        assert_eq!(decision.outcome.label(), "NO_OP");
        assert!(h.backend.patch_calls.lock().await.is_empty());
    }

    #[test]
    fn every_failure_class_has_a_strategy() {
        for failure_type in FailureType::ALL {
            let strategy = RepairStrategy::for_failure(failure_type);
            assert!(!strategy.recommendations().is_empty(), "{failure_type}");
        }
        assert!(!RepairStrategy::for_failure(FailureType::Unknown).uses_patch_backend());
    }
}
