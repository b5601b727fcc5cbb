#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::autofix::{replan_request, AutoFixExecutor, AutoFixOutcome, GaveUpReason};
use crate::breaker::CircuitBreakerRegistry;
use crate::budget_tracker::BudgetTracker;
use crate::canary::{CanaryComparator, CanarySample};
use crate::classifier::FailureClassifier;
use crate::config::EngineConfig;
use crate::diagnostics::{redact_sensitive, truncate_message};
use crate::error::{EngineError, Result};
use crate::evaluation::{build_report, CaseOutcome, EvaluationEngine, GatedOutcome};
use crate::metrics::{names, MetricsRegistry};
use crate::ports::{
    CaseExecution, CaseRequest, CodeGenBackend, EvalHarness, GenerateRequest, PatchProposal, Plan,
    PlanRequest, PortFuture,
};
use crate::quarantine::QuarantineManager;
use crate::retry_policy::RetryPolicy;
use crate::risk;
use crate::store::RunStore;
use crate::types::{
    ApprovalGate, BudgetDimension, BuildRun, BuildStep, CaseId, CaseKey, CaseRunRecord, EvalCase,
    EvalReport, EvalSuite, FailureSignal, FailureType, QuarantineGating, ReplanRequest,
    ReviewerId, RunEventKind, RunFailureReason, RunId, RunStatus, RunStatusView, SpecId, StepCompletion,
    StepName, StepStatus, SubmitBuild, SuiteId,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_ERROR_CHARS: usize = 500;

/// External collaborators the engine drives.
pub struct EnginePorts {
    pub store: Arc<dyn RunStore>,
    pub backend: Arc<dyn CodeGenBackend>,
    pub harness: Arc<dyn EvalHarness>,
}

struct PendingRepair {
    step: StepName,
    signal: FailureSignal,
    failed_cases: Vec<CaseId>,
}

/// State carried between steps of one `drive` call. Not persisted: a resumed
/// run re-plans and regenerates from its stored status.
#[derive(Default)]
struct DriveContext {
    plan: Option<Plan>,
    replan: Option<ReplanRequest>,
    patch: Option<PatchProposal>,
    pending: Option<PendingRepair>,
    last_failure: Option<FailureType>,
    first_failure_at: Option<DateTime<Utc>>,
}

impl DriveContext {
    fn note_failure(&mut self, step: StepName, signal: FailureSignal, failed_cases: Vec<CaseId>) {
        self.last_failure = Some(signal.failure_type);
        self.first_failure_at.get_or_insert_with(Utc::now);
        self.pending = Some(PendingRepair {
            step,
            signal,
            failed_cases,
        });
    }
}

/// Drives build runs through plan, generate, evaluate and repair.
///
/// Steps within a run are strictly sequential; different runs may be driven
/// concurrently from separate workers. Every status change is persisted and
/// appended to the run's event log before the next step starts.
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    backend: Arc<dyn CodeGenBackend>,
    harness: Arc<dyn EvalHarness>,
    classifier: FailureClassifier,
    executor: AutoFixExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
    budgets: Arc<BudgetTracker>,
    quarantine: Arc<QuarantineManager>,
    canary: Arc<CanaryComparator>,
    metrics: Arc<MetricsRegistry>,
    suites: RwLock<HashMap<SpecId, EvalSuite>>,
    config: EngineConfig,
    step_timeout: Duration,
    active: Mutex<HashSet<RunId>>,
    // Serialises approval, cancellation and rollback.
    admin: Mutex<()>,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(config: EngineConfig, ports: EnginePorts) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::from_config(
            &config,
            Arc::clone(&metrics),
        ));
        let budgets = Arc::new(BudgetTracker::new());
        let quarantine = Arc::new(QuarantineManager::new(
            Arc::clone(&ports.store),
            config.quarantine,
        ));
        let canary = Arc::new(CanaryComparator::new(
            config.canary.clone(),
            Arc::clone(&metrics),
        ));
        let step_timeout = Duration::from_secs(config.worker.step_timeout_secs.max(1));
        let executor = AutoFixExecutor::new(
            Arc::clone(&ports.backend),
            Arc::clone(&breakers),
            Arc::clone(&budgets),
            Arc::clone(&metrics),
            RetryPolicy::new(config.retry),
            step_timeout,
        );

        Self {
            store: ports.store,
            backend: ports.backend,
            harness: ports.harness,
            classifier: FailureClassifier::standard(),
            executor,
            breakers,
            budgets,
            quarantine,
            canary,
            metrics,
            suites: RwLock::new(HashMap::new()),
            config,
            step_timeout,
            active: Mutex::new(HashSet::new()),
            admin: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub const fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub const fn budgets(&self) -> &Arc<BudgetTracker> {
        &self.budgets
    }

    #[must_use]
    pub const fn quarantine(&self) -> &Arc<QuarantineManager> {
        &self.quarantine
    }

    #[must_use]
    pub const fn canary(&self) -> &Arc<CanaryComparator> {
        &self.canary
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluation suite used for every run of `spec_id`.
    pub async fn register_suite(&self, spec_id: SpecId, suite: EvalSuite) {
        info!(
            spec_id = spec_id.value(),
            suite_id = suite.suite_id.value(),
            cases = suite.cases.len(),
            "evaluation suite registered"
        );
        self.suites.write().await.insert(spec_id, suite);
    }

    async fn suite_for(&self, spec_id: &SpecId) -> Result<EvalSuite> {
        self.suites
            .read()
            .await
            .get(spec_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::ConfigError(format!("no evaluation suite registered for spec {spec_id}"))
            })
    }

    /// Validate and persist a new run in `pending`. Budget limits come from the
    /// request, then the tenant's overrides, then the system defaults.
    ///
    /// # Errors
    /// Returns `EngineError::ConfigError` for an invalid request or unknown spec.
    pub async fn submit(&self, request: SubmitBuild) -> Result<BuildRun> {
        if request.max_iterations == 0 {
            return Err(EngineError::ConfigError(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if request.goal_text.trim().is_empty() {
            return Err(EngineError::ConfigError("goal_text must not be empty".to_string()));
        }
        if request.circuit_failure_threshold == Some(0) {
            return Err(EngineError::ConfigError(
                "circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        self.suite_for(&request.spec_id).await?;

        let limits = request
            .budgets
            .unwrap_or_else(|| self.config.budget_for(&request.tenant_id));
        let version = self.canary.assign(&request.tenant_id);
        let run = BuildRun::new(&request, limits, version);

        self.store.insert_run(run.clone()).await?;
        self.store
            .append_event(
                run.id,
                RunEventKind::Submitted,
                json!({
                    "tenant_id": run.tenant_id,
                    "spec_id": run.spec_id,
                    "plan_id": run.plan_id,
                    "max_iterations": run.max_iterations,
                    "budget_limits": run.budget_limits,
                    "pipeline_version": run.pipeline_version,
                }),
            )
            .await?;
        info!(
            run_id = %run.id,
            tenant_id = run.tenant_id.value(),
            spec_id = run.spec_id.value(),
            max_iterations = run.max_iterations,
            pipeline_version = run.pipeline_version.as_str(),
            "build run submitted"
        );
        Ok(run)
    }

    /// Ids of persisted runs that still need a worker.
    ///
    /// # Errors
    /// Returns a store error if the listing fails.
    pub async fn recover_incomplete_runs(&self) -> Result<Vec<RunId>> {
        let runs = self.store.list_incomplete().await?;
        if !runs.is_empty() {
            info!(count = runs.len(), "recovering incomplete runs");
        }
        Ok(runs.into_iter().map(|run| run.id).collect())
    }

    /// # Errors
    /// Returns `EngineError::RunNotFound` for an unknown run.
    pub async fn status_view(&self, run_id: RunId) -> Result<RunStatusView> {
        let run = self.store.get_run(run_id).await?;
        let last_step_outputs = self.store.latest_step_outputs(run_id).await?;
        let budgets_consumed = self
            .budgets
            .usage(run_id)
            .await
            .unwrap_or(run.budget_usage);
        Ok(RunStatusView {
            run_id,
            status: run.status,
            iteration: run.iteration,
            max_iterations: run.max_iterations,
            last_step_outputs,
            budgets_consumed,
            budget_limits: run.budget_limits,
            failure_code: run
                .failure_reason
                .as_ref()
                .map(|reason| reason.code().to_string()),
            failure_reason: run.failure_reason,
        })
    }

    /// Run the state machine until the run is terminal or waits for approval.
    /// A run already being driven elsewhere in this process is left alone.
    ///
    /// # Errors
    /// Store failures, and `EngineError::UnknownAssertion` after failing the run
    /// for a malformed evaluation suite.
    pub async fn drive(&self, run_id: RunId) -> Result<RunStatus> {
        if !self.active.lock().await.insert(run_id) {
            debug!(run_id = %run_id, "run already being driven");
            return self.store.get_run(run_id).await.map(|run| run.status);
        }
        let result = self.drive_claimed(run_id).await;
        self.active.lock().await.remove(&run_id);
        result
    }

    async fn drive_claimed(&self, run_id: RunId) -> Result<RunStatus> {
        let mut run = self.store.get_run(run_id).await?;
        if !run.status.needs_worker() {
            return Ok(run.status);
        }
        self.budgets
            .register(
                run.id,
                run.budget_limits,
                run.budget_usage,
                run.started_at.unwrap_or_else(Utc::now),
            )
            .await;

        let mut ctx = DriveContext::default();
        while run.status.needs_worker() {
            run = match run.status {
                RunStatus::Pending => self.start(run).await?,
                RunStatus::Planning => self.plan(run, &mut ctx).await?,
                RunStatus::Generating => self.generate(run, &mut ctx).await?,
                RunStatus::Evaluating => self.evaluate(run, &mut ctx).await?,
                RunStatus::Repairing => self.repair(run, &mut ctx).await?,
                RunStatus::AwaitingApproval
                | RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::RolledBack => break,
            };
        }

        if run.status.is_terminal() {
            self.record_finished(&run, ctx.first_failure_at).await;
        }
        Ok(run.status)
    }

    async fn start(&self, run: BuildRun) -> Result<BuildRun> {
        if self.cancel_requested(&run).await? {
            return self.fail_run(run, RunFailureReason::Cancelled).await;
        }
        self.advance(run, RunStatus::Planning).await
    }

    async fn plan(&self, run: BuildRun, ctx: &mut DriveContext) -> Result<BuildRun> {
        let next = if self.request_plan(&run, ctx).await? {
            RunStatus::Generating
        } else {
            RunStatus::Repairing
        };
        self.advance(run, next).await
    }

    /// Returns `false` when planning failed; the failure is left pending for repair.
    async fn request_plan(&self, run: &BuildRun, ctx: &mut DriveContext) -> Result<bool> {
        let replan = ctx.replan.take();
        let goal_text = replan
            .as_ref()
            .map_or_else(|| run.goal_text.clone(), |request| request.delta_goal.clone());
        let request = PlanRequest {
            run_id: run.id,
            tenant_id: run.tenant_id.clone(),
            goal_text,
            iteration: run.iteration,
            replan,
        };
        let step = BuildStep::start(
            run.id,
            run.iteration,
            StepName::Plan,
            json!({"replan": request.replan.is_some()}),
        );

        match self.timed(run, StepName::Plan, self.backend.plan(request)).await {
            Ok(plan) => {
                self.budgets.record_cost(run.id, plan.cost_usd).await?;
                self.finish_step(step.succeed(serde_json::to_value(&plan)?))
                    .await?;
                ctx.plan = Some(plan);
                Ok(true)
            }
            Err(error) => {
                self.step_failed(run, ctx, step, &error).await?;
                Ok(false)
            }
        }
    }

    async fn generate(&self, run: BuildRun, ctx: &mut DriveContext) -> Result<BuildRun> {
        let run = match self.check_iteration_limits(run).await? {
            ControlFlow::Break(stopped) => return Ok(stopped),
            ControlFlow::Continue(run) => run,
        };
        if self.store.get_diff(run.id, run.iteration).await?.is_some() {
            debug!(run_id = %run.id, iteration = run.iteration, "diff already recorded; resuming at evaluation");
            return self.advance(run, RunStatus::Evaluating).await;
        }
        if ctx.plan.is_none() && !self.request_plan(&run, ctx).await? {
            return self.advance(run, RunStatus::Repairing).await;
        }

        let request = GenerateRequest {
            run_id: run.id,
            tenant_id: run.tenant_id.clone(),
            iteration: run.iteration,
            goal_text: run.goal_text.clone(),
            plan: ctx.plan.clone().unwrap_or_default(),
            patch: ctx.patch.take(),
        };
        let step = BuildStep::start(
            run.id,
            run.iteration,
            StepName::Codegen,
            json!({"patched": request.patch.is_some()}),
        );

        match self
            .timed(&run, StepName::Codegen, self.backend.generate(request))
            .await
        {
            Ok(change) => {
                self.budgets.record_cost(run.id, change.cost_usd).await?;
                let diff = risk::diff_artifact(run.id, run.iteration, &change);
                self.store.insert_diff(diff.clone()).await?;
                self.finish_step(step.succeed(json!({
                    "files_changed": diff.files_changed,
                    "risk_score": diff.risk_score,
                    "content_hash": diff.content_hash,
                })))
                .await?;
                self.advance(run, RunStatus::Evaluating).await
            }
            Err(error) => {
                self.step_failed(&run, ctx, step, &error).await?;
                self.advance(run, RunStatus::Repairing).await
            }
        }
    }

    /// Checks made before an iteration starts: cancellation, budgets, and the
    /// iteration ceiling.
    async fn check_iteration_limits(
        &self,
        run: BuildRun,
    ) -> Result<ControlFlow<BuildRun, BuildRun>> {
        if self.cancel_requested(&run).await? {
            info!(run_id = %run.id, iteration = run.iteration, "cancel requested; iteration not started");
            return self
                .fail_run(run, RunFailureReason::Cancelled)
                .await
                .map(ControlFlow::Break);
        }
        if let Some(dimension) = self.budgets.exceeded(run.id).await? {
            return self
                .budget_exceeded(run, dimension)
                .await
                .map(ControlFlow::Break);
        }
        if !run.has_iterations_left() {
            return self
                .fail_run(run, RunFailureReason::MaxIterationsReached)
                .await
                .map(ControlFlow::Break);
        }
        Ok(ControlFlow::Continue(run))
    }

    async fn evaluate(&self, mut run: BuildRun, ctx: &mut DriveContext) -> Result<BuildRun> {
        let (report, logs) = match self.store.get_report(run.id, run.iteration).await? {
            Some(report) => {
                let logs = report
                    .failed_cases
                    .iter()
                    .map(|case_id| format!("AssertionError: case {case_id} failed"))
                    .collect();
                (report, logs)
            }
            None => match self.run_suite(&run).await {
                Ok(evaluated) => evaluated,
                Err(error @ EngineError::UnknownAssertion(_)) => {
                    let detail = error.to_string();
                    let failed = self
                        .fail_run(run, RunFailureReason::InvalidEvaluation { detail })
                        .await?;
                    self.record_finished(&failed, ctx.first_failure_at).await;
                    return Err(error);
                }
                Err(error) => return Err(error),
            },
        };

        run.complete_iteration()?;
        if report.pass_rate >= self.config.evaluation.pass_threshold {
            self.iteration_passed(run, ctx, &report).await
        } else {
            self.iteration_failed(run, ctx, &report, logs).await
        }
    }

    async fn run_suite(&self, run: &BuildRun) -> Result<(EvalReport, Vec<String>)> {
        let suite = self.suite_for(&run.spec_id).await?;
        let step = BuildStep::start(
            run.id,
            run.iteration,
            StepName::Evaluate,
            json!({"suite_id": suite.suite_id, "cases": suite.cases.len()}),
        );
        let gating = self.quarantine.gating();
        let mut outcomes = Vec::with_capacity(suite.cases.len());
        let mut logs = Vec::new();

        for case in &suite.cases {
            let key = CaseKey::new(
                run.tenant_id.clone(),
                suite.suite_id.clone(),
                case.case_id.clone(),
            );
            let quarantined = self.quarantine.is_quarantined(&key).await?;
            if quarantined && gating == QuarantineGating::Skip {
                debug!(run_id = %run.id, case_id = case.case_id.value(), "skipping quarantined case");
                continue;
            }

            let execution = self.execute_case(run, &suite.suite_id, case).await;
            self.budgets.record_cost(run.id, execution.cost_usd).await?;
            let outcome = case_evaluator(case, execution.latency_ms)
                .evaluate_case(case, &execution.payload)?;
            let passed = execution.error.is_none() && !outcome.has_failures();
            self.store
                .record_case_run(
                    key,
                    CaseRunRecord::new(passed, execution.latency_ms, execution.error.clone()),
                )
                .await?;

            if !quarantined {
                logs.extend(failure_lines(&outcome));
                if let Some(error) = &execution.error {
                    logs.push(format!("case {}: {error}", case.case_id));
                }
            }
            outcomes.push(GatedOutcome {
                outcome,
                quarantined,
            });
        }

        let report = build_report(run.id, run.iteration, &outcomes);
        self.store.insert_report(report.clone()).await?;
        self.finish_step(step.succeed(json!({
            "pass_rate": report.pass_rate,
            "failed_cases": report.failed_cases,
            "required_failed": report.required_failed,
            "all_required_passed": report.all_required_passed,
        })))
        .await?;
        info!(
            run_id = %run.id,
            iteration = run.iteration,
            pass_rate = report.pass_rate,
            required_failed = report.required_failed,
            "iteration evaluated"
        );
        Ok((report, logs))
    }

    async fn execute_case(&self, run: &BuildRun, suite_id: &SuiteId, case: &EvalCase) -> CaseExecution {
        let request = CaseRequest {
            run_id: run.id,
            tenant_id: run.tenant_id.clone(),
            suite_id: suite_id.clone(),
            iteration: run.iteration,
            case: case.clone(),
        };
        let started = Instant::now();
        match self
            .timed(run, StepName::Evaluate, self.harness.run_case(request))
            .await
        {
            Ok(execution) => execution,
            Err(error) => CaseExecution {
                payload: Value::Null,
                latency_ms: elapsed_ms(started),
                error: Some(truncate_message(
                    &redact_sensitive(&error.to_string()),
                    MAX_ERROR_CHARS,
                )),
                cost_usd: 0.0,
            },
        }
    }

    async fn iteration_passed(
        &self,
        run: BuildRun,
        ctx: &mut DriveContext,
        report: &EvalReport,
    ) -> Result<BuildRun> {
        if let Some(failure_type) = ctx.last_failure.take() {
            self.breakers.record_success(&run.tenant_id, failure_type).await;
        }

        let gate = match self.store.get_gate(run.id, report.iteration).await? {
            Some(gate) => gate,
            None => {
                let risk_score = self
                    .store
                    .get_diff(run.id, report.iteration)
                    .await?
                    .map_or(0.0, |diff| diff.risk_score);
                let required = risk_score >= self.config.evaluation.approval_risk_threshold;
                let gate = ApprovalGate::new(run.id, report.iteration, required);
                self.store.insert_gate(gate.clone()).await?;
                gate
            }
        };

        if gate.blocks_progress() {
            info!(run_id = %run.id, iteration = report.iteration, "approval required before completion");
            self.advance(run, RunStatus::AwaitingApproval).await
        } else {
            self.advance(run, RunStatus::Completed).await
        }
    }

    async fn iteration_failed(
        &self,
        run: BuildRun,
        ctx: &mut DriveContext,
        report: &EvalReport,
        logs: Vec<String>,
    ) -> Result<BuildRun> {
        let completion = StepCompletion {
            run_id: run.id,
            step_name: StepName::Evaluate,
            status: StepStatus::Failed,
            output: json!({"pass_rate": report.pass_rate}),
            logs,
            artifacts: BTreeMap::from([
                ("source".to_string(), json!(StepName::Evaluate.as_str())),
                ("failed_cases".to_string(), json!(report.failed_cases)),
            ]),
        };
        let signal = self.classifier.classify_completion(&completion);
        self.breakers
            .record_run_failure(&run, signal.failure_type)
            .await;
        warn!(
            run_id = %run.id,
            tenant_id = run.tenant_id.value(),
            step = StepName::Evaluate.as_str(),
            failure_type = signal.failure_type.as_str(),
            iteration = report.iteration,
            pass_rate = report.pass_rate,
            "evaluation below threshold"
        );
        ctx.note_failure(StepName::Evaluate, signal, report.failed_cases.clone());

        if !run.has_iterations_left() {
            return self
                .fail_run(run, RunFailureReason::MaxIterationsReached)
                .await;
        }
        if let Some(dimension) = self.budgets.exceeded(run.id).await? {
            return self.budget_exceeded(run, dimension).await;
        }
        self.advance(run, RunStatus::Repairing).await
    }

    async fn repair(&self, mut run: BuildRun, ctx: &mut DriveContext) -> Result<BuildRun> {
        let Some(pending) = ctx.pending.take() else {
            debug!(run_id = %run.id, "no pending failure after resume; regenerating");
            return self.advance(run, RunStatus::Generating).await;
        };
        let step = BuildStep::start(
            run.id,
            run.iteration,
            StepName::Repair,
            json!({
                "failed_step": pending.step,
                "failure_type": pending.signal.failure_type,
                "failed_cases": pending.failed_cases,
            }),
        );

        let decision = self
            .executor
            .attempt(&mut run, pending.step, &pending.signal, &pending.failed_cases)
            .await?;
        let payload = serde_json::to_value(&decision)?;
        self.store
            .append_event(run.id, RunEventKind::AutoFixDecision, payload.clone())
            .await?;
        self.finish_step(step.succeed(payload)).await?;

        match decision.outcome {
            AutoFixOutcome::PatchApplied { patch, .. } => {
                ctx.patch = Some(patch);
                self.advance(run, RunStatus::Generating).await
            }
            AutoFixOutcome::NoOp { .. } => {
                if !decision.strategy.uses_patch_backend() && decision.backoff_seconds > 0 {
                    debug!(run_id = %run.id, backoff_seconds = decision.backoff_seconds, "backing off before retry");
                    tokio::time::sleep(Duration::from_secs(decision.backoff_seconds)).await;
                }
                let next = if pending.step == StepName::Plan {
                    RunStatus::Planning
                } else {
                    RunStatus::Generating
                };
                self.advance(run, next).await
            }
            AutoFixOutcome::ReplanRequested { request } => {
                self.store.insert_replan(request.clone()).await?;
                self.metrics
                    .increment(names::REPLANS_TOTAL, &[("tenant", run.tenant_id.value())])
                    .await;
                self.store
                    .append_event(
                        run.id,
                        RunEventKind::ReplanRequested,
                        serde_json::to_value(&request)?,
                    )
                    .await?;
                ctx.plan = None;
                ctx.patch = None;
                ctx.replan = Some(request);
                self.advance(run, RunStatus::Planning).await
            }
            AutoFixOutcome::GaveUp { reason } => match reason {
                GaveUpReason::BudgetExceeded { dimension } => {
                    self.budget_exceeded(run, dimension).await
                }
                GaveUpReason::NotRetryable { failure_type } => {
                    let request = replan_request(
                        &run,
                        &pending.signal,
                        decision.strategy,
                        &pending.failed_cases,
                    );
                    self.store.insert_replan(request.clone()).await?;
                    self.store
                        .append_event(
                            run.id,
                            RunEventKind::ReplanRequested,
                            json!({"escalation": "not_retryable", "request": request}),
                        )
                        .await?;
                    warn!(run_id = %run.id, %failure_type, "unretryable failure escalated for re-plan");
                    self.fail_run(run, RunFailureReason::NotRetryable { failure_type })
                        .await
                }
                other => self.fail_run(run, other.into()).await,
            },
        }
    }

    /// Resolve the approval gate of `iteration`. Approval completes the run,
    /// rejection fails it. A cancel requested meanwhile wins over approval.
    ///
    /// # Errors
    /// Returns `EngineError::ApprovalError` if the run is not awaiting approval
    /// or the gate is missing or already resolved.
    pub async fn resolve_approval(
        &self,
        run_id: RunId,
        iteration: u32,
        reviewer: ReviewerId,
        approved: bool,
    ) -> Result<BuildRun> {
        let _admin = self.admin.lock().await;
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(EngineError::ApprovalError(format!(
                "run {run_id} is {} and not awaiting approval",
                run.status
            )));
        }
        let mut gate = self
            .store
            .get_gate(run_id, iteration)
            .await?
            .ok_or_else(|| {
                EngineError::ApprovalError(format!(
                    "no approval gate for run {run_id} iteration {iteration}"
                ))
            })?;
        gate.resolve(approved, reviewer.clone())?;
        self.store.update_gate(gate).await?;
        self.store
            .append_event(
                run_id,
                RunEventKind::ApprovalResolved,
                json!({"iteration": iteration, "approved": approved, "reviewer_id": reviewer}),
            )
            .await?;
        info!(run_id = %run_id, iteration, approved, reviewer_id = reviewer.value(), "approval resolved");

        let run = if run.cancel_requested {
            self.fail_run(run, RunFailureReason::Cancelled).await?
        } else if approved {
            self.advance(run, RunStatus::Completed).await?
        } else {
            self.fail_run(run, RunFailureReason::ApprovalRejected).await?
        };
        self.record_finished(&run, None).await;
        Ok(run)
    }

    /// Request cancellation. Runs waiting for approval fail immediately;
    /// running ones stop before their next iteration.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidTransition` for a run that already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<BuildRun> {
        let _admin = self.admin.lock().await;
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::invalid_transition(run.status, "cancelled"));
        }
        let run = self.store.request_cancel(run_id).await?;
        self.store
            .append_event(run_id, RunEventKind::CancelRequested, json!({"status": run.status}))
            .await?;
        info!(run_id = %run_id, status = run.status.as_str(), "cancel requested");

        if run.status == RunStatus::AwaitingApproval {
            let run = self.fail_run(run, RunFailureReason::Cancelled).await?;
            self.record_finished(&run, None).await;
            return Ok(run);
        }
        Ok(run)
    }

    /// Fail a `pending` run that no worker will pick up.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidTransition` if the run already left `pending`.
    pub async fn abandon_unscheduled(&self, run: BuildRun, detail: String) -> Result<BuildRun> {
        let _admin = self.admin.lock().await;
        warn!(run_id = %run.id, tenant_id = run.tenant_id.value(), detail = detail.as_str(), "run could not be scheduled");
        self.fail_run(run, RunFailureReason::NotScheduled { detail })
            .await
    }

    /// Manual rollback of a completed run.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidTransition` unless the run is `completed`.
    pub async fn rollback(&self, run_id: RunId) -> Result<BuildRun> {
        let _admin = self.admin.lock().await;
        let run = self.store.get_run(run_id).await?;
        let tenant_id = run.tenant_id.clone();
        let run = self.advance(run, RunStatus::RolledBack).await?;
        self.store
            .append_event(run_id, RunEventKind::RolledBack, json!({"iteration": run.iteration}))
            .await?;
        self.metrics
            .increment(names::ROLLBACKS_TOTAL, &[("tenant", tenant_id.value())])
            .await;
        Ok(run)
    }

    async fn cancel_requested(&self, run: &BuildRun) -> Result<bool> {
        if run.cancel_requested {
            return Ok(true);
        }
        Ok(self.store.get_run(run.id).await?.cancel_requested)
    }

    async fn budget_exceeded(&self, run: BuildRun, dimension: BudgetDimension) -> Result<BuildRun> {
        let usage = self.budgets.usage(run.id).await.unwrap_or(run.budget_usage);
        self.metrics
            .increment(
                names::BUDGET_EXCEEDED_TOTAL,
                &[
                    ("tenant", run.tenant_id.value()),
                    ("dimension", dimension.as_str()),
                ],
            )
            .await;
        self.store
            .append_event(
                run.id,
                RunEventKind::BudgetExceeded,
                json!({"dimension": dimension, "usage": usage, "limits": run.budget_limits}),
            )
            .await?;
        warn!(
            run_id = %run.id,
            tenant_id = run.tenant_id.value(),
            dimension = dimension.as_str(),
            iteration = run.iteration,
            "budget exceeded"
        );
        self.fail_run(run, RunFailureReason::BudgetExceeded { dimension })
            .await
    }

    async fn advance(&self, run: BuildRun, next: RunStatus) -> Result<BuildRun> {
        self.persist_transition(run, next, None).await
    }

    async fn fail_run(&self, run: BuildRun, reason: RunFailureReason) -> Result<BuildRun> {
        self.persist_transition(run, RunStatus::Failed, Some(reason))
            .await
    }

    async fn persist_transition(
        &self,
        mut run: BuildRun,
        next: RunStatus,
        reason: Option<RunFailureReason>,
    ) -> Result<BuildRun> {
        let from = run.status;
        match &reason {
            Some(reason) => run.fail(reason.clone())?,
            None => run.transition_to(next)?,
        }
        if let Ok(usage) = self.budgets.usage(run.id).await {
            run.budget_usage = usage;
        }
        let run = self.store.update_run(run).await?;
        self.store
            .append_event(
                run.id,
                RunEventKind::StatusChanged,
                json!({
                    "from": from,
                    "to": run.status,
                    "iteration": run.iteration,
                    "failure_reason": reason,
                }),
            )
            .await?;
        match &reason {
            Some(reason) => warn!(
                run_id = %run.id,
                tenant_id = run.tenant_id.value(),
                from = from.as_str(),
                iteration = run.iteration,
                ?reason,
                "run failed"
            ),
            None => info!(
                run_id = %run.id,
                tenant_id = run.tenant_id.value(),
                from = from.as_str(),
                to = run.status.as_str(),
                iteration = run.iteration,
                "run transition"
            ),
        }
        Ok(run)
    }

    async fn finish_step(&self, step: BuildStep) -> Result<()> {
        let run_id = step.run_id;
        let payload = json!({
            "step": step.name,
            "iteration": step.iteration,
            "status": step.status,
            "duration_ms": step.duration_ms(),
        });
        self.store.record_step(step).await?;
        self.store
            .append_event(run_id, RunEventKind::StepCompleted, payload)
            .await
            .map(|_| ())
    }

    async fn step_failed(
        &self,
        run: &BuildRun,
        ctx: &mut DriveContext,
        step: BuildStep,
        error: &EngineError,
    ) -> Result<()> {
        let message = truncate_message(&redact_sensitive(&error.to_string()), MAX_ERROR_CHARS);
        let completion = StepCompletion {
            run_id: run.id,
            step_name: step.name,
            status: StepStatus::Failed,
            output: Value::Null,
            logs: vec![message.clone()],
            artifacts: BTreeMap::from([("source".to_string(), json!(step.name.as_str()))]),
        };
        let signal = self.classifier.classify_completion(&completion);
        self.breakers
            .record_run_failure(&run, signal.failure_type)
            .await;
        warn!(
            run_id = %run.id,
            tenant_id = run.tenant_id.value(),
            step = step.name.as_str(),
            failure_type = signal.failure_type.as_str(),
            iteration = run.iteration,
            error = message.as_str(),
            "step failed"
        );
        let name = step.name;
        self.finish_step(step.fail(json!({"error": message}), signal.clone()))
            .await?;
        ctx.note_failure(name, signal, Vec::new());
        Ok(())
    }

    /// Backend call bounded by the step timeout; expiry becomes
    /// `EngineError::BackendTimeout`.
    async fn timed<T>(&self, run: &BuildRun, step: StepName, call: PortFuture<'_, T>) -> Result<T> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.step_timeout, call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(EngineError::BackendTimeout(self.step_timeout.as_secs())),
        };
        #[allow(clippy::cast_precision_loss)]
        let latency_ms = elapsed_ms(started) as f64;
        self.metrics
            .observe(
                names::AGENT_LATENCY_MS,
                &[("tenant", run.tenant_id.value()), ("step", step.as_str())],
                latency_ms,
            )
            .await;
        result
    }

    async fn record_finished(&self, run: &BuildRun, first_failure_at: Option<DateTime<Utc>>) {
        let usage = self
            .budgets
            .release(run.id)
            .await
            .unwrap_or(run.budget_usage);
        let tenant = run.tenant_id.value();
        self.metrics
            .increment(
                names::RUNS_FINISHED_TOTAL,
                &[("tenant", tenant), ("status", run.status.as_str())],
            )
            .await;
        self.metrics
            .observe(names::COST_PER_RUN_USD, &[("tenant", tenant)], usage.cost_usd)
            .await;

        let finished_at = run.finished_at.unwrap_or_else(Utc::now);
        let succeeded = run.status == RunStatus::Completed;
        self.canary
            .record(CanarySample {
                version: run.pipeline_version.clone(),
                tenant_id: run.tenant_id.clone(),
                run_id: run.id,
                latency_ms: millis_between(run.started_at.unwrap_or(run.created_at), finished_at),
                cost_usd: usage.cost_usd,
                succeeded,
                chaos_recovery_ms: first_failure_at
                    .filter(|_| succeeded)
                    .map(|at| millis_between(at, finished_at)),
                recorded_at: Utc::now(),
            })
            .await;
        info!(
            run_id = %run.id,
            tenant_id = tenant,
            status = run.status.as_str(),
            iteration = run.iteration,
            cost_usd = usage.cost_usd,
            attempts = usage.attempts,
            "run finished"
        );
    }
}

/// Evaluator whose fallback context is the case input plus the measured latency.
fn case_evaluator(case: &EvalCase, latency_ms: u64) -> EvaluationEngine {
    let mut context = match &case.input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    context.insert("latency_ms".to_string(), json!(latency_ms));
    EvaluationEngine::with_context(context)
}

fn failure_lines(outcome: &CaseOutcome) -> impl Iterator<Item = String> + '_ {
    outcome
        .results
        .iter()
        .filter(|result| !result.passed)
        .map(move |result| {
            format!(
                "AssertionError: case {}: {} `{}`: {}",
                outcome.case_id, result.kind, result.key, result.message
            )
        })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}
