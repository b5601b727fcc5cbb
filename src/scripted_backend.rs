use crate::error::EngineError;
use crate::ports::{
    CaseExecution, CaseRequest, CodeGenBackend, EvalHarness, FilePatch, GenerateRequest,
    GeneratedChange, PatchProposal, PatchRequest, Plan, PlanRequest, PortFuture,
};
use crate::types::{Assertion, CaseId, EvalCase, EvalSuite, SuiteId};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Progress {
    generate_calls: usize,
    successful_generations: usize,
    patch_calls: usize,
    calls: Vec<String>,
}

/// Deterministic backend and harness driven by a fixed script.
///
/// Evaluation results are picked by the number of successful generations so a
/// test can describe "fails first, passes after one repair".
#[derive(Debug)]
pub struct ScriptedBackend {
    files_changed: Vec<String>,
    generate_failures: Vec<String>,
    generate_delay: Option<Duration>,
    patch_replies: Vec<Result<PatchProposal, String>>,
    rounds: Vec<BTreeMap<CaseId, CaseExecution>>,
    plan_cost_usd: f64,
    generate_cost_usd: f64,
    progress: Mutex<Progress>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files_changed: vec!["src/contacts.rs".to_string(), "tests/contacts.rs".to_string()],
            generate_failures: Vec::new(),
            generate_delay: None,
            patch_replies: Vec::new(),
            rounds: Vec::new(),
            plan_cost_usd: 0.01,
            generate_cost_usd: 0.05,
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Files reported as changed by every generation.
    #[must_use]
    pub fn with_files_changed(mut self, files: &[&str]) -> Self {
        self.files_changed = files.iter().map(|file| (*file).to_string()).collect();
        self
    }

    /// The first `errors.len()` generate calls fail with these messages.
    #[must_use]
    pub fn with_generate_failures(mut self, errors: &[&str]) -> Self {
        self.generate_failures = errors.iter().map(|error| (*error).to_string()).collect();
        self
    }

    #[must_use]
    pub const fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = Some(delay);
        self
    }

    /// Replies for successive patch calls; later calls reuse a default patch.
    #[must_use]
    pub fn with_patch_replies(mut self, replies: Vec<Result<PatchProposal, String>>) -> Self {
        self.patch_replies = replies;
        self
    }

    /// Case results after the n-th successful generation (the last round repeats).
    #[must_use]
    pub fn with_round(mut self, results: BTreeMap<CaseId, CaseExecution>) -> Self {
        self.rounds.push(results);
        self
    }

    #[must_use]
    pub const fn with_costs(mut self, plan_cost_usd: f64, generate_cost_usd: f64) -> Self {
        self.plan_cost_usd = plan_cost_usd;
        self.generate_cost_usd = generate_cost_usd;
        self
    }

    /// A contacts-page build whose greeting case fails once and passes after a repair.
    #[must_use]
    pub fn demo() -> Self {
        Self::new()
            .with_round(BTreeMap::from([(
                CaseId::new("greets-visitor"),
                CaseExecution {
                    payload: json!({"output": "hello", "status": 200}),
                    latency_ms: 120,
                    error: None,
                    cost_usd: 0.01,
                },
            )]))
            .with_round(BTreeMap::from([(
                CaseId::new("greets-visitor"),
                CaseExecution {
                    payload: json!({"output": "hello world", "status": 200}),
                    latency_ms: 95,
                    error: None,
                    cost_usd: 0.01,
                },
            )]))
    }

    /// Suite matching [`ScriptedBackend::demo`].
    #[must_use]
    pub fn demo_suite() -> EvalSuite {
        EvalSuite {
            suite_id: SuiteId::new("contacts-smoke"),
            cases: vec![EvalCase {
                case_id: CaseId::new("greets-visitor"),
                input: json!({"path": "/contacts"}),
                assertions: vec![
                    Assertion::new("contains", "output", json!("world")),
                    Assertion::new("equals", "status", json!(200)),
                    Assertion::new("less_than", "latency_ms", json!(1_000)).optional(),
                ],
            }],
        }
    }

    /// Every backend call made so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.progress.lock().await.calls.clone()
    }

    pub async fn successful_generations(&self) -> usize {
        self.progress.lock().await.successful_generations
    }

    fn default_patch(request: &PatchRequest) -> PatchProposal {
        PatchProposal {
            patches: vec![FilePatch {
                path: "src/contacts.rs".to_string(),
                diff: format!(
                    "--- a/src/contacts.rs\n+++ b/src/contacts.rs\n@@ -1 +1 @@\n-// iteration {}\n+// repaired {}\n",
                    request.iteration, request.strategy.as_str()
                ),
            }],
            rationale: format!("address {}", request.signal.failure_type),
            cost_usd: 0.02,
        }
    }
}

impl CodeGenBackend for ScriptedBackend {
    fn plan(&self, request: PlanRequest) -> PortFuture<'_, Plan> {
        Box::pin(async move {
            let mut progress = self.progress.lock().await;
            progress.calls.push(format!("plan:{}", request.iteration));
            let replanned = request.replan.is_some();
            Ok(Plan {
                summary: if replanned {
                    format!("delta plan for: {}", request.goal_text)
                } else {
                    format!("plan for: {}", request.goal_text)
                },
                steps: vec![
                    "scaffold resource".to_string(),
                    "wire routes".to_string(),
                    "add tests".to_string(),
                ],
                cost_usd: self.plan_cost_usd,
            })
        })
    }

    fn generate(&self, request: GenerateRequest) -> PortFuture<'_, GeneratedChange> {
        Box::pin(async move {
            if let Some(delay) = self.generate_delay {
                tokio::time::sleep(delay).await;
            }
            let mut progress = self.progress.lock().await;
            let call = progress.generate_calls;
            progress.generate_calls += 1;
            progress.calls.push(format!("generate:{}", request.iteration));
            if let Some(error) = self.generate_failures.get(call) {
                return Err(EngineError::BackendError(error.clone()));
            }
            progress.successful_generations += 1;

            let mut unified_diff = self
                .files_changed
                .iter()
                .map(|file| {
                    format!(
                        "--- a/{file}\n+++ b/{file}\n@@ -0,0 +1,2 @@\n+// {}\n+// iteration {}\n",
                        request.plan.summary, request.iteration
                    )
                })
                .collect::<String>();
            if let Some(patch) = &request.patch {
                patch
                    .patches
                    .iter()
                    .for_each(|file_patch| unified_diff.push_str(&file_patch.diff));
            }
            Ok(GeneratedChange {
                unified_diff,
                files_changed: self.files_changed.clone(),
                cost_usd: self.generate_cost_usd,
            })
        })
    }

    fn patch(&self, request: PatchRequest) -> PortFuture<'_, PatchProposal> {
        Box::pin(async move {
            let mut progress = self.progress.lock().await;
            let call = progress.patch_calls;
            progress.patch_calls += 1;
            progress.calls.push(format!("patch:{}", request.iteration));
            match self.patch_replies.get(call) {
                Some(Ok(proposal)) => Ok(proposal.clone()),
                Some(Err(error)) => Err(EngineError::BackendError(error.clone())),
                None => Ok(Self::default_patch(&request)),
            }
        })
    }
}

impl EvalHarness for ScriptedBackend {
    fn run_case(&self, request: CaseRequest) -> PortFuture<'_, CaseExecution> {
        Box::pin(async move {
            let mut progress = self.progress.lock().await;
            progress
                .calls
                .push(format!("eval:{}:{}", request.iteration, request.case.case_id));
            let round = progress.successful_generations.saturating_sub(1);
            let execution = self
                .rounds
                .get(round)
                .or_else(|| self.rounds.last())
                .and_then(|results| results.get(&request.case.case_id))
                .cloned()
                .unwrap_or_else(|| CaseExecution {
                    payload: json!({"output": "ok"}),
                    latency_ms: 10,
                    error: None,
                    cost_usd: 0.0,
                });
            Ok(execution)
        })
    }
}
