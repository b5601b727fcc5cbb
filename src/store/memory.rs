use super::RunStore;
use crate::error::EngineError;
use crate::ports::PortFuture;
use crate::types::{
    ApprovalGate, BuildRun, BuildStep, CaseKey, CaseRunRecord, DiffArtifact, EvalReport,
    QuarantineCase, QuarantineId, QuarantineStatus, ReplanRequest, RunEvent, RunEventKind, RunId,
    StepName, SuiteId, TenantId,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, BuildRun>,
    steps: HashMap<RunId, Vec<BuildStep>>,
    diffs: HashMap<(RunId, u32), DiffArtifact>,
    reports: HashMap<(RunId, u32), EvalReport>,
    gates: HashMap<(RunId, u32), ApprovalGate>,
    replans: HashMap<RunId, Vec<ReplanRequest>>,
    events: HashMap<RunId, Vec<RunEvent>>,
    case_runs: HashMap<CaseKey, Vec<CaseRunRecord>>,
    quarantine: BTreeMap<QuarantineId, QuarantineCase>,
}

/// Process-local store; the default when no database is configured.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: RwLock<MemoryState>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn run_not_found(run_id: RunId) -> EngineError {
    EngineError::RunNotFound(run_id.to_string())
}

fn insert_once<T>(
    map: &mut HashMap<(RunId, u32), T>,
    run_id: RunId,
    iteration: u32,
    what: &str,
    value: T,
) -> crate::Result<()> {
    if map.contains_key(&(run_id, iteration)) {
        return Err(EngineError::Duplicate(format!(
            "{what} for run {run_id} iteration {iteration}"
        )));
    }
    map.insert((run_id, iteration), value);
    Ok(())
}

impl RunStore for InMemoryRunStore {
    fn insert_run(&self, run: BuildRun) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.runs.contains_key(&run.id) {
                return Err(EngineError::Duplicate(format!("run {}", run.id)));
            }
            state.runs.insert(run.id, run);
            Ok(())
        })
    }

    fn update_run(&self, mut run: BuildRun) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state.runs.get_mut(&run.id).ok_or_else(|| run_not_found(run.id))?;
            run.cancel_requested |= stored.cancel_requested;
            *stored = run.clone();
            Ok(run)
        })
    }

    fn get_run(&self, run_id: RunId) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            self.state
                .read()
                .await
                .runs
                .get(&run_id)
                .cloned()
                .ok_or_else(|| run_not_found(run_id))
        })
    }

    fn request_cancel(&self, run_id: RunId) -> PortFuture<'_, BuildRun> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state.runs.get_mut(&run_id).ok_or_else(|| run_not_found(run_id))?;
            stored.cancel_requested = true;
            stored.updated_at = Utc::now();
            Ok(stored.clone())
        })
    }

    fn list_incomplete(&self) -> PortFuture<'_, Vec<BuildRun>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut runs: Vec<BuildRun> = state
                .runs
                .values()
                .filter(|run| run.status.needs_worker())
                .cloned()
                .collect();
            runs.sort_by_key(|run| run.created_at);
            Ok(runs)
        })
    }

    fn record_step(&self, step: BuildStep) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .steps
                .entry(step.run_id)
                .or_default()
                .push(step);
            Ok(())
        })
    }

    fn latest_step_outputs(
        &self,
        run_id: RunId,
    ) -> PortFuture<'_, BTreeMap<StepName, serde_json::Value>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .steps
                .get(&run_id)
                .map(|steps| {
                    steps
                        .iter()
                        .map(|step| (step.name, step.output.clone()))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn insert_diff(&self, diff: DiffArtifact) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            insert_once(&mut state.diffs, diff.run_id, diff.iteration, "diff artifact", diff)
        })
    }

    fn get_diff(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<DiffArtifact>> {
        Box::pin(async move { Ok(self.state.read().await.diffs.get(&(run_id, iteration)).cloned()) })
    }

    fn insert_report(&self, report: EvalReport) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            insert_once(
                &mut state.reports,
                report.run_id,
                report.iteration,
                "eval report",
                report,
            )
        })
    }

    fn get_report(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<EvalReport>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .reports
                .get(&(run_id, iteration))
                .cloned())
        })
    }

    fn insert_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            insert_once(&mut state.gates, gate.run_id, gate.iteration, "approval gate", gate)
        })
    }

    fn get_gate(&self, run_id: RunId, iteration: u32) -> PortFuture<'_, Option<ApprovalGate>> {
        Box::pin(async move { Ok(self.state.read().await.gates.get(&(run_id, iteration)).cloned()) })
    }

    fn update_gate(&self, gate: ApprovalGate) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .gates
                .get_mut(&(gate.run_id, gate.iteration))
                .ok_or_else(|| {
                    EngineError::ApprovalError(format!(
                        "no approval gate for run {} iteration {}",
                        gate.run_id, gate.iteration
                    ))
                })?;
            *stored = gate;
            Ok(())
        })
    }

    fn insert_replan(&self, request: ReplanRequest) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .replans
                .entry(request.run_id)
                .or_default()
                .push(request);
            Ok(())
        })
    }

    fn list_replans(&self, run_id: RunId) -> PortFuture<'_, Vec<ReplanRequest>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .replans
                .get(&run_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn append_event(
        &self,
        run_id: RunId,
        kind: RunEventKind,
        payload: serde_json::Value,
    ) -> PortFuture<'_, RunEvent> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let events = state.events.entry(run_id).or_default();
            let event = RunEvent {
                seq: events.len() as u64 + 1,
                run_id,
                kind,
                payload,
                created_at: Utc::now(),
            };
            events.push(event.clone());
            Ok(event)
        })
    }

    fn list_events(&self, run_id: RunId) -> PortFuture<'_, Vec<RunEvent>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .events
                .get(&run_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn record_case_run(&self, key: CaseKey, record: CaseRunRecord) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .case_runs
                .entry(key)
                .or_default()
                .push(record);
            Ok(())
        })
    }

    fn case_history(&self, key: CaseKey) -> PortFuture<'_, Vec<CaseRunRecord>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .case_runs
                .get(&key)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn insert_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let clash = state
                .quarantine
                .values()
                .any(|existing| existing.status == QuarantineStatus::Active && existing.key == case.key);
            if clash {
                return Err(EngineError::Duplicate(format!(
                    "active quarantine for {}/{}/{}",
                    case.key.tenant_id, case.key.suite_id, case.key.case_id
                )));
            }
            state.quarantine.insert(case.id, case);
            Ok(())
        })
    }

    fn update_quarantine(&self, case: QuarantineCase) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .quarantine
                .get_mut(&case.id)
                .ok_or_else(|| EngineError::QuarantineNotFound(case.id.to_string()))?;
            if stored.status != QuarantineStatus::Active {
                return Err(EngineError::InvalidTransition {
                    from: stored.status.as_str().to_string(),
                    to: case.status.as_str().to_string(),
                });
            }
            *stored = case;
            Ok(())
        })
    }

    fn get_quarantine(&self, id: QuarantineId) -> PortFuture<'_, Option<QuarantineCase>> {
        Box::pin(async move { Ok(self.state.read().await.quarantine.get(&id).cloned()) })
    }

    fn find_active_quarantine(&self, key: CaseKey) -> PortFuture<'_, Option<QuarantineCase>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .quarantine
                .values()
                .find(|case| case.status == QuarantineStatus::Active && case.key == key)
                .cloned())
        })
    }

    fn list_quarantine(
        &self,
        tenant_id: TenantId,
        suite_id: SuiteId,
    ) -> PortFuture<'_, Vec<QuarantineCase>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut cases: Vec<QuarantineCase> = state
                .quarantine
                .values()
                .filter(|case| case.key.tenant_id == tenant_id && case.key.suite_id == suite_id)
                .cloned()
                .collect();
            cases.sort_by_key(|case| case.created_at);
            Ok(cases)
        })
    }

    fn list_active_quarantine(&self) -> PortFuture<'_, Vec<QuarantineCase>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .quarantine
                .values()
                .filter(|case| case.status == QuarantineStatus::Active)
                .cloned()
                .collect())
        })
    }
}
