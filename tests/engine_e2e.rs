//! End-to-end runs through the public engine API.
//!
//! Every test wires a `ScriptedBackend` as both code generator and evaluation
//! harness, starts the worker pool and drives runs to a settled state.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use buildloop::ports::CaseExecution;
use buildloop::scripted_backend::ScriptedBackend;
use buildloop::store::{InMemoryRunStore, RunStore};
use buildloop::{
    BudgetDimension, BudgetLimits, BuildLoopEngine, BuildRun, CaseId, CaseKey,
    EngineConfig, EnginePorts, PlanId, ReviewerId, RunEventKind, RunFailureReason, RunStatus,
    SpecId, SubmitBuild, SuiteId, TenantId,
};
use futures_util::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn engine_with(backend: ScriptedBackend, store: Arc<dyn RunStore>) -> BuildLoopEngine {
    let backend = Arc::new(backend);
    BuildLoopEngine::new(
        EngineConfig::default(),
        EnginePorts {
            store,
            backend: backend.clone(),
            harness: backend,
        },
    )
}

async fn started(backend: ScriptedBackend) -> BuildLoopEngine {
    let engine = engine_with(backend, Arc::new(InMemoryRunStore::new()));
    engine
        .register_suite(SpecId::new("contacts"), ScriptedBackend::demo_suite())
        .await;
    engine.start().await.unwrap();
    engine
}

fn request(tenant: &str, max_iterations: u32, budgets: Option<BudgetLimits>) -> SubmitBuild {
    SubmitBuild {
        tenant_id: TenantId::new(tenant),
        spec_id: SpecId::new("contacts"),
        plan_id: PlanId::new("plan-1"),
        goal_text: "add a contacts page".to_string(),
        max_iterations,
        budgets,
        circuit_failure_threshold: None,
    }
}

fn always(output: &str) -> BTreeMap<CaseId, CaseExecution> {
    BTreeMap::from([(
        CaseId::new("greets-visitor"),
        CaseExecution {
            payload: json!({"output": output, "status": 200}),
            latency_ms: 40,
            error: None,
            cost_usd: 0.0,
        },
    )])
}

#[tokio::test]
async fn demo_run_completes_after_one_repair() {
    let engine = started(ScriptedBackend::demo()).await;

    let receipt = engine.submit(request("acme", 5, None)).await.unwrap();
    let view = engine
        .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(view.iteration, 2);
    assert_eq!(view.budgets_consumed.attempts, 1);

    let events = engine.events(receipt.run_id).await.unwrap();
    assert_eq!(events.first().map(|event| event.kind), Some(RunEventKind::Submitted));
    assert!(events
        .windows(2)
        .all(|pair| pair[0].seq < pair[1].seq));
    assert!(events
        .iter()
        .any(|event| event.kind == RunEventKind::AutoFixDecision));
    engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_tenants_never_exceed_their_iteration_ceiling() {
    let engine = started(ScriptedBackend::new().with_round(always("hello"))).await;

    let mut receipts = Vec::new();
    for (tenant, ceiling) in [("acme", 2), ("globex", 3), ("initech", 1)] {
        receipts.push((
            engine.submit(request(tenant, ceiling, None)).await.unwrap(),
            ceiling,
        ));
    }

    for (receipt, ceiling) in receipts {
        let view = engine
            .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(view.status, RunStatus::Failed);
        assert_eq!(view.iteration, ceiling);
        assert!(view.iteration <= view.max_iterations);
        assert_eq!(view.failure_reason, Some(RunFailureReason::MaxIterationsReached));
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_cost_budget_stops_the_run() {
    let engine = started(
        ScriptedBackend::new()
            .with_round(always("hello"))
            .with_costs(0.0, 0.6),
    )
    .await;

    let receipt = engine
        .submit(request("acme", 10, Some(BudgetLimits::new(10, 1_800, 1.0))))
        .await
        .unwrap();
    let view = engine
        .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(
        view.failure_reason,
        Some(RunFailureReason::BudgetExceeded {
            dimension: BudgetDimension::CostUsd
        })
    );
    assert_eq!(view.failure_code.as_deref(), Some("BUDGET"));
    let events = engine.events(receipt.run_id).await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.kind == RunEventKind::BudgetExceeded));
    engine.shutdown().await;
}

#[tokio::test]
async fn migration_change_waits_for_approval_then_completes() {
    let engine = started(
        ScriptedBackend::new()
            .with_files_changed(&["migrations/0004_contacts.sql"])
            .with_round(always("hello world")),
    )
    .await;

    let receipt = engine.submit(request("acme", 3, None)).await.unwrap();
    let view = engine
        .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(view.status, RunStatus::AwaitingApproval);

    let run = engine
        .approve(receipt.run_id, 0, ReviewerId::new("reviewer-1"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let error = engine
        .reject(receipt.run_id, 0, ReviewerId::new("reviewer-2"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), "CONFLICT");
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_run_awaiting_approval_fails_it() {
    let engine = started(
        ScriptedBackend::new()
            .with_files_changed(&["src/auth/session.rs"])
            .with_round(always("hello world")),
    )
    .await;

    let receipt = engine.submit(request("acme", 3, None)).await.unwrap();
    engine
        .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
        .await
        .unwrap();

    let run = engine.cancel(receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason, Some(RunFailureReason::Cancelled));
    assert_eq!(engine.cancel(receipt.run_id).await.unwrap_err().code(), "CONFLICT");
    engine.shutdown().await;
}

#[tokio::test]
async fn completed_run_rolls_back_exactly_once() {
    let engine = started(ScriptedBackend::demo()).await;
    let receipt = engine.submit(request("acme", 5, None)).await.unwrap();
    engine
        .wait_until_settled(receipt.run_id, SETTLE_TIMEOUT)
        .await
        .unwrap();

    let run = engine.rollback(receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::RolledBack);
    assert_eq!(engine.rollback(receipt.run_id).await.unwrap_err().code(), "CONFLICT");
    assert_eq!(engine.poll(receipt.run_id).await.unwrap().status, RunStatus::RolledBack);
    engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_quarantine_adds_share_one_record() {
    let engine = engine_with(ScriptedBackend::demo(), Arc::new(InMemoryRunStore::new()));
    let key = CaseKey::new(
        TenantId::new("acme"),
        SuiteId::new("contacts-smoke"),
        CaseId::new("greets-visitor"),
    );
    let quarantine = engine.orchestrator().quarantine();

    let added = join_all((0..8).map(|_| quarantine.add(key.clone(), "flaky greeting", 0.8))).await;

    let ids: Vec<_> = added.into_iter().map(|case| case.unwrap().id).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    let listed = engine
        .list_quarantine(TenantId::new("acme"), SuiteId::new("contacts-smoke"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let released = engine.release_quarantine(ids[0]).await.unwrap();
    assert!(!released.is_in_force(chrono::Utc::now()));
}

#[tokio::test]
async fn unfinished_runs_are_recovered_on_start() {
    let store = Arc::new(InMemoryRunStore::new());
    let run = BuildRun::new(&request("acme", 5, None), BudgetLimits::default(), "v1");
    let run_id = run.id;
    store.insert_run(run).await.unwrap();

    let engine = engine_with(ScriptedBackend::demo(), store);
    engine
        .register_suite(SpecId::new("contacts"), ScriptedBackend::demo_suite())
        .await;

    assert_eq!(engine.start().await.unwrap(), 1);
    let view = engine.wait_until_settled(run_id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(view.status, RunStatus::Completed);
    engine.shutdown().await;
}
