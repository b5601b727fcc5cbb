#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::WorkerConfig;
use crate::error::{EngineError, Result};
use crate::metrics::names;
use crate::orchestrator::RunOrchestrator;
use crate::types::RunId;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type SharedReceiver = Arc<Mutex<mpsc::Receiver<RunId>>>;

/// Fixed set of workers pulling run ids from a bounded queue.
///
/// Each worker drives one run at a time to its next resting state. Closing the
/// queue lets workers drain what is already queued and then exit.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<RunId>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `pool_size` workers on the current runtime.
    #[must_use]
    pub fn start(orchestrator: Arc<RunOrchestrator>, config: WorkerConfig) -> Self {
        let size = config.pool_size.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let heartbeat = Duration::from_secs(config.heartbeat_secs.max(1));

        let handles = (0..size)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&receiver),
                    Arc::clone(&orchestrator),
                    heartbeat,
                ))
            })
            .collect();
        info!(workers = size, queue_capacity = config.queue_capacity, "worker pool started");

        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            size,
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// # Errors
    /// Returns `EngineError::WorkerError` when the queue is full or the pool
    /// has been shut down.
    pub async fn enqueue(&self, run_id: RunId) -> Result<()> {
        let sender = self.sender.lock().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("worker pool is shut down".to_string()))?;
        sender.try_send(run_id).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::WorkerError(format!("run queue full; run {run_id} not scheduled"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::WorkerError("run queue closed".to_string())
            }
        })?;
        debug!(run_id = %run_id, "run enqueued");
        Ok(())
    }

    /// Stop accepting runs, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().await.take());
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(join_error) = handle.await {
                error!(%join_error, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn next_run(receiver: &SharedReceiver) -> Option<RunId> {
    receiver.lock().await.recv().await
}

async fn worker_loop(
    worker: usize,
    receiver: SharedReceiver,
    orchestrator: Arc<RunOrchestrator>,
    heartbeat: Duration,
) {
    let label = worker.to_string();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let run_id = tokio::select! {
            _ = ticker.tick() => {
                #[allow(clippy::cast_precision_loss)]
                let now = Utc::now().timestamp() as f64;
                orchestrator
                    .metrics()
                    .set_gauge(names::WORKER_HEARTBEAT_UNIX, &[("worker", label.as_str())], now)
                    .await;
                continue;
            }
            next = next_run(&receiver) => match next {
                Some(run_id) => run_id,
                None => break,
            },
        };

        match orchestrator.drive(run_id).await {
            Ok(status) => debug!(worker, run_id = %run_id, status = status.as_str(), "run settled"),
            Err(error) => warn!(worker, run_id = %run_id, %error, code = error.code(), "run driver stopped with error"),
        }
    }
    debug!(worker, "worker exiting");
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::orchestrator::EnginePorts;
    use crate::scripted_backend::ScriptedBackend;
    use crate::store::InMemoryRunStore;
    use crate::types::{PlanId, RunStatus, SpecId, SubmitBuild, TenantId};

    async fn orchestrator() -> Arc<RunOrchestrator> {
        let backend = Arc::new(ScriptedBackend::demo());
        let orchestrator = RunOrchestrator::new(
            EngineConfig::default(),
            EnginePorts {
                store: Arc::new(InMemoryRunStore::new()),
                backend: backend.clone(),
                harness: backend,
            },
        );
        orchestrator
            .register_suite(SpecId::new("contacts"), ScriptedBackend::demo_suite())
            .await;
        Arc::new(orchestrator)
    }

    fn request(tenant: &str) -> SubmitBuild {
        SubmitBuild {
            tenant_id: TenantId::new(tenant),
            spec_id: SpecId::new("contacts"),
            plan_id: PlanId::new("plan-1"),
            goal_text: "add a contacts page".to_string(),
            max_iterations: 5,
            budgets: None,
            circuit_failure_threshold: None,
        }
    }

    #[tokio::test]
    async fn given_queued_runs_when_pool_shuts_down_then_all_are_driven() {
        let orchestrator = orchestrator().await;
        let pool = WorkerPool::start(Arc::clone(&orchestrator), WorkerConfig::default());
        let mut run_ids = Vec::new();
        for tenant in ["acme", "globex", "initech"] {
            let run = orchestrator.submit(request(tenant)).await.unwrap();
            pool.enqueue(run.id).await.unwrap();
            run_ids.push(run.id);
        }

        pool.shutdown().await;

        for run_id in run_ids {
            let run = orchestrator.store().get_run(run_id).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let orchestrator = orchestrator().await;
        let pool = WorkerPool::start(Arc::clone(&orchestrator), WorkerConfig::default());
        pool.shutdown().await;

        let error = pool.enqueue(RunId::generate()).await.unwrap_err();
        assert_eq!(error.code(), "DEPENDENCY");
    }

    #[tokio::test(start_paused = true)]
    async fn workers_publish_heartbeats() {
        let orchestrator = orchestrator().await;
        let pool = WorkerPool::start(
            Arc::clone(&orchestrator),
            WorkerConfig {
                pool_size: 2,
                heartbeat_secs: 1,
                ..WorkerConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_secs(3)).await;

        let snapshot = orchestrator.metrics().snapshot().await;
        for worker in ["0", "1"] {
            assert!(snapshot
                .gauge(names::WORKER_HEARTBEAT_UNIX, &[("worker", worker)])
                .is_some());
        }
        pool.shutdown().await;
    }
}
