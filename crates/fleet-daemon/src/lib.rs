//! FleetMesh node daemon: receives work from the control tier over the
//! bus, admits it against local resources, caches model artifacts, runs
//! isolated workers, and reports partial results.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod cache;
pub mod error;
pub mod heartbeat;
pub mod prewarm;
pub mod queue;
pub mod resources;
pub mod supervisor;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use cache::{ModelCache, ModelLease};
pub use error::{DaemonError, Result};
pub use queue::WorkQueue;
pub use resources::{Reservation, ResourceAccountant};
pub use supervisor::{WorkHandoff, WorkerSupervisor};

// ── Imports ───────────────────────────────────────────────────────────────────

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;
use fleet_types::config::DaemonConfig;
use fleet_types::work::{
    AckStatus, CancelMessage, PartialResult, WorkAck, WorkItem, WorkMessage, WorkOutput,
};

use crate::heartbeat::HeartbeatEmitter;
use crate::prewarm::Prewarmer;

pub const KIND_WORK_ACK: &str = "work-ack";
pub const KIND_PARTIAL_RESULT: &str = "partial-result";

struct DaemonInner {
    cfg: DaemonConfig,
    gateway: Arc<StateGateway>,
    queue: Arc<WorkQueue>,
    accountant: Arc<ResourceAccountant>,
    cache: Arc<ModelCache>,
    supervisor: Arc<WorkerSupervisor>,
    prewarmer: Arc<Prewarmer>,
    /// Work ids currently inside a worker.
    running: Mutex<HashSet<String>>,
    /// Running work that was tombstoned; its result is discarded.
    tombstoned: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct NodeDaemon {
    inner: Arc<DaemonInner>,
}

impl NodeDaemon {
    pub fn new(cfg: DaemonConfig, gateway: Arc<StateGateway>) -> Result<Self> {
        let accountant = Arc::new(ResourceAccountant::new(cfg.budget.clone()));
        let queue = Arc::new(WorkQueue::new(
            cfg.max_queue_size,
            cfg.per_work.clone(),
            Arc::clone(&accountant),
        ));
        let cache = Arc::new(ModelCache::new(
            cfg.cache_dir.clone(),
            cfg.cache_budget_bytes,
            Arc::clone(&gateway),
        )?);
        let supervisor = Arc::new(WorkerSupervisor::new(cfg.worker.clone()));
        let prewarmer = Arc::new(Prewarmer::new(cfg.prewarm.clone(), Arc::clone(&cache)));
        Ok(Self {
            inner: Arc::new(DaemonInner {
                cfg,
                gateway,
                queue,
                accountant,
                cache,
                supervisor,
                prewarmer,
                running: Mutex::new(HashSet::new()),
                tombstoned: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.cfg.node_id
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.inner.queue
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.inner.cache
    }

    /// Spawn every background loop of this daemon. Returns once they are
    /// running; they stop when `cancel` fires.
    pub fn start(&self, cancel: &CancellationToken) {
        let emitter = HeartbeatEmitter::new(
            self.inner.cfg.clone(),
            Arc::clone(&self.inner.gateway),
            Arc::clone(&self.inner.accountant),
            Arc::clone(&self.inner.cache),
            Arc::clone(&self.inner.queue),
        );
        tokio::spawn(emitter.run(cancel.clone()));
        tokio::spawn(Arc::clone(&self.inner.prewarmer).run(cancel.clone()));

        let daemon = self.clone();
        let intake_cancel = cancel.clone();
        tokio::spawn(async move { daemon.intake_loop(intake_cancel).await });

        let daemon = self.clone();
        let tombstone_cancel = cancel.clone();
        tokio::spawn(async move { daemon.tombstone_loop(tombstone_cancel).await });

        let daemon = self.clone();
        let dispatch_cancel = cancel.clone();
        tokio::spawn(async move { daemon.dispatch_loop(dispatch_cancel).await });
    }

    // ── Intake: work.dispatch → queue + ack ──────────────────────────────

    async fn intake_loop(&self, cancel: CancellationToken) {
        let mut sub = match self
            .inner
            .gateway
            .subscribe(&self.inner.cfg.topics.work_dispatch)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "daemon cannot subscribe to work dispatch");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                envelope = sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    let Ok(WorkMessage::Dispatch(item)) = envelope.open::<WorkMessage>() else {
                        continue;
                    };
                    if item.node_id != self.inner.cfg.node_id {
                        continue;
                    }
                    self.admit(item).await;
                }
            }
        }
    }

    async fn admit(&self, item: WorkItem) {
        let ack = WorkAck {
            work_id: item.id.clone(),
            job_id: item.job_id.clone(),
            node_id: self.inner.cfg.node_id.clone(),
            status: match self.inner.queue.enqueue(item) {
                Ok(()) => AckStatus::Accepted,
                Err(e) => {
                    debug!(%e, "work refused");
                    AckStatus::Backpressure
                }
            },
        };
        self.inner
            .gateway
            .publish_best_effort(
                &self.inner.cfg.topics.work_dispatch,
                KIND_WORK_ACK,
                &WorkMessage::Ack(ack),
            )
            .await;
    }

    // ── Tombstones: drop cancelled work wherever it is ───────────────────

    async fn tombstone_loop(&self, cancel: CancellationToken) {
        let mut sub = match self
            .inner
            .gateway
            .subscribe(&self.inner.cfg.topics.job_cancel)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "daemon cannot subscribe to cancels");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                envelope = sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    let Ok(CancelMessage::Tombstone { job_id, work_ids }) =
                        envelope.open::<CancelMessage>()
                    else {
                        continue;
                    };
                    for work_id in work_ids {
                        if self.inner.queue.remove(&work_id) {
                            debug!(%job_id, %work_id, "tombstoned work dropped from queue");
                        } else if self
                            .inner
                            .running
                            .lock()
                            .expect("running lock poisoned")
                            .contains(&work_id)
                        {
                            // Already inside a worker: let it finish but
                            // throw the result away.
                            self.inner
                                .tombstoned
                                .lock()
                                .expect("tombstone lock poisoned")
                                .insert(work_id);
                        }
                    }
                }
            }
        }
    }

    // ── Dispatcher: single consumer keeps admission order deterministic ──

    async fn dispatch_loop(&self, cancel: CancellationToken) {
        loop {
            let Some(item) = self.inner.queue.recv(&cancel).await else {
                return;
            };
            let Some(reservation) = self
                .inner
                .accountant
                .reserve(self.inner.cfg.per_work.clone(), &cancel)
                .await
            else {
                return;
            };

            self.inner
                .running
                .lock()
                .expect("running lock poisoned")
                .insert(item.id.clone());

            let daemon = self.clone();
            tokio::spawn(async move {
                let partial = daemon.execute(&item).await;
                // Reservation released on drop, even if execution panicked
                // somewhere above us.
                drop(reservation);

                daemon
                    .inner
                    .running
                    .lock()
                    .expect("running lock poisoned")
                    .remove(&item.id);

                let discarded = daemon
                    .inner
                    .tombstoned
                    .lock()
                    .expect("tombstone lock poisoned")
                    .remove(&item.id);
                if discarded {
                    debug!(work_id = %item.id, "result of tombstoned work discarded");
                    return;
                }
                daemon
                    .inner
                    .gateway
                    .publish_best_effort(
                        &daemon.inner.cfg.topics.results,
                        KIND_PARTIAL_RESULT,
                        &partial,
                    )
                    .await;
            });
        }
    }

    // ── Per-item execution ───────────────────────────────────────────────

    async fn execute(&self, item: &WorkItem) -> PartialResult {
        let fail = |kind, elapsed_ms| PartialResult {
            work_id: item.id.clone(),
            job_id: item.job_id.clone(),
            node_id: self.inner.cfg.node_id.clone(),
            output: None,
            elapsed_ms,
            error: Some(kind),
        };

        self.inner.prewarmer.record_access(&item.model_id);

        let lease = match self.inner.cache.acquire(&item.model_id).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(work_id = %item.id, %e, "model acquisition failed");
                return fail(e.failure_kind(), 0);
            }
        };

        // Chained input travels by blob handle; resolve it for the worker.
        let input: Option<WorkOutput> = match &item.input {
            Some(handle) => match self.inner.gateway.get_payload(handle) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(work_id = %item.id, %e, "input payload fetch failed");
                    return fail(
                        fleet_types::FailureKind::Internal(format!("input fetch: {e}")),
                        0,
                    );
                }
            },
            None => None,
        };

        let handoff = WorkHandoff {
            work_id: item.id.clone(),
            job_id: item.job_id.clone(),
            model_id: item.model_id.clone(),
            model_path: lease.path().display().to_string(),
            input,
            data_selector: item.data_selector.clone(),
            timeout_secs: item.timeout_secs,
        };
        let verdict = self.inner.supervisor.run(&handoff).await;
        drop(lease);

        match verdict.outcome {
            Ok(output) => match self.inner.gateway.put_payload(&output) {
                Ok(handle) => {
                    info!(work_id = %item.id, elapsed_ms = verdict.elapsed_ms, "work completed");
                    PartialResult {
                        work_id: item.id.clone(),
                        job_id: item.job_id.clone(),
                        node_id: self.inner.cfg.node_id.clone(),
                        output: Some(handle),
                        elapsed_ms: verdict.elapsed_ms,
                        error: None,
                    }
                }
                Err(e) => fail(
                    fleet_types::FailureKind::Internal(format!("output persist: {e}")),
                    verdict.elapsed_ms,
                ),
            },
            Err(kind) => {
                warn!(work_id = %item.id, failure = %kind, "work failed");
                fail(kind, verdict.elapsed_ms)
            }
        }
    }
}
