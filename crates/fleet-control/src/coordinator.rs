//! Orchestrator replica coordination: peer heartbeats and load-aware job
//! handoff.
//!
//! Handoff protocol on `orchestrator.handoff`:
//! 1. The overloaded origin publishes `Offer` (with the full spec).
//! 2. Peers under the load threshold reply `Accept`.
//! 3. The origin takes the first accept, flips ownership in the
//!    `active-jobs` record, then publishes `Grant` naming the winner.
//! 4. The winner adopts and executes; everyone else drops the cached offer.
//!
//! The origin keeps a forwarding entry so status/result queries keep
//! answering during the grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;
use fleet_types::config::ControlConfig;
use fleet_types::job::{JobId, JobSpec, Priority};
use fleet_types::node::{HandoffMessage, PeerHeartbeat, PeerRecord};
use fleet_types::FailureKind;

use crate::manager::{HandoffRequest, JobManager};

pub const KIND_PEER_HEARTBEAT: &str = "peer-heartbeat";
pub const KIND_HANDOFF: &str = "handoff";

/// An offer we accepted, cached until the grant decides who runs it.
struct PendingAdoption {
    spec: JobSpec,
    owner: String,
    priority: Priority,
    cost_ceiling: Option<f64>,
}

pub struct PeerCoordinator {
    cfg: ControlConfig,
    gateway: Arc<StateGateway>,
    manager: JobManager,
    peers: Mutex<HashMap<String, PeerRecord>>,
    /// Offers this replica published, waiting for the first accept.
    pending_offers: Mutex<HashMap<JobId, oneshot::Sender<String>>>,
    /// Offers this replica accepted, waiting for a grant.
    pending_adoptions: Mutex<HashMap<JobId, PendingAdoption>>,
    handoff_rx: tokio::sync::Mutex<Option<mpsc::Receiver<HandoffRequest>>>,
}

impl PeerCoordinator {
    pub fn new(
        cfg: ControlConfig,
        gateway: Arc<StateGateway>,
        manager: JobManager,
        handoff_rx: mpsc::Receiver<HandoffRequest>,
    ) -> Self {
        Self {
            cfg,
            gateway,
            manager,
            peers: Mutex::new(HashMap::new()),
            pending_offers: Mutex::new(HashMap::new()),
            pending_adoptions: Mutex::new(HashMap::new()),
            handoff_rx: tokio::sync::Mutex::new(Some(handoff_rx)),
        }
    }

    // ── Peer table ───────────────────────────────────────────────────────

    fn apply_peer_heartbeat(&self, hb: PeerHeartbeat) {
        if hb.replica_id == self.cfg.replica_id {
            return;
        }
        let mut peers = self.peers.lock().expect("peer lock poisoned");
        match peers.get_mut(&hb.replica_id) {
            Some(record) => {
                if hb.seq <= record.last_seq {
                    return;
                }
                record.active_jobs = hb.active_jobs;
                record.capacity = hb.capacity;
                record.last_heartbeat = Utc::now();
                record.last_seq = hb.seq;
            }
            None => {
                info!(replica_id = %hb.replica_id, "peer replica discovered");
                peers.insert(
                    hb.replica_id.clone(),
                    PeerRecord {
                        replica_id: hb.replica_id,
                        active_jobs: hb.active_jobs,
                        capacity: hb.capacity,
                        last_heartbeat: Utc::now(),
                        last_seq: hb.seq,
                    },
                );
            }
        }
    }

    /// Drop peers silent for longer than the staleness window.
    fn sweep_peers(&self) {
        let cutoff = chrono::Duration::from_std(self.cfg.stale_after()).expect("small duration");
        let now = Utc::now();
        let mut peers = self.peers.lock().expect("peer lock poisoned");
        peers.retain(|replica_id, record| {
            let alive = now - record.last_heartbeat <= cutoff;
            if !alive {
                info!(%replica_id, "peer replica went stale");
            }
            alive
        });
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.lock().expect("peer lock poisoned");
        let mut records: Vec<PeerRecord> = peers.values().cloned().collect();
        records.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        records
    }

    fn any_peer_below(&self, threshold: f64) -> bool {
        self.known_peers()
            .iter()
            .any(|p| p.load_fraction() < threshold)
    }

    // ── Handoff: origin side ─────────────────────────────────────────────

    /// Offer a job away; on any failure, fall back to local execution.
    async fn try_handoff(&self, request: HandoffRequest) {
        let job_id = request.job_id.clone();

        if !self.any_peer_below(self.cfg.handoff_peer_load) {
            debug!(%job_id, "no underloaded peer; executing locally");
            self.manager.spawn_execution(&job_id);
            return;
        }

        let (accept_tx, accept_rx) = oneshot::channel();
        self.pending_offers
            .lock()
            .expect("offer lock poisoned")
            .insert(job_id.clone(), accept_tx);

        self.gateway
            .publish_best_effort(
                &self.cfg.topics.handoff,
                KIND_HANDOFF,
                &HandoffMessage::Offer {
                    job_id: job_id.clone(),
                    spec: Box::new(request.spec),
                    owner: request.owner,
                    priority: request.priority,
                    cost_ceiling: request.cost_ceiling,
                    from_replica: self.cfg.replica_id.clone(),
                },
            )
            .await;

        let wait = Duration::from_secs(self.cfg.handoff_accept_timeout_secs);
        let winner = match tokio::time::timeout(wait, accept_rx).await {
            Ok(Ok(replica_id)) => replica_id,
            _ => {
                self.pending_offers
                    .lock()
                    .expect("offer lock poisoned")
                    .remove(&job_id);
                warn!(%job_id, failure = %FailureKind::PeerTimeout, "no peer accepted; executing locally");
                self.manager.spawn_execution(&job_id);
                return;
            }
        };

        // Flip ownership before announcing the winner, so the record never
        // lags the grant.
        match self
            .gateway
            .transfer_ownership(&job_id, &self.cfg.replica_id, &winner)
            .await
        {
            Ok(()) => {
                self.gateway
                    .publish_best_effort(
                        &self.cfg.topics.handoff,
                        KIND_HANDOFF,
                        &HandoffMessage::Grant {
                            job_id: job_id.clone(),
                            to_replica: winner.clone(),
                        },
                    )
                    .await;
                self.manager.mark_forwarded(&job_id, &winner).await;
                info!(%job_id, to = %winner, "job handed off");
            }
            Err(e) => {
                warn!(%job_id, %e, failure = %FailureKind::HandoffRejected, "ownership transfer failed; executing locally");
                self.manager.spawn_execution(&job_id);
            }
        }
    }

    // ── Handoff: peer side ───────────────────────────────────────────────

    async fn handle_handoff_message(&self, message: HandoffMessage, sender: &str) {
        match message {
            HandoffMessage::Offer {
                job_id,
                spec,
                owner,
                priority,
                cost_ceiling,
                from_replica,
            } => {
                if from_replica == self.cfg.replica_id {
                    return;
                }
                if self.manager.load_fraction() >= self.cfg.handoff_peer_load {
                    return;
                }
                self.pending_adoptions
                    .lock()
                    .expect("adoption lock poisoned")
                    .insert(
                        job_id.clone(),
                        PendingAdoption {
                            spec: *spec,
                            owner,
                            priority,
                            cost_ceiling,
                        },
                    );
                self.gateway
                    .publish_best_effort(
                        &self.cfg.topics.handoff,
                        KIND_HANDOFF,
                        &HandoffMessage::Accept {
                            job_id,
                            replica_id: self.cfg.replica_id.clone(),
                        },
                    )
                    .await;
            }

            HandoffMessage::Accept {
                job_id,
                replica_id,
            } => {
                if replica_id == self.cfg.replica_id {
                    return;
                }
                // First accept wins; later ones find the sender gone.
                if let Some(tx) = self
                    .pending_offers
                    .lock()
                    .expect("offer lock poisoned")
                    .remove(&job_id)
                {
                    let _ = tx.send(replica_id);
                }
            }

            HandoffMessage::Grant { job_id, to_replica } => {
                let adoption = self
                    .pending_adoptions
                    .lock()
                    .expect("adoption lock poisoned")
                    .remove(&job_id);
                if to_replica != self.cfg.replica_id {
                    return;
                }
                match adoption {
                    Some(pending) => {
                        self.manager
                            .adopt(
                                job_id,
                                pending.spec,
                                pending.owner,
                                pending.priority,
                                pending.cost_ceiling,
                            )
                            .await;
                    }
                    None => warn!(%job_id, from = %sender, "grant without a cached offer"),
                }
            }
        }
    }

    // ── Background loop ──────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handoff_rx = self
            .handoff_rx
            .lock()
            .await
            .take()
            .expect("coordinator run() started twice");

        let mut heartbeat_sub = match self.gateway.subscribe(&self.cfg.topics.peer_heartbeat).await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "coordinator cannot subscribe to peer heartbeats");
                return;
            }
        };
        let mut handoff_sub = match self.gateway.subscribe(&self.cfg.topics.handoff).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "coordinator cannot subscribe to handoff topic");
                return;
            }
        };

        let mut heartbeat_tick = tokio::time::interval(self.cfg.heartbeat_interval());
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                _ = heartbeat_tick.tick() => {
                    seq += 1;
                    let heartbeat = PeerHeartbeat {
                        replica_id: self.cfg.replica_id.clone(),
                        active_jobs: self.manager.active_count(),
                        capacity: self.cfg.local_capacity,
                        seq,
                        at: Utc::now(),
                    };
                    self.gateway
                        .publish_best_effort(
                            &self.cfg.topics.peer_heartbeat,
                            KIND_PEER_HEARTBEAT,
                            &heartbeat,
                        )
                        .await;
                    self.sweep_peers();
                }

                envelope = heartbeat_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    match envelope.open::<PeerHeartbeat>() {
                        Ok(hb) => self.apply_peer_heartbeat(hb),
                        Err(e) => warn!(%e, "undecodable peer heartbeat"),
                    }
                }

                envelope = handoff_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    let sender = envelope.sender_id.clone();
                    match envelope.open::<HandoffMessage>() {
                        Ok(message) => self.handle_handoff_message(message, &sender).await,
                        Err(e) => warn!(%e, "undecodable handoff message"),
                    }
                }

                request = handoff_rx.recv() => {
                    let Some(request) = request else { return };
                    // Offering blocks on the accept round-trip, which this
                    // very loop delivers; run it as its own task.
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.try_handoff(request).await });
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_heartbeats_upsert_and_discard_stale_seq() {
        let cfg = ControlConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let state_cfg = fleet_types::config::StateConfig {
            data_dir: dir.path().to_path_buf(),
        };
        let bus = Arc::new(fleet_state::LocalBus::new());
        let gateway = Arc::new(StateGateway::new(&state_cfg, &cfg.replica_id, bus).unwrap());
        let registry = Arc::new(crate::registry::NodeRegistry::new(&cfg));
        let dispatcher = Arc::new(crate::dispatch::WorkDispatcher::new(
            Arc::clone(&gateway),
            cfg.topics.clone(),
        ));
        let manager = JobManager::new(
            cfg.clone(),
            Arc::clone(&gateway),
            registry,
            dispatcher,
            None,
        );
        let (_tx, rx) = mpsc::channel(1);
        let coordinator = PeerCoordinator::new(cfg, gateway, manager, rx);

        let hb = |seq: u64, jobs: u32| PeerHeartbeat {
            replica_id: "replica-peer".into(),
            active_jobs: jobs,
            capacity: 100,
            seq,
            at: Utc::now(),
        };

        coordinator.apply_peer_heartbeat(hb(1, 10));
        coordinator.apply_peer_heartbeat(hb(3, 40));
        coordinator.apply_peer_heartbeat(hb(2, 99)); // out of order, dropped

        let peers = coordinator.known_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].active_jobs, 40);
        assert!(coordinator.any_peer_below(0.5));
        assert!(!coordinator.any_peer_below(0.3));
    }
}
