//! Periodic liveness and capacity broadcast.
//!
//! A missed publication changes nothing locally; the control plane infers
//! staleness from silence.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleet_state::StateGateway;
use fleet_types::config::DaemonConfig;
use fleet_types::node::{NodeCapabilities, NodeHeartbeat, NodeStatus};

use crate::cache::ModelCache;
use crate::queue::WorkQueue;
use crate::resources::ResourceAccountant;

pub const KIND_NODE_HEARTBEAT: &str = "node-heartbeat";

pub struct HeartbeatEmitter {
    cfg: DaemonConfig,
    gateway: Arc<StateGateway>,
    accountant: Arc<ResourceAccountant>,
    cache: Arc<ModelCache>,
    queue: Arc<WorkQueue>,
}

impl HeartbeatEmitter {
    pub fn new(
        cfg: DaemonConfig,
        gateway: Arc<StateGateway>,
        accountant: Arc<ResourceAccountant>,
        cache: Arc<ModelCache>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            cfg,
            gateway,
            accountant,
            cache,
            queue,
        }
    }

    fn build(&self, seq: u64) -> NodeHeartbeat {
        let budget = self.accountant.budget();
        let mut load = self.accountant.load();
        load.queued_jobs = self.queue.len() as u32;
        NodeHeartbeat {
            node_id: self.cfg.node_id.clone(),
            endpoint: self.cfg.endpoint.clone(),
            capabilities: NodeCapabilities {
                capacity: budget.max_workers,
                cpu: budget.cpu,
                memory_bytes: budget.memory_bytes,
                accelerator_slots: budget.accelerator_slots,
                flags: self.cfg.flags.clone(),
                data_kinds: self.cfg.data_kinds.clone(),
            },
            load,
            cached_models: self.cache.cached_models(),
            status: NodeStatus::Active,
            seq,
            at: Utc::now(),
        }
    }

    /// Publish every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.heartbeat_interval());
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    seq += 1;
                    let heartbeat = self.build(seq);
                    debug!(seq, active = heartbeat.load.active_jobs, "heartbeat");
                    self.gateway
                        .publish_best_effort(
                            &self.cfg.topics.node_heartbeat,
                            KIND_NODE_HEARTBEAT,
                            &heartbeat,
                        )
                        .await;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
