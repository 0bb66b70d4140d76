//! libp2p transport for the FleetMesh topic bus.
//!
//! The crate is two pieces: a [`TopicTable`] shared between the publish
//! side and the swarm loop, and the [`MeshSwarm`] event loop that decodes
//! wire payloads into envelopes at the boundary. [`GossipBus`] is the
//! handle the rest of the system sees, behind the same [`Bus`] trait the
//! in-process loopback implements.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod swarm;
pub mod topics;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use swarm::{MeshSwarm, SwarmCommand};
pub use topics::TopicTable;

// ── Imports ───────────────────────────────────────────────────────────────────

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use fleet_state::bus::{Bus, BusSubscription};
use fleet_state::envelope::Envelope;
use fleet_state::error::StateError;
use fleet_types::config::NetConfig;

/// Command channel depth into the swarm loop. 256 slots absorbs short
/// publish bursts without blocking callers.
const CHANNEL_CAPACITY: usize = 256;

// ── GossipBus ─────────────────────────────────────────────────────────────────

/// Gossipsub-backed implementation of the FleetMesh [`Bus`]. One handle
/// per process.
///
/// Publishes go through the topic table first: gossipsub does not
/// re-deliver a node's own messages, but co-located components sharing
/// this handle (an orchestrator replica observing its own `jobs.updates`,
/// or a replica and a daemon on one host) still have to hear each other.
pub struct GossipBus {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    table: Arc<TopicTable>,
}

impl GossipBus {
    /// Build the swarm, join `topic_names`, and spawn the event loop.
    /// Returns immediately; the swarm runs as a background task.
    pub async fn spawn(config: &NetConfig, topic_names: &[String]) -> Result<Self> {
        let table = Arc::new(TopicTable::new(topic_names));
        let mut mesh = MeshSwarm::build(config, Arc::clone(&table))?;
        mesh.subscribe_all()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = mesh.run(cmd_rx).await {
                tracing::error!(%e, "mesh swarm exited with error");
            }
        });

        Ok(Self { cmd_tx, table })
    }

    /// Signal the swarm loop to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("mesh swarm already stopped"))
    }
}

#[async_trait]
impl Bus for GossipBus {
    async fn publish(
        &self,
        topic: &str,
        envelope: Envelope,
    ) -> std::result::Result<(), StateError> {
        let data = envelope.encode()?;

        // Loopback before the wire, so local subscribers are never behind
        // the network.
        self.table.deliver(topic, envelope);

        self.cmd_tx
            .send(SwarmCommand::Publish {
                topic: topic.to_string(),
                data,
            })
            .await
            .map_err(|_| StateError::Bus("mesh swarm stopped — cannot publish".into()))
    }

    async fn subscribe(&self, topic: &str) -> std::result::Result<BusSubscription, StateError> {
        Ok(self.table.watch(topic))
    }
}
