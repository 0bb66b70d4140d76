//! The mesh swarm: one QUIC swarm per process, mDNS for LAN discovery,
//! gossipsub carrying the FleetMesh topic bus.
//!
//! This is not a general-purpose networking layer: the swarm loop knows
//! the bus contract. Incoming gossipsub payloads are decoded into
//! [`Envelope`]s right here and handed to the [`TopicTable`]; a malformed
//! payload never travels past this loop, and subscribers only ever see
//! typed envelopes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, mdns, Multiaddr, PeerId, SwarmBuilder};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use fleet_state::envelope::Envelope;
use fleet_types::config::NetConfig;

use crate::topics::TopicTable;

/// Idle QUIC connections are kept alive this long between dispatches.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// mDNS for LAN discovery, gossipsub for the bus, identify for peer
/// metadata. The derive produces [`MeshBehaviourEvent`] with one variant
/// per field.
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    pub mdns: mdns::tokio::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
}

/// Commands sent from the [`crate::GossipBus`] handle into the running
/// swarm loop.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Publish an encoded envelope on a bus topic.
    Publish { topic: String, data: Vec<u8> },
    /// Exit the event loop cleanly.
    Shutdown,
}

pub struct MeshSwarm {
    inner: libp2p::Swarm<MeshBehaviour>,
    table: Arc<TopicTable>,
    /// Peers currently visible via mDNS, as a mesh-size gauge for logs.
    lan_peers: HashSet<PeerId>,
}

impl MeshSwarm {
    /// Build the swarm over QUIC (TLS 1.3 built in, no separate Noise
    /// step), bind `0.0.0.0:<listen_port>`, and dial any configured
    /// seeds so fleets reach beyond mDNS range.
    pub fn build(config: &NetConfig, table: Arc<TopicTable>) -> Result<Self> {
        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_quic()
            .with_behaviour(|key| {
                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?;
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    bus_gossip_config()?,
                )
                .map_err(|msg| anyhow::anyhow!("gossipsub init: {msg}"))?;
                let identify = identify::Behaviour::new(identify::Config::new(
                    "/fleetmesh/0.1.0".into(),
                    key.public(),
                ));
                Ok(MeshBehaviour {
                    mdns,
                    gossipsub,
                    identify,
                })
            })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let listen: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port)
            .parse()
            .context("invalid QUIC listen multiaddr")?;
        swarm
            .listen_on(listen)
            .context("failed to bind QUIC listener")?;

        for seed in &config.seed_addrs {
            match seed.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr.clone()) {
                        warn!(%addr, %e, "failed to dial seed");
                    }
                }
                Err(e) => warn!(seed, %e, "invalid seed multiaddr"),
            }
        }

        Ok(Self {
            inner: swarm,
            table,
            lan_peers: HashSet::new(),
        })
    }

    /// Join every topic the table was configured with.
    pub fn subscribe_all(&mut self) -> Result<()> {
        let gs = &mut self.inner.behaviour_mut().gossipsub;
        for topic in self.table.gossip_topics() {
            gs.subscribe(&topic)
                .with_context(|| format!("subscribing to {topic}"))?;
        }
        Ok(())
    }

    /// Run until shutdown, feeding decoded envelopes into the topic table.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<SwarmCommand>) -> Result<()> {
        loop {
            tokio::select! {
                event = self.inner.select_next_some() => self.on_event(event),
                cmd = cmd_rx.recv() => match cmd {
                    Some(SwarmCommand::Publish { topic, data }) => self.publish(&topic, data),
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("mesh swarm shutting down");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn publish(&mut self, topic_name: &str, data: Vec<u8>) {
        let Some(topic) = self.table.gossip_topic(topic_name) else {
            warn!(topic = topic_name, "publish on unconfigured topic dropped");
            return;
        };
        if let Err(e) = self.inner.behaviour_mut().gossipsub.publish(topic, data) {
            // Routine while the mesh is still forming (no remote peers on
            // the topic yet); co-located subscribers already got the
            // loopback copy.
            debug!(topic = topic_name, %e, "gossipsub publish not propagated");
        }
    }

    fn on_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(event)) => self.on_mdns(event),

            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(
                gossipsub::Event::Message {
                    propagation_source,
                    message,
                    ..
                },
            )) => {
                let topic = message.topic.to_string();
                self.on_payload(propagation_source, &topic, &message.data);
            }

            // Subscription churn and identify exchanges matter only when
            // debugging mesh formation.
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(event)) => {
                trace!(?event, "gossipsub mesh event");
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(event)) => {
                trace!(?event, "identify event");
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "mesh listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(%peer_id, "peer connection established");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "peer connection closed");
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(%error, "incoming connection error");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(?peer_id, %error, "outgoing connection error");
            }
            _ => {}
        }
    }

    /// Keep the gossipsub explicit-peer list in step with mDNS
    /// visibility, counting distinct peers rather than addresses.
    fn on_mdns(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                for (peer_id, _addr) in list {
                    self.inner
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer_id);
                    if self.lan_peers.insert(peer_id) {
                        info!(%peer_id, lan_peers = self.lan_peers.len(), "LAN peer joined the mesh");
                    }
                }
            }
            mdns::Event::Expired(list) => {
                for (peer_id, _addr) in list {
                    if self.lan_peers.remove(&peer_id) {
                        self.inner
                            .behaviour_mut()
                            .gossipsub
                            .remove_explicit_peer(&peer_id);
                        info!(%peer_id, lan_peers = self.lan_peers.len(), "LAN peer left the mesh");
                    }
                }
            }
        }
    }

    /// Decode and deliver one bus payload. The envelope boundary lives
    /// here: nothing malformed crosses into the subscriber channels.
    fn on_payload(&self, from: PeerId, topic: &str, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, topic, %e, "undecodable bus payload dropped");
                return;
            }
        };
        trace!(
            topic,
            kind = %envelope.kind,
            sender = %envelope.sender_id,
            seq = envelope.sequence,
            "bus message received"
        );
        if !self.table.deliver(topic, envelope) {
            debug!(topic, "message on unconfigured topic dropped");
        }
    }
}

fn bus_gossip_config() -> Result<gossipsub::Config> {
    gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(10))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .history_length(10)
        .history_gossip(3)
        .build()
        .map_err(|msg| anyhow::anyhow!("gossipsub config: {msg}"))
}
