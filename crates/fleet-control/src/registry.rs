//! In-memory fleet registry.
//!
//! Heartbeats upsert records; a background sweep marks silent nodes stale
//! after 3 intervals and evicted after 10; a reconcile loop exchanges
//! snapshots with the fleet-registry name record so replicas converge on
//! nodes they have never heard from directly.
//!
//! Selection always reads this in-memory view, never the remote record.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;
use fleet_types::config::ControlConfig;
use fleet_types::node::{FleetSnapshot, NodeHeartbeat, NodeRecord, NodeStatus};

/// Reputation of a node on first contact.
const INITIAL_REPUTATION: f64 = 0.5;
/// Reputation drift per observed work-item outcome.
const REPUTATION_REWARD: f64 = 0.01;
const REPUTATION_PENALTY: f64 = 0.05;
/// EWMA factor for the recent failure rate.
const FAILURE_EWMA: f64 = 0.2;

pub struct NodeRegistry {
    stale_after: Duration,
    evict_after: Duration,
    // Many concurrent readers (executors); writes go through the run loop
    // and the outcome hooks, serialized by the lock.
    inner: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new(cfg: &ControlConfig) -> Self {
        Self {
            stale_after: cfg.stale_after(),
            evict_after: cfg.evict_after(),
            inner: RwLock::new(HashMap::new()),
        }
    }

    // ── Heartbeat application ────────────────────────────────────────────

    /// Upsert from a heartbeat. Returns false when the heartbeat is older
    /// than one already applied (out-of-order arrivals are discarded).
    pub fn apply_heartbeat(&self, hb: NodeHeartbeat) -> bool {
        let mut nodes = self.inner.write().expect("registry lock poisoned");
        let now = Utc::now();

        match nodes.get_mut(&hb.node_id) {
            Some(record) => {
                if hb.seq <= record.last_seq {
                    debug!(node_id = %hb.node_id, seq = hb.seq, "stale heartbeat discarded");
                    return false;
                }
                record.endpoint = hb.endpoint;
                record.capabilities = hb.capabilities;
                record.load = hb.load;
                record.cached_models = hb.cached_models;
                record.last_heartbeat = now;
                record.last_seq = hb.seq;
                // Any heartbeat promotes a stale/evicted node straight back.
                record.status = match hb.status {
                    NodeStatus::Draining => NodeStatus::Draining,
                    _ => NodeStatus::Active,
                };
                true
            }
            None => {
                info!(node_id = %hb.node_id, "node joined the fleet");
                nodes.insert(
                    hb.node_id.clone(),
                    NodeRecord {
                        node_id: hb.node_id,
                        endpoint: hb.endpoint,
                        capabilities: hb.capabilities,
                        load: hb.load,
                        cached_models: hb.cached_models,
                        last_heartbeat: now,
                        last_seq: hb.seq,
                        reputation: INITIAL_REPUTATION,
                        recent_failure_rate: 0.0,
                        status: match hb.status {
                            NodeStatus::Draining => NodeStatus::Draining,
                            _ => NodeStatus::Active,
                        },
                    },
                );
                true
            }
        }
    }

    // ── Staleness sweep ──────────────────────────────────────────────────

    /// Demote silent nodes. Returns (newly stale, newly evicted).
    pub fn sweep(&self) -> (usize, usize) {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let stale_after = chrono::Duration::from_std(self.stale_after).expect("small duration");
        let evict_after = chrono::Duration::from_std(self.evict_after).expect("small duration");

        let mut nodes = self.inner.write().expect("registry lock poisoned");
        let mut stale = 0;
        let mut evicted = 0;
        for record in nodes.values_mut() {
            let silence = now - record.last_heartbeat;
            if silence > evict_after {
                if record.status != NodeStatus::Evicted {
                    warn!(node_id = %record.node_id, "node evicted after prolonged silence");
                    record.status = NodeStatus::Evicted;
                    evicted += 1;
                }
            } else if silence > stale_after {
                if matches!(record.status, NodeStatus::Active | NodeStatus::Draining) {
                    debug!(node_id = %record.node_id, "node went stale");
                    record.status = NodeStatus::Stale;
                    stale += 1;
                }
            }
        }
        (stale, evicted)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// All records, sorted by node id for deterministic iteration.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let nodes = self.inner.read().expect("registry lock poisoned");
        let mut records: Vec<NodeRecord> = nodes.values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        matches!(
            self.get(node_id).map(|r| r.status),
            Some(NodeStatus::Active)
        )
    }

    /// Highest reputation across non-evicted records; 0 for an empty fleet.
    pub fn max_reputation(&self) -> f64 {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|r| r.status != NodeStatus::Evicted)
            .map(|r| r.reputation)
            .fold(0.0, f64::max)
    }

    // ── Outcome feedback ─────────────────────────────────────────────────

    /// Adjust reputation and the failure EWMA after a work item resolves.
    pub fn record_outcome(&self, node_id: &str, ok: bool) {
        let mut nodes = self.inner.write().expect("registry lock poisoned");
        if let Some(record) = nodes.get_mut(node_id) {
            if ok {
                record.reputation = (record.reputation + REPUTATION_REWARD).min(1.0);
            } else {
                record.reputation = (record.reputation - REPUTATION_PENALTY).max(0.0);
            }
            let sample = if ok { 0.0 } else { 1.0 };
            record.recent_failure_rate =
                (1.0 - FAILURE_EWMA) * record.recent_failure_rate + FAILURE_EWMA * sample;
        }
    }

    // ── Reconciliation ───────────────────────────────────────────────────

    /// Merge a published snapshot: nodes we have never seen are adopted
    /// as-is (the sweep will judge their heartbeat age); nodes we track
    /// keep the local, fresher record.
    pub fn merge_snapshot(&self, snapshot: FleetSnapshot) {
        let mut nodes = self.inner.write().expect("registry lock poisoned");
        for record in snapshot.nodes {
            nodes.entry(record.node_id.clone()).or_insert(record);
        }
    }

    /// The view this replica publishes: everything not evicted.
    pub fn to_fleet_snapshot(&self) -> FleetSnapshot {
        let nodes = self.inner.read().expect("registry lock poisoned");
        let mut records: Vec<NodeRecord> = nodes
            .values()
            .filter(|r| r.status != NodeStatus::Evicted)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        FleetSnapshot {
            nodes: records,
            updated_at: Some(Utc::now()),
        }
    }

    // ── Background loop ──────────────────────────────────────────────────

    /// Drive heartbeat intake, the staleness sweep, and name-record
    /// reconciliation until cancelled.
    pub async fn run(
        self: Arc<Self>,
        gateway: Arc<StateGateway>,
        cfg: ControlConfig,
        cancel: CancellationToken,
    ) {
        let mut heartbeats = match gateway.subscribe(&cfg.topics.node_heartbeat).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "registry cannot subscribe to heartbeats");
                return;
            }
        };

        let mut sweep_tick = tokio::time::interval(cfg.heartbeat_interval());
        let mut refresh_tick =
            tokio::time::interval(Duration::from_secs(cfg.registry_refresh_secs));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("registry loop cancelled");
                    return;
                }

                envelope = heartbeats.recv() => {
                    let Some(envelope) = envelope else { return };
                    match envelope.open::<NodeHeartbeat>() {
                        Ok(hb) => { self.apply_heartbeat(hb); }
                        Err(e) => warn!(%e, "undecodable node heartbeat"),
                    }
                }

                _ = sweep_tick.tick() => {
                    let (stale, evicted) = self.sweep();
                    if stale + evicted > 0 {
                        info!(stale, evicted, "staleness sweep demoted nodes");
                    }
                }

                _ = refresh_tick.tick() => {
                    match gateway.read_fleet_snapshot() {
                        Ok(snapshot) => self.merge_snapshot(snapshot),
                        Err(e) => warn!(%e, "fleet snapshot read failed"),
                    }
                    if let Err(e) = gateway.write_fleet_snapshot(&self.to_fleet_snapshot()).await {
                        warn!(%e, "fleet snapshot write failed");
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::node::{NodeCapabilities, NodeLoad};

    fn cfg() -> ControlConfig {
        ControlConfig::default() // H = 10s, stale 30s, evict 100s
    }

    fn heartbeat(node: &str, seq: u64) -> NodeHeartbeat {
        NodeHeartbeat {
            node_id: node.into(),
            endpoint: "127.0.0.1:7000".into(),
            capabilities: NodeCapabilities {
                capacity: 4,
                ..Default::default()
            },
            load: NodeLoad::default(),
            cached_models: vec![],
            status: NodeStatus::Active,
            seq,
            at: Utc::now(),
        }
    }

    #[test]
    fn heartbeat_inserts_then_updates() {
        let registry = NodeRegistry::new(&cfg());
        assert!(registry.apply_heartbeat(heartbeat("node-a", 1)));
        assert!(registry.is_active("node-a"));
        assert_eq!(registry.get("node-a").unwrap().reputation, 0.5);

        assert!(registry.apply_heartbeat(heartbeat("node-a", 2)));
        assert_eq!(registry.get("node-a").unwrap().last_seq, 2);
    }

    #[test]
    fn out_of_order_heartbeats_discarded() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 5));
        assert!(!registry.apply_heartbeat(heartbeat("node-a", 4)));
        assert!(!registry.apply_heartbeat(heartbeat("node-a", 5)));
        assert_eq!(registry.get("node-a").unwrap().last_seq, 5);
    }

    #[test]
    fn sweep_marks_stale_then_evicted() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 1));

        let now = Utc::now();
        // Inside 3H: still active.
        registry.sweep_at(now + chrono::Duration::seconds(29));
        assert_eq!(registry.get("node-a").unwrap().status, NodeStatus::Active);

        // Past 3H: stale.
        registry.sweep_at(now + chrono::Duration::seconds(31));
        assert_eq!(registry.get("node-a").unwrap().status, NodeStatus::Stale);

        // Past 10H: evicted.
        registry.sweep_at(now + chrono::Duration::seconds(101));
        assert_eq!(registry.get("node-a").unwrap().status, NodeStatus::Evicted);
    }

    #[test]
    fn new_heartbeat_promotes_stale_node() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 1));
        registry.sweep_at(Utc::now() + chrono::Duration::seconds(31));
        assert_eq!(registry.get("node-a").unwrap().status, NodeStatus::Stale);

        registry.apply_heartbeat(heartbeat("node-a", 2));
        assert!(registry.is_active("node-a"));
    }

    #[test]
    fn outcomes_move_reputation_and_failure_rate() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 1));

        registry.record_outcome("node-a", false);
        let record = registry.get("node-a").unwrap();
        assert!(record.reputation < 0.5);
        assert!(record.recent_failure_rate > 0.0);

        for _ in 0..20 {
            registry.record_outcome("node-a", true);
        }
        let record = registry.get("node-a").unwrap();
        assert!(record.recent_failure_rate < 0.05);
    }

    #[test]
    fn merge_adopts_unknown_nodes_only() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 7));

        let mut foreign = registry.get("node-a").unwrap();
        foreign.node_id = "node-b".into();
        foreign.last_seq = 1;
        let snapshot = FleetSnapshot {
            nodes: vec![foreign.clone(), {
                let mut stale_a = foreign;
                stale_a.node_id = "node-a".into();
                stale_a.last_seq = 1;
                stale_a
            }],
            updated_at: Some(Utc::now()),
        };
        registry.merge_snapshot(snapshot);

        assert!(registry.get("node-b").is_some());
        // The local, fresher node-a record wins.
        assert_eq!(registry.get("node-a").unwrap().last_seq, 7);
    }

    #[test]
    fn published_snapshot_drops_evicted() {
        let registry = NodeRegistry::new(&cfg());
        registry.apply_heartbeat(heartbeat("node-a", 1));
        registry.apply_heartbeat(heartbeat("node-b", 1));
        registry.sweep_at(Utc::now() + chrono::Duration::seconds(101));

        assert!(registry.to_fleet_snapshot().nodes.is_empty());
    }
}
