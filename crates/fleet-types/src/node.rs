//! Fleet membership records and the heartbeat / coordination messages that
//! maintain them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobSpec};

// ── Node records ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    /// Finishing current work, accepting nothing new.
    Draining,
    /// Missed three heartbeat intervals. Never selectable.
    Stale,
    /// Missed ten heartbeat intervals. Dropped on the next snapshot write.
    Evicted,
}

/// Static capabilities a node declares at heartbeat time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Max concurrent work items the node will run.
    pub capacity: u32,
    pub cpu: f64,
    pub memory_bytes: u64,
    pub accelerator_slots: u32,
    /// Free-form capability flags, e.g. "gpu", "fp16".
    #[serde(default)]
    pub flags: Vec<String>,
    /// Kinds of node-local datasets available to data selectors.
    #[serde(default)]
    pub data_kinds: Vec<String>,
}

/// Instantaneous load a node reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub active_jobs: u32,
    pub queued_jobs: u32,
    /// Reserved fractions of the declared budgets, each in [0, 1].
    pub cpu_reserved: f64,
    pub memory_reserved: f64,
    pub slots_reserved: f64,
}

/// One entry in the fleet registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub endpoint: String,
    pub capabilities: NodeCapabilities,
    pub load: NodeLoad,
    /// Model ids currently warm in the node's cache.
    #[serde(default)]
    pub cached_models: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    /// Highest heartbeat sequence applied; older arrivals are discarded.
    pub last_seq: u64,
    /// Control-plane trust score in [0, 1].
    pub reputation: f64,
    /// Exponentially weighted failure rate over recent work items.
    pub recent_failure_rate: f64,
    pub status: NodeStatus,
}

impl NodeRecord {
    /// Reported active jobs over declared capacity, clamped to [0, 1].
    pub fn load_fraction(&self) -> f64 {
        let capacity = self.capabilities.capacity.max(1);
        (f64::from(self.load.active_jobs) / f64::from(capacity)).min(1.0)
    }
}

/// The `fleet-registry` mutable-name record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Heartbeats ───────────────────────────────────────────────────────────────

/// Published on `nodes.heartbeat` every interval by each node daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub endpoint: String,
    pub capabilities: NodeCapabilities,
    pub load: NodeLoad,
    #[serde(default)]
    pub cached_models: Vec<String>,
    pub status: NodeStatus,
    /// Monotonic per-node sequence; receivers drop out-of-order arrivals.
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// Published on `orchestrator.heartbeat` by each control replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeat {
    pub replica_id: String,
    pub active_jobs: u32,
    pub capacity: u32,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// One entry in a replica's peer table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub replica_id: String,
    pub active_jobs: u32,
    pub capacity: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub last_seq: u64,
}

impl PeerRecord {
    pub fn load_fraction(&self) -> f64 {
        let capacity = self.capacity.max(1);
        (f64::from(self.active_jobs) / f64::from(capacity)).min(1.0)
    }
}

// ── Handoff protocol ─────────────────────────────────────────────────────────

/// Messages exchanged on `orchestrator.handoff`.
///
/// Offer → (first) Accept → Grant. Ownership flips in the `active-jobs`
/// record before the Grant is published, so observers never see two owners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandoffMessage {
    /// An overloaded replica offers a freshly submitted job.
    Offer {
        job_id: JobId,
        spec: Box<JobSpec>,
        owner: String,
        priority: crate::job::Priority,
        cost_ceiling: Option<f64>,
        from_replica: String,
    },
    /// A peer volunteers to take the offered job.
    Accept { job_id: JobId, replica_id: String },
    /// The offering replica confirms the winner; everyone else stands down.
    Grant { job_id: JobId, to_replica: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(active: u32, capacity: u32) -> NodeRecord {
        NodeRecord {
            node_id: "node-a".into(),
            endpoint: "127.0.0.1:7000".into(),
            capabilities: NodeCapabilities {
                capacity,
                ..Default::default()
            },
            load: NodeLoad {
                active_jobs: active,
                ..Default::default()
            },
            cached_models: vec![],
            last_heartbeat: Utc::now(),
            last_seq: 0,
            reputation: 0.5,
            recent_failure_rate: 0.0,
            status: NodeStatus::Active,
        }
    }

    #[test]
    fn load_fraction_clamps() {
        assert_eq!(record(2, 4).load_fraction(), 0.5);
        assert_eq!(record(8, 4).load_fraction(), 1.0);
        // Zero declared capacity never divides by zero.
        assert_eq!(record(1, 0).load_fraction(), 1.0);
    }

    #[test]
    fn heartbeat_serde_ignores_unknown_fields() {
        let json = r#"{
            "node_id": "node-a",
            "endpoint": "127.0.0.1:7000",
            "capabilities": {"capacity": 4, "cpu": 8.0, "memory_bytes": 1024, "accelerator_slots": 1},
            "load": {"active_jobs": 0, "queued_jobs": 0, "cpu_reserved": 0.0, "memory_reserved": 0.0, "slots_reserved": 0.0},
            "status": "Active",
            "seq": 7,
            "at": "2025-01-01T00:00:00Z",
            "some_future_field": true
        }"#;
        let hb: NodeHeartbeat = serde_json::from_str(json).unwrap();
        assert_eq!(hb.seq, 7);
        assert_eq!(hb.capabilities.capacity, 4);
        assert!(hb.cached_models.is_empty());
    }
}
