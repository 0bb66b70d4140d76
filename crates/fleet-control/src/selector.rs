//! Node selection: filter the registry view, rank deterministically.

use std::sync::Arc;

use fleet_types::config::ScoreWeights;
use fleet_types::node::{NodeRecord, NodeStatus};
use fleet_types::FailureKind;

use crate::registry::NodeRegistry;

/// What a job requires of its nodes.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    pub min_reputation: f64,
    /// Every flag must appear in the node's declared flags.
    pub required_flags: Vec<String>,
    /// Every kind must appear in the node's data kinds.
    pub data_kinds: Vec<String>,
    /// When set, only these node ids are considered (pinned jobs).
    pub allowlist: Option<Vec<String>>,
}

impl SelectionFilter {
    fn matches(&self, record: &NodeRecord) -> bool {
        if record.status != NodeStatus::Active {
            return false;
        }
        if record.reputation < self.min_reputation {
            return false;
        }
        if let Some(allow) = &self.allowlist {
            if !allow.iter().any(|id| id == &record.node_id) {
                return false;
            }
        }
        let has = |needle: &String, hay: &[String]| hay.iter().any(|f| f == needle);
        self.required_flags
            .iter()
            .all(|f| has(f, &record.capabilities.flags))
            && self
                .data_kinds
                .iter()
                .all(|k| has(k, &record.capabilities.data_kinds))
    }
}

/// `w1·reputation − w2·load_fraction − w3·recent_failure_rate`
fn score(record: &NodeRecord, w: &ScoreWeights) -> f64 {
    w.reputation * record.reputation
        - w.load * record.load_fraction()
        - w.failures * record.recent_failure_rate
}

/// Filter and rank a registry snapshot. Deterministic: identical snapshots
/// and arguments produce identical output, with lexicographic node-id
/// ordering breaking score ties.
pub fn rank(snapshot: &[NodeRecord], filter: &SelectionFilter, w: &ScoreWeights) -> Vec<NodeRecord> {
    let mut eligible: Vec<NodeRecord> = snapshot
        .iter()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();
    eligible.sort_by(|a, b| {
        score(b, w)
            .partial_cmp(&score(a, w))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    eligible
}

pub struct NodeSelector {
    registry: Arc<NodeRegistry>,
    weights: ScoreWeights,
}

impl NodeSelector {
    pub fn new(registry: Arc<NodeRegistry>, weights: ScoreWeights) -> Self {
        Self { registry, weights }
    }

    /// Top `n` eligible nodes, or `InsufficientNodes` when fewer are live.
    pub fn select(&self, filter: &SelectionFilter, n: usize) -> Result<Vec<NodeRecord>, FailureKind> {
        let ranked = rank(&self.registry.snapshot(), filter, &self.weights);
        if ranked.len() < n {
            return Err(FailureKind::InsufficientNodes);
        }
        Ok(ranked.into_iter().take(n).collect())
    }

    /// All eligible nodes in rank order, for substitute picks.
    pub fn candidates(&self, filter: &SelectionFilter) -> Vec<NodeRecord> {
        rank(&self.registry.snapshot(), filter, &self.weights)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_types::node::{NodeCapabilities, NodeLoad};

    fn record(id: &str, reputation: f64, active_jobs: u32, failure_rate: f64) -> NodeRecord {
        NodeRecord {
            node_id: id.into(),
            endpoint: "127.0.0.1:7000".into(),
            capabilities: NodeCapabilities {
                capacity: 10,
                flags: vec!["gpu".into()],
                data_kinds: vec!["medical".into()],
                ..Default::default()
            },
            load: NodeLoad {
                active_jobs,
                ..Default::default()
            },
            cached_models: vec![],
            last_heartbeat: Utc::now(),
            last_seq: 1,
            reputation,
            recent_failure_rate: failure_rate,
            status: NodeStatus::Active,
        }
    }

    #[test]
    fn ranking_prefers_reputation_and_idleness() {
        let snapshot = vec![
            record("node-a", 0.9, 8, 0.0), // loaded
            record("node-b", 0.9, 0, 0.0), // idle
            record("node-c", 0.2, 0, 0.0), // untrusted
        ];
        let ranked = rank(
            &snapshot,
            &SelectionFilter::default(),
            &ScoreWeights::default(),
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, ["node-b", "node-a", "node-c"]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let snapshot = vec![
            record("node-b", 0.5, 0, 0.0),
            record("node-a", 0.5, 0, 0.0),
        ];
        let ranked = rank(
            &snapshot,
            &SelectionFilter::default(),
            &ScoreWeights::default(),
        );
        assert_eq!(ranked[0].node_id, "node-a");
    }

    #[test]
    fn ranking_is_deterministic() {
        let snapshot = vec![
            record("node-c", 0.7, 2, 0.1),
            record("node-a", 0.7, 2, 0.1),
            record("node-b", 0.9, 5, 0.0),
        ];
        let filter = SelectionFilter {
            min_reputation: 0.5,
            ..Default::default()
        };
        let first = rank(&snapshot, &filter, &ScoreWeights::default());
        let second = rank(&snapshot, &filter, &ScoreWeights::default());
        let ids = |v: &[NodeRecord]| v.iter().map(|r| r.node_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn filters_apply() {
        let mut stale = record("node-s", 0.9, 0, 0.0);
        stale.status = NodeStatus::Stale;
        let mut no_gpu = record("node-n", 0.9, 0, 0.0);
        no_gpu.capabilities.flags.clear();
        let snapshot = vec![
            record("node-a", 0.9, 0, 0.0),
            record("node-low", 0.1, 0, 0.0),
            stale,
            no_gpu,
        ];

        let filter = SelectionFilter {
            min_reputation: 0.5,
            required_flags: vec!["gpu".into()],
            data_kinds: vec!["medical".into()],
            allowlist: None,
        };
        let ranked = rank(&snapshot, &filter, &ScoreWeights::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_id, "node-a");
    }

    #[test]
    fn stale_nodes_never_selected() {
        let mut a = record("node-a", 0.9, 0, 0.0);
        a.status = NodeStatus::Stale;
        let ranked = rank(
            &[a],
            &SelectionFilter::default(),
            &ScoreWeights::default(),
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn allowlist_pins_selection() {
        let snapshot = vec![
            record("node-a", 0.9, 0, 0.0),
            record("node-b", 0.9, 0, 0.0),
            record("node-c", 0.9, 0, 0.0),
        ];
        let filter = SelectionFilter {
            allowlist: Some(vec!["node-b".into(), "node-c".into()]),
            ..Default::default()
        };
        let ranked = rank(&snapshot, &filter, &ScoreWeights::default());
        let ids: Vec<&str> = ranked.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, ["node-b", "node-c"]);
    }
}
