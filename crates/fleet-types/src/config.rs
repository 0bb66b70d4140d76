//! Configuration structs for every FleetMesh subsystem.

use std::path::PathBuf;
use std::time::Duration;

// ── Bus topics ───────────────────────────────────────────────────────────────

pub const TOPIC_JOB_UPDATES: &str = "fleet/jobs.updates/v1";
pub const TOPIC_JOB_CANCEL: &str = "fleet/jobs.cancel/v1";
pub const TOPIC_WORK_DISPATCH: &str = "fleet/work.dispatch/v1";
pub const TOPIC_NODE_HEARTBEAT: &str = "fleet/nodes.heartbeat/v1";
pub const TOPIC_PEER_HEARTBEAT: &str = "fleet/orchestrator.heartbeat/v1";
pub const TOPIC_HANDOFF: &str = "fleet/orchestrator.handoff/v1";
pub const TOPIC_RESULTS: &str = "fleet/results.ready/v1";

/// Topic names are configurable; the defaults above are stable.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub job_updates: String,
    pub job_cancel: String,
    pub work_dispatch: String,
    pub node_heartbeat: String,
    pub peer_heartbeat: String,
    pub handoff: String,
    pub results: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            job_updates: TOPIC_JOB_UPDATES.into(),
            job_cancel: TOPIC_JOB_CANCEL.into(),
            work_dispatch: TOPIC_WORK_DISPATCH.into(),
            node_heartbeat: TOPIC_NODE_HEARTBEAT.into(),
            peer_heartbeat: TOPIC_PEER_HEARTBEAT.into(),
            handoff: TOPIC_HANDOFF.into(),
            results: TOPIC_RESULTS.into(),
        }
    }
}

impl TopicConfig {
    /// All topics a control replica or node daemon may subscribe to.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.job_updates.clone(),
            self.job_cancel.clone(),
            self.work_dispatch.clone(),
            self.node_heartbeat.clone(),
            self.peer_heartbeat.clone(),
            self.handoff.clone(),
            self.results.clone(),
        ]
    }
}

// ── Networking ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// UDP port for the QUIC listener. 0 = OS-assigned.
    pub listen_port: u16,

    /// Multiaddrs of peer orchestrators to dial at startup, for fleets that
    /// span beyond mDNS reach.
    pub seed_addrs: Vec<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            seed_addrs: Vec::new(),
        }
    }
}

/// TLS material for operator-provided client transports. The core does not
/// consume these paths; they are carried so one config file serves the whole
/// deployment.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
}

// ── Shared state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Root directory for the blob store and name records.
    /// Defaults to `$HOME/.fleetmesh/state/`.
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        let data_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/fleetmesh"))
            .join(".fleetmesh")
            .join("state");
        Self { data_dir }
    }
}

// ── Control tier ─────────────────────────────────────────────────────────────

/// Weights for node selection: `w1·reputation − w2·load − w3·failure_rate`.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub reputation: f64,
    pub load: f64,
    pub failures: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            reputation: 1.0,
            load: 0.5,
            failures: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub replica_id: String,

    /// Heartbeat interval H. Nodes go stale after 3H, evicted after 10H.
    pub heartbeat_interval_secs: u64,
    pub stale_factor: u32,
    pub evict_factor: u32,

    /// How often the registry reconciles with the fleet-registry name record.
    pub registry_refresh_secs: u64,

    /// Bounded executor parallelism per replica.
    pub max_concurrent_executors: usize,

    /// Advertised job capacity; handoff triggers above `handoff_load` of it.
    pub local_capacity: u32,
    pub handoff_load: f64,
    pub handoff_peer_load: f64,
    pub handoff_accept_timeout_secs: u64,
    /// How long a forwarding entry answers status queries after handoff.
    pub forwarding_grace_secs: u64,

    /// Terminal jobs linger in the ephemeral index this long.
    pub terminal_ttl_secs: u64,

    /// Cap applied to spec timeouts when computing the global job deadline.
    pub default_job_timeout_secs: u64,
    /// How long a dispatch waits for a node ack before trying elsewhere.
    pub dispatch_ack_timeout_secs: u64,

    /// Submit-time token bucket, per owner.
    pub rate_limit_per_minute: u32,
    /// Nominal cost of one work item, for the advisory ceiling pre-check.
    pub cost_per_work_item: f64,

    pub score_weights: ScoreWeights,
    pub topics: TopicConfig,
    pub tls: TlsConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            replica_id: "replica-001".into(),
            heartbeat_interval_secs: 10,
            stale_factor: 3,
            evict_factor: 10,
            registry_refresh_secs: 10,
            max_concurrent_executors: 32,
            local_capacity: 100,
            handoff_load: 0.8,
            handoff_peer_load: 0.5,
            handoff_accept_timeout_secs: 5,
            forwarding_grace_secs: 300,
            terminal_ttl_secs: 600,
            default_job_timeout_secs: 300,
            dispatch_ack_timeout_secs: 10,
            rate_limit_per_minute: 60,
            cost_per_work_item: 1.0,
            score_weights: ScoreWeights::default(),
            topics: TopicConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.stale_factor
    }

    pub fn evict_after(&self) -> Duration {
        self.heartbeat_interval() * self.evict_factor
    }
}

// ── Execution tier ───────────────────────────────────────────────────────────

/// Declared resource budgets a node daemon admits work against.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    pub cpu: f64,
    pub memory_bytes: u64,
    pub accelerator_slots: u32,
    pub max_workers: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpu: 4.0,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            accelerator_slots: 1,
            max_workers: 4,
        }
    }
}

/// What one work item reserves. Work items do not declare needs themselves;
/// the daemon applies this uniform estimate.
#[derive(Debug, Clone)]
pub struct WorkReservation {
    pub cpu: f64,
    pub memory_bytes: u64,
    pub accelerator_slots: u32,
}

impl Default for WorkReservation {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_bytes: 512 * 1024 * 1024,
            accelerator_slots: 0,
        }
    }
}

/// The external inference worker the supervisor spawns per work item.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program invoked once per work item. It receives the handoff document
    /// as JSON on stdin and must print the output payload as JSON on stdout.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub default_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("fleet-worker"),
            args: Vec::new(),
            default_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrewarmConfig {
    pub enabled: bool,
    /// Accesses within the window required before a model is pre-warmed.
    pub min_access_count: usize,
    pub window_secs: u64,
    pub interval_secs: u64,
    /// Models pre-warmed per cycle, most-accessed first.
    pub max_models: usize,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_access_count: 5,
            window_secs: 24 * 3600,
            interval_secs: 3600,
            max_models: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub node_id: String,
    pub endpoint: String,

    pub heartbeat_interval_secs: u64,
    pub max_queue_size: usize,

    pub budget: ResourceBudget,
    pub per_work: WorkReservation,

    /// Directory for cached model artifacts.
    /// Defaults to `$HOME/.fleetmesh/models/`.
    pub cache_dir: PathBuf,
    pub cache_budget_bytes: u64,

    pub worker: WorkerConfig,
    pub prewarm: PrewarmConfig,

    /// Capability flags advertised in heartbeats.
    pub flags: Vec<String>,
    /// Node-local dataset kinds advertised in heartbeats.
    pub data_kinds: Vec<String>,

    pub topics: TopicConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let cache_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/fleetmesh"))
            .join(".fleetmesh")
            .join("models");
        Self {
            node_id: "node-001".into(),
            endpoint: "127.0.0.1:0".into(),
            heartbeat_interval_secs: 10,
            max_queue_size: 256,
            budget: ResourceBudget::default(),
            per_work: WorkReservation::default(),
            cache_dir,
            cache_budget_bytes: 50 * 1024 * 1024 * 1024,
            worker: WorkerConfig::default(),
            prewarm: PrewarmConfig::default(),
            flags: Vec::new(),
            data_kinds: Vec::new(),
            topics: TopicConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_defaults() {
        let cfg = ControlConfig::default();
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.stale_after(), Duration::from_secs(30));
        assert_eq!(cfg.evict_after(), Duration::from_secs(100));
        assert_eq!(cfg.handoff_load, 0.8);
        assert_eq!(cfg.handoff_peer_load, 0.5);
    }

    #[test]
    fn daemon_defaults() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.worker.default_timeout_secs, 120);
        assert_eq!(cfg.cache_budget_bytes, 50 * 1024 * 1024 * 1024);
        assert!(cfg.cache_dir.ends_with("models"));
        assert_eq!(cfg.budget.max_workers, 4);
    }

    #[test]
    fn topic_defaults_are_stable() {
        let topics = TopicConfig::default();
        assert_eq!(topics.job_updates, TOPIC_JOB_UPDATES);
        assert_eq!(topics.all().len(), 7);
    }
}
