// ── Module declarations ───────────────────────────────────────────────────────

pub mod coordinator;
pub mod dispatch;
pub mod executor;
pub mod fusion;
pub mod manager;
pub mod ratelimit;
pub mod registry;
pub mod selector;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use coordinator::PeerCoordinator;
pub use dispatch::WorkDispatcher;
pub use executor::{ExecOutcome, ExecutionReport, PatternExecutor};
pub use manager::{JobManager, JobStatusView, ResultOutcome};
pub use registry::NodeRegistry;
pub use selector::{NodeSelector, SelectionFilter};

// ── Imports ───────────────────────────────────────────────────────────────────

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_state::StateGateway;
use fleet_types::config::ControlConfig;

/// Queue depth between the manager's submit path and the coordinator's
/// handoff loop.
const HANDOFF_QUEUE: usize = 64;

/// One fully wired orchestrator replica.
///
/// Construction wires the components; [`OrchestratorReplica::run`] drives
/// their background loops until the token is cancelled. The manager handle
/// is the client-facing job API.
pub struct OrchestratorReplica {
    pub manager: JobManager,
    pub registry: Arc<NodeRegistry>,
    coordinator: Arc<PeerCoordinator>,
    dispatcher: Arc<WorkDispatcher>,
    gateway: Arc<StateGateway>,
    cfg: ControlConfig,
}

impl OrchestratorReplica {
    pub fn new(cfg: ControlConfig, gateway: Arc<StateGateway>) -> Self {
        let registry = Arc::new(NodeRegistry::new(&cfg));
        let dispatcher = Arc::new(WorkDispatcher::new(
            Arc::clone(&gateway),
            cfg.topics.clone(),
        ));
        let (handoff_tx, handoff_rx) = mpsc::channel(HANDOFF_QUEUE);
        let manager = JobManager::new(
            cfg.clone(),
            Arc::clone(&gateway),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Some(handoff_tx),
        );
        let coordinator = Arc::new(PeerCoordinator::new(
            cfg.clone(),
            Arc::clone(&gateway),
            manager.clone(),
            handoff_rx,
        ));
        Self {
            manager,
            registry,
            coordinator,
            dispatcher,
            gateway,
            cfg,
        }
    }

    /// Spawn every background loop of this replica. Returns once they are
    /// running; they stop when `cancel` fires.
    pub fn start(&self, cancel: &CancellationToken) {
        tokio::spawn(
            Arc::clone(&self.registry).run(
                Arc::clone(&self.gateway),
                self.cfg.clone(),
                cancel.clone(),
            ),
        );
        tokio::spawn(Arc::clone(&self.dispatcher).run(cancel.clone()));
        tokio::spawn(Arc::clone(&self.coordinator).run(cancel.clone()));
        let manager = self.manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await });
    }
}
