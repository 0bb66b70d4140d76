use fleet_types::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Queue or resources full; the orchestrator should try another node.
    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("cache full: no evictable entries")]
    CacheFull,

    #[error("model fetch failed: {0}")]
    ModelFetch(String),

    #[error("worker spawn failed: {0}")]
    WorkerSpawn(String),

    #[error("state error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// The failure kind reported back to the orchestrator in a partial.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Backpressure(_) => FailureKind::Backpressure,
            Self::CacheFull => FailureKind::ModelFetchFailed("model cache full".into()),
            Self::ModelFetch(msg) => FailureKind::ModelFetchFailed(msg.clone()),
            Self::WorkerSpawn(msg) => FailureKind::Internal(msg.clone()),
            Self::State(e) => FailureKind::Internal(e.to_string()),
            Self::Io(e) => FailureKind::Internal(e.to_string()),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, DaemonError>;
