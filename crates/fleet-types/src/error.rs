use serde::{Deserialize, Serialize};

/// Failure classification carried in job records and bus messages.
///
/// This is the wire-visible taxonomy: every failed job surfaces exactly one
/// top-level kind, and per-node partial statuses may carry their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureKind {
    // ── Spec errors (rejected at submit) ─────────────────────────────────
    #[error("invalid job spec: {0}")]
    BadSpec(String),

    #[error("insufficient live nodes for the requested selection")]
    InsufficientNodes,

    #[error("rate limit exceeded")]
    RateLimited,

    // ── Dispatch errors (recoverable per work item) ──────────────────────
    #[error("node queue backpressure")]
    Backpressure,

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    // ── Execution errors ─────────────────────────────────────────────────
    #[error("work item exceeded its deadline")]
    Timeout,

    #[error("worker crashed with exit code {0}")]
    WorkerCrashed(i32),

    #[error("resource reservation denied")]
    ResourceDenied,

    #[error("model fetch failed: {0}")]
    ModelFetchFailed(String),

    // ── Fusion errors ────────────────────────────────────────────────────
    #[error("quorum lost: too few partial results")]
    QuorumLost,

    #[error("no consensus among model votes")]
    NoConsensus,

    #[error("consensus below threshold: human review required")]
    ReviewRequired,

    // ── Pipeline errors ──────────────────────────────────────────────────
    #[error("pipeline step {0} failed after retries")]
    StepFailed(u32),

    // ── Control-plane errors ─────────────────────────────────────────────
    #[error("fleet registry is stale")]
    RegistryStale,

    #[error("peer orchestrator did not respond in time")]
    PeerTimeout,

    #[error("job handoff rejected")]
    HandoffRejected,

    #[error("internal error: {0}")]
    Internal(String),
}

impl FailureKind {
    /// HTTP status code for client-facing transports.
    ///
    /// The core carries no HTTP server; REST/WebSocket adapters map kinds
    /// through this single table so the contract stays stable.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadSpec(_) => 400,
            Self::RateLimited | Self::Backpressure => 429,
            Self::InsufficientNodes => 503,
            _ => 500,
        }
    }

    /// True if the executor may recover from this kind by re-dispatching
    /// the same work item to a different node.
    pub fn is_dispatch_error(&self) -> bool {
        matches!(self, Self::Backpressure | Self::NodeUnavailable(_))
    }
}

/// Outcome of a cancel request, distinct from failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The job was cancelled (or a cancel was already in flight).
    Ack,
    /// No job with that id is known to this replica.
    NotFound,
    /// The job already reached a terminal state.
    AlreadyTerminal,
}

impl CancelOutcome {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Ack => 200,
            Self::NotFound => 404,
            Self::AlreadyTerminal => 409,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
