//! Isolated inference workers.
//!
//! Each work item runs in a separate OS process: crash isolation comes for
//! free and the wall-clock deadline is enforceable with a kill. The worker
//! program is operator-provided (the inference runtime is opaque to the
//! daemon); the contract is a JSON handoff document on stdin and a JSON
//! output payload on stdout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use fleet_types::config::WorkerConfig;
use fleet_types::work::WorkOutput;
use fleet_types::FailureKind;

/// The document a worker reads from stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkHandoff {
    pub work_id: String,
    pub job_id: String,
    pub model_id: String,
    /// Local filesystem path of the cached model artifact.
    pub model_path: String,
    /// Chained input from an earlier pipeline step, when present.
    pub input: Option<WorkOutput>,
    /// Node-local dataset the work runs over, when pinned data is in play.
    pub data_selector: Option<String>,
    pub timeout_secs: u64,
}

/// What the supervisor observed about one worker run.
#[derive(Debug)]
pub struct WorkerVerdict {
    pub outcome: Result<WorkOutput, FailureKind>,
    pub elapsed_ms: u64,
}

pub struct WorkerSupervisor {
    cfg: WorkerConfig,
}

impl WorkerSupervisor {
    pub fn new(cfg: WorkerConfig) -> Self {
        Self { cfg }
    }

    /// Spawn a worker for one item and reap it, whatever happens.
    ///
    /// The deadline is hard: a worker that exits cleanly after it has
    /// already been reported as timed out stays timed out.
    pub async fn run(&self, handoff: &WorkHandoff) -> WorkerVerdict {
        let started = Instant::now();
        let timeout_secs = if handoff.timeout_secs == 0 {
            self.cfg.default_timeout_secs
        } else {
            handoff.timeout_secs
        };
        let deadline = Duration::from_secs(timeout_secs);

        let outcome = self.run_inner(handoff, deadline).await;
        WorkerVerdict {
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_inner(
        &self,
        handoff: &WorkHandoff,
        deadline: Duration,
    ) -> Result<WorkOutput, FailureKind> {
        let mut child = Command::new(&self.cfg.program)
            .args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FailureKind::Internal(format!(
                    "worker spawn {}: {e}",
                    self.cfg.program.display()
                ))
            })?;

        debug!(
            work_id = %handoff.work_id,
            pid = child.id().unwrap_or(0),
            "worker started"
        );

        // Structured handoff, then close stdin so the worker sees EOF.
        let document = serde_json::to_vec(handoff)
            .map_err(|e| FailureKind::Internal(format!("handoff encode: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&document).await {
                warn!(work_id = %handoff.work_id, %e, "handoff write failed");
            }
        }

        // Drain stdout concurrently so a chatty worker never blocks on a
        // full pipe while we wait for its exit.
        let mut stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Err(_elapsed) => {
                // Deadline wins. Stop, then kill, then reap.
                warn!(work_id = %handoff.work_id, ?deadline, "worker deadline exceeded");
                let _ = child.start_kill();
                let _ = child.wait().await;
                reader.abort();
                return Err(FailureKind::Timeout);
            }
            Ok(Err(e)) => {
                reader.abort();
                return Err(FailureKind::Internal(format!("worker wait: {e}")));
            }
            Ok(Ok(status)) => status,
        };

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            reader.abort();
            return Err(FailureKind::WorkerCrashed(code));
        }

        let output = reader
            .await
            .map_err(|e| FailureKind::Internal(format!("stdout reader: {e}")))?;
        serde_json::from_slice::<WorkOutput>(&output)
            .map_err(|e| FailureKind::Internal(format!("worker output parse: {e}")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
