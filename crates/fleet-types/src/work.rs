//! Work items, partial results, and the dispatch/result bus messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::job::{JobId, Priority};

/// Generate a fresh work-item id.
pub fn new_work_id() -> String {
    format!("work-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

// ── Work items ───────────────────────────────────────────────────────────────

/// One unit of work for a specific node within a job.
///
/// Destroyed when its result is observed or its deadline fires; retries use
/// a fresh id with unchanged inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub job_id: JobId,
    pub node_id: String,
    pub model_id: String,
    /// Blob handle of the input payload, when the work consumes one.
    /// Fan-out and consensus work reads node-local data instead.
    pub input: Option<String>,
    pub data_selector: Option<String>,
    pub priority: Priority,
    pub timeout_secs: u64,
    pub issued_at: DateTime<Utc>,
}

/// Typed payload a worker produces (and a pipeline step consumes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkOutput {
    /// Numeric vector, the input to fan-out fusion.
    Vector(Vec<f64>),
    /// Classification label, the input to consensus voting.
    Label(String),
    /// Free-form text, passed through pipelines untouched.
    Text(String),
}

/// The result of a single work item, produced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResult {
    pub work_id: String,
    pub job_id: JobId,
    pub node_id: String,
    /// Blob handle of the output payload; `None` when `error` is set.
    pub output: Option<String>,
    pub elapsed_ms: u64,
    pub error: Option<FailureKind>,
}

impl PartialResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.output.is_some()
    }
}

/// Compressed per-work-item status kept on the job for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialStatus {
    pub work_id: String,
    pub node_id: String,
    pub ok: bool,
    pub error: Option<FailureKind>,
    pub elapsed_ms: u64,
}

impl From<&PartialResult> for PartialStatus {
    fn from(p: &PartialResult) -> Self {
        Self {
            work_id: p.work_id.clone(),
            node_id: p.node_id.clone(),
            ok: p.is_ok(),
            error: p.error.clone(),
            elapsed_ms: p.elapsed_ms,
        }
    }
}

// ── Dispatch bus messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    /// Enqueued; a partial result will follow.
    Accepted,
    /// Queue or resources full. The orchestrator tries another node.
    Backpressure,
}

/// A node's response to a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAck {
    pub work_id: String,
    pub job_id: JobId,
    pub node_id: String,
    pub status: AckStatus,
}

/// Messages exchanged on `work.dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkMessage {
    Dispatch(WorkItem),
    Ack(WorkAck),
}

/// Messages published on `jobs.cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CancelMessage {
    /// Deletes outstanding work items; nodes drop them wherever they are.
    Tombstone {
        job_id: JobId,
        work_ids: Vec<String>,
    },
    /// Asks the current owner of a forwarded job to cancel it.
    CancelJob { job_id: JobId },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_ok_requires_output() {
        let mut p = PartialResult {
            work_id: new_work_id(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            output: Some("bafyhandle".into()),
            elapsed_ms: 12,
            error: None,
        };
        assert!(p.is_ok());

        p.error = Some(FailureKind::Timeout);
        assert!(!p.is_ok());

        p.error = None;
        p.output = None;
        assert!(!p.is_ok());
    }

    #[test]
    fn status_from_partial() {
        let p = PartialResult {
            work_id: "work-1".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            output: None,
            elapsed_ms: 120_000,
            error: Some(FailureKind::Timeout),
        };
        let s = PartialStatus::from(&p);
        assert!(!s.ok);
        assert_eq!(s.error, Some(FailureKind::Timeout));
    }

    #[test]
    fn work_message_serde_round_trip() {
        let msg = WorkMessage::Ack(WorkAck {
            work_id: "work-1".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            status: AckStatus::Backpressure,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: WorkMessage = serde_json::from_str(&json).unwrap();
        match back {
            WorkMessage::Ack(ack) => assert_eq!(ack.status, AckStatus::Backpressure),
            _ => panic!("wrong variant"),
        }
    }
}
