//! The structured envelope every bus message travels in.
//!
//! Envelopes are JSON on the wire: the encoding must be self-describing and
//! consumers must ignore fields they do not know, so a fleet can run mixed
//! versions during a rollout. Blob payloads use the compact codec in
//! [`crate::payload`] instead.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind tag, e.g. `"node-heartbeat"`.
    pub kind: String,
    /// Replica or node id that published the message.
    pub sender_id: String,
    /// Per-(sender, topic) monotonic sequence number.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// The typed body, kept as raw JSON until opened.
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, sender_id: &str, sequence: u64, body: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            sender_id: sender_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            body: serde_json::to_value(body)
                .map_err(|e| StateError::Serialization(e.to_string()))?,
        })
    }

    /// Deserialize the body into its typed form.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| StateError::Serialization(format!("{} body: {e}", self.kind)))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| StateError::Serialization(e.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::work::{AckStatus, WorkAck, WorkMessage};

    #[test]
    fn envelope_round_trip() {
        let msg = WorkMessage::Ack(WorkAck {
            work_id: "work-1".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            status: AckStatus::Accepted,
        });
        let env = Envelope::new("work-ack", "node-a", 3, &msg).unwrap();
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();

        assert_eq!(back.kind, "work-ack");
        assert_eq!(back.sequence, 3);
        let opened: WorkMessage = back.open().unwrap();
        match opened {
            WorkMessage::Ack(ack) => assert_eq!(ack.work_id, "work-1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{
            "kind": "node-heartbeat",
            "sender_id": "node-a",
            "sequence": 1,
            "timestamp": "2025-01-01T00:00:00Z",
            "body": null,
            "extension_field_from_the_future": {"nested": true}
        }"#;
        let env = Envelope::decode(raw.as_bytes()).unwrap();
        assert_eq!(env.sender_id, "node-a");
    }

    #[test]
    fn open_wrong_type_fails() {
        let env = Envelope::new("test", "sender", 0, &vec![1, 2, 3]).unwrap();
        assert!(env.open::<String>().is_err());
    }
}
