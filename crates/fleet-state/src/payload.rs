//! Encode/decode helpers for blob-persisted payloads.
//!
//! Everything the blob store persists (job specs, results, work outputs,
//! snapshot records) goes through bincode with the standard configuration.
//! Bus envelopes do NOT use this codec — see [`crate::envelope`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StateError};

/// Encode a payload for blob storage.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StateError::Serialization(e.to_string()))
}

/// Decode a payload fetched from the blob store.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| StateError::Serialization(e.to_string()))?;
    Ok(value)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::work::WorkOutput;

    #[test]
    fn vector_round_trip() {
        let out = WorkOutput::Vector(vec![1.0, 3.0, 5.0]);
        let bytes = encode_payload(&out).unwrap();
        let back: WorkOutput = decode_payload(&bytes).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn label_round_trip() {
        let out = WorkOutput::Label("diagnosis-x".into());
        let bytes = encode_payload(&out).unwrap();
        let back: WorkOutput = decode_payload(&bytes).unwrap();
        assert_eq!(back, WorkOutput::Label("diagnosis-x".into()));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode_payload::<WorkOutput>(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
