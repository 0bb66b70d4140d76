//! Mutable-name registry: a tiny name → current-blob-handle map.
//!
//! Exactly two names are in use: [`FLEET_REGISTRY`] (the node snapshot) and
//! [`ACTIVE_JOBS`] (job → owner). Pointers are versioned; writers pass the
//! version they read and lose on conflict, which is what makes ownership
//! handoff atomic.
//!
//! Pointer files are JSON so operators can inspect them directly.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

pub const FLEET_REGISTRY: &str = "fleet-registry";
pub const ACTIVE_JOBS: &str = "active-jobs";

/// A versioned pointer from a well-known name to a blob handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamePointer {
    pub name: String,
    pub handle: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Filesystem-backed name registry. One `<name>.name` file per record.
pub struct NameRegistry {
    name_dir: PathBuf,
}

impl NameRegistry {
    pub fn new(name_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&name_dir)?;
        Ok(Self { name_dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.name_dir.join(format!("{name}.name"))
    }

    /// Resolve a name to its current pointer, if it has ever been published.
    pub fn resolve(&self, name: &str) -> Result<Option<NamePointer>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        let ptr = serde_json::from_slice(&data)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(Some(ptr))
    }

    /// Publish a new handle under `name`.
    ///
    /// `expected_version` is the version the caller read (`None` for a first
    /// publish). A mismatch returns [`StateError::VersionConflict`] and
    /// writes nothing.
    pub fn publish(
        &self,
        name: &str,
        handle: &str,
        expected_version: Option<u64>,
    ) -> Result<NamePointer> {
        let current = self.resolve(name)?;
        let current_version = current.as_ref().map(|p| p.version);
        if current_version != expected_version {
            return Err(StateError::VersionConflict {
                expected: expected_version.unwrap_or(0),
                found: current_version.unwrap_or(0),
            });
        }

        let ptr = NamePointer {
            name: name.to_string(),
            handle: handle.to_string(),
            version: expected_version.map_or(1, |v| v + 1),
            updated_at: Utc::now(),
        };

        // Write-then-rename so readers never observe a torn pointer.
        let path = self.path_for(name);
        let tmp = self.name_dir.join(format!("{name}.name.tmp"));
        let data =
            serde_json::to_vec_pretty(&ptr).map_err(|e| StateError::Serialization(e.to_string()))?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        Ok(ptr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
