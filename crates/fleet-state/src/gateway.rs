//! StateGateway — the only component that touches the blob store, the
//! mutable-name registry, and the broadcast bus.
//!
//! Everything above this layer holds derived, reconstructible state: the
//! blob store and the two name records are the persistence authority.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fleet_types::config::StateConfig;
use fleet_types::job::OwnershipTable;
use fleet_types::node::FleetSnapshot;

use crate::blob::BlobStore;
use crate::bus::{Bus, BusSubscription};
use crate::envelope::Envelope;
use crate::error::{Result, StateError};
use crate::names::{NameRegistry, ACTIVE_JOBS, FLEET_REGISTRY};
use crate::payload;

/// Attempts before giving up on a contended name-record update.
const CAS_RETRIES: usize = 8;

pub struct StateGateway {
    sender_id: String,
    blobs: BlobStore,
    names: NameRegistry,
    bus: Arc<dyn Bus>,
    /// Per-topic publish sequence counters.
    seqs: Mutex<HashMap<String, u64>>,
    /// Serializes this process's name-record read-modify-write cycles.
    name_write: Mutex<()>,
}

impl StateGateway {
    pub fn new(config: &StateConfig, sender_id: &str, bus: Arc<dyn Bus>) -> Result<Self> {
        let blobs = BlobStore::new(config.data_dir.join("blobs"))?;
        let names = NameRegistry::new(config.data_dir.join("names"))?;
        Ok(Self {
            sender_id: sender_id.to_string(),
            blobs,
            names,
            bus,
            seqs: Mutex::new(HashMap::new()),
            name_write: Mutex::new(()),
        })
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // ── Blob payloads ────────────────────────────────────────────────────

    /// Persist a typed payload and return its content handle.
    pub fn put_payload<T: Serialize>(&self, value: &T) -> Result<String> {
        let bytes = payload::encode_payload(value)?;
        self.blobs.put(&bytes)
    }

    /// Fetch and decode a typed payload by handle.
    pub fn get_payload<T: DeserializeOwned>(&self, handle: &str) -> Result<T> {
        let bytes = self.blobs.get(handle)?;
        payload::decode_payload(&bytes)
    }

    // ── Bus ──────────────────────────────────────────────────────────────

    /// Wrap `body` in an envelope with the next sequence for `topic` and
    /// publish it.
    pub async fn publish<T: Serialize>(&self, topic: &str, kind: &str, body: &T) -> Result<()> {
        let seq = {
            let mut seqs = self.seqs.lock().await;
            let counter = seqs.entry(topic.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let envelope = Envelope::new(kind, &self.sender_id, seq, body)?;
        self.bus.publish(topic, envelope).await
    }

    /// Like [`Self::publish`], but a failure is logged rather than returned.
    /// Bus errors never roll state back; the owner re-publishes current
    /// state with its next heartbeat.
    pub async fn publish_best_effort<T: Serialize>(&self, topic: &str, kind: &str, body: &T) {
        if let Err(e) = self.publish(topic, kind, body).await {
            warn!(%topic, kind, error = %e, "bus publish failed");
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<BusSubscription> {
        self.bus.subscribe(topic).await
    }

    // ── Fleet snapshot record ────────────────────────────────────────────

    /// Read the published fleet snapshot, empty if never published.
    pub fn read_fleet_snapshot(&self) -> Result<FleetSnapshot> {
        match self.names.resolve(FLEET_REGISTRY)? {
            Some(ptr) => self.get_payload(&ptr.handle),
            None => Ok(FleetSnapshot::default()),
        }
    }

    /// Publish a new fleet snapshot. Last writer wins — replicas converge
    /// through heartbeats, so a lost snapshot write only delays convergence.
    pub async fn write_fleet_snapshot(&self, snapshot: &FleetSnapshot) -> Result<()> {
        let _guard = self.name_write.lock().await;
        let handle = self.put_payload(snapshot)?;
        let version = self.names.resolve(FLEET_REGISTRY)?.map(|p| p.version);
        match self.names.publish(FLEET_REGISTRY, &handle, version) {
            Ok(_) => Ok(()),
            // Raced another replica; let its write stand.
            Err(StateError::VersionConflict { .. }) => {
                debug!("fleet snapshot write raced a peer; keeping theirs");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Ownership record ─────────────────────────────────────────────────

    pub fn read_ownership(&self) -> Result<OwnershipTable> {
        match self.names.resolve(ACTIVE_JOBS)? {
            Some(ptr) => self.get_payload(&ptr.handle),
            None => Ok(OwnershipTable::default()),
        }
    }

    /// Record `replica` as the owner of `job_id`.
    pub async fn claim_ownership(&self, job_id: &str, replica: &str) -> Result<()> {
        self.update_ownership(|table| {
            table.jobs.insert(job_id.to_string(), replica.to_string());
            Ok(())
        })
        .await
    }

    /// Atomically move `job_id` from `from` to `to`. Fails with
    /// [`StateError::Ownership`] if `from` no longer owns the job.
    pub async fn transfer_ownership(&self, job_id: &str, from: &str, to: &str) -> Result<()> {
        self.update_ownership(|table| {
            match table.jobs.get(job_id).map(String::as_str) {
                Some(owner) if owner == from => {
                    table.jobs.insert(job_id.to_string(), to.to_string());
                    Ok(())
                }
                Some(owner) => Err(StateError::Ownership(format!(
                    "{job_id} is owned by {owner}, not {from}"
                ))),
                None => Err(StateError::Ownership(format!("{job_id} has no owner"))),
            }
        })
        .await
    }

    /// Drop `job_id` from the record once its final state is published.
    pub async fn release_ownership(&self, job_id: &str) -> Result<()> {
        self.update_ownership(|table| {
            table.jobs.remove(job_id);
            Ok(())
        })
        .await
    }

    /// Compare-and-set loop over the active-jobs record.
    async fn update_ownership<F>(&self, mutate: F) -> Result<()>
    where
        F: Fn(&mut OwnershipTable) -> Result<()>,
    {
        let _guard = self.name_write.lock().await;
        for _ in 0..CAS_RETRIES {
            let ptr = self.names.resolve(ACTIVE_JOBS)?;
            let mut table = match &ptr {
                Some(p) => self.get_payload(&p.handle)?,
                None => OwnershipTable::default(),
            };
            mutate(&mut table)?;
            table.updated_at = Some(chrono::Utc::now());

            let handle = self.put_payload(&table)?;
            match self
                .names
                .publish(ACTIVE_JOBS, &handle, ptr.map(|p| p.version))
            {
                Ok(_) => return Ok(()),
                Err(StateError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StateError::Ownership(
            "active-jobs record stayed contended".into(),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
