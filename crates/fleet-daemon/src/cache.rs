//! Byte-budgeted LRU cache of model artifacts.
//!
//! Artifacts are fetched from the blob store by model id and written to
//! local files the worker processes read. Concurrent `acquire`s of the
//! same model single-flight: the first caller downloads, the rest wait and
//! share the entry. The byte budget is enforced synchronously on insert —
//! the sum of entry sizes never exceeds it.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;

use crate::error::{DaemonError, Result};

struct Entry {
    size: u64,
    last_access: Instant,
    refcount: u32,
    path: PathBuf,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    total_bytes: u64,
    /// Models currently being downloaded; waiters park on the Notify.
    inflight: HashMap<String, Arc<Notify>>,
}

pub struct ModelCache {
    dir: PathBuf,
    budget: u64,
    gateway: Arc<StateGateway>,
    state: Mutex<CacheState>,
}

impl ModelCache {
    pub fn new(dir: PathBuf, budget: u64, gateway: Arc<StateGateway>) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            budget,
            gateway,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Get a leased handle on a cached model, downloading on miss.
    pub async fn acquire(self: &Arc<Self>, model_id: &str) -> Result<ModelLease> {
        loop {
            let waiter = {
                let mut state = self.state.lock().expect("cache lock poisoned");

                if let Some(entry) = state.entries.get_mut(model_id) {
                    entry.refcount += 1;
                    entry.last_access = Instant::now();
                    return Ok(ModelLease {
                        cache: Arc::clone(self),
                        model_id: model_id.to_string(),
                        path: entry.path.clone(),
                        released: false,
                    });
                }

                match state.inflight.get(model_id) {
                    // Someone else is downloading: wait our turn.
                    Some(notify) => Some(Arc::clone(notify)),
                    None => {
                        state
                            .inflight
                            .insert(model_id.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match waiter {
                Some(notify) => {
                    notify.notified().await;
                    // Re-check: the download may have failed, in which case
                    // this caller becomes the next downloader.
                    continue;
                }
                None => return self.download_and_insert(model_id).await,
            }
        }
    }

    async fn download_and_insert(self: &Arc<Self>, model_id: &str) -> Result<ModelLease> {
        info!(%model_id, "model cache miss — fetching from blob store");
        let fetched = self.gateway.blobs().get(model_id).map_err(|e| {
            self.finish_inflight(model_id);
            DaemonError::ModelFetch(e.to_string())
        });
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => return Err(e),
        };
        let size = bytes.len() as u64;

        let mut state = self.state.lock().expect("cache lock poisoned");

        if size > self.budget {
            drop(state);
            self.finish_inflight(model_id);
            return Err(DaemonError::CacheFull);
        }

        // Evict least-recently-used unreferenced entries until it fits.
        while state.total_bytes + size > self.budget {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| e.refcount == 0)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                drop(state);
                self.finish_inflight(model_id);
                return Err(DaemonError::CacheFull);
            };
            let entry = state.entries.remove(&victim).expect("victim exists");
            state.total_bytes -= entry.size;
            debug!(model_id = %victim, freed = entry.size, "evicted model");
            if let Err(e) = fs::remove_file(&entry.path) {
                warn!(path = %entry.path.display(), %e, "evicted model file removal failed");
            }
        }

        let path = self.dir.join(format!("{model_id}.model"));
        if let Err(e) = fs::write(&path, &bytes) {
            drop(state);
            self.finish_inflight(model_id);
            return Err(e.into());
        }

        state.entries.insert(
            model_id.to_string(),
            Entry {
                size,
                last_access: Instant::now(),
                refcount: 1,
                path: path.clone(),
            },
        );
        state.total_bytes += size;
        if let Some(notify) = state.inflight.remove(model_id) {
            notify.notify_waiters();
        }
        info!(%model_id, size, total = state.total_bytes, "model cached");

        Ok(ModelLease {
            cache: Arc::clone(self),
            model_id: model_id.to_string(),
            path,
            released: false,
        })
    }

    /// Clear the inflight marker after a failed download and wake waiters
    /// so one of them can retry.
    fn finish_inflight(&self, model_id: &str) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if let Some(notify) = state.inflight.remove(model_id) {
            notify.notify_waiters();
        }
    }

    fn release(&self, model_id: &str) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if let Some(entry) = state.entries.get_mut(model_id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.last_access = Instant::now();
        }
    }

    /// Model ids currently cached, for heartbeat advertisement.
    pub fn cached_models(&self) -> Vec<String> {
        let state = self.state.lock().expect("cache lock poisoned");
        let mut ids: Vec<String> = state.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().expect("cache lock poisoned").total_bytes
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.state
            .lock()
            .expect("cache lock poisoned")
            .entries
            .contains_key(model_id)
    }
}

/// A refcounted lease on a cached model. The file at `path` stays on disk
/// at least until every lease is dropped.
pub struct ModelLease {
    cache: Arc<ModelCache>,
    model_id: String,
    path: PathBuf,
    released: bool,
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model_id", &self.model_id)
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}

impl ModelLease {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release(&self.model_id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::LocalBus;
    use fleet_types::config::StateConfig;

    fn gateway(dir: &std::path::Path) -> Arc<StateGateway> {
        let cfg = StateConfig {
            data_dir: dir.to_path_buf(),
        };
        Arc::new(StateGateway::new(&cfg, "node-test", Arc::new(LocalBus::new())).unwrap())
    }

    fn cache_with(budget: u64, dir: &std::path::Path, gw: &Arc<StateGateway>) -> Arc<ModelCache> {
        Arc::new(ModelCache::new(dir.join("cache"), budget, Arc::clone(gw)).unwrap())
    }

    fn store_model(gw: &Arc<StateGateway>, bytes: &[u8]) -> String {
        gw.blobs().put(bytes).unwrap()
    }

    #[tokio::test]
    async fn miss_downloads_then_hit_shares() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(1024, dir.path(), &gw);
        let model = store_model(&gw, b"weights-a");

        let lease = cache.acquire(&model).await.unwrap();
        assert!(lease.path().exists());
        assert_eq!(cache.total_bytes(), 9);

        let second = cache.acquire(&model).await.unwrap();
        assert_eq!(second.path(), lease.path());
        // Same artifact counted once.
        assert_eq!(cache.total_bytes(), 9);
    }

    #[tokio::test]
    async fn missing_model_is_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(1024, dir.path(), &gw);

        let err = cache.acquire("bafymissing").await.unwrap_err();
        assert!(matches!(err, DaemonError::ModelFetch(_)));
        // A failed download leaves no inflight marker behind.
        let err = cache.acquire("bafymissing").await.unwrap_err();
        assert!(matches!(err, DaemonError::ModelFetch(_)));
    }

    #[tokio::test]
    async fn lru_eviction_frees_unreferenced_entries() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(20, dir.path(), &gw);
        let a = store_model(&gw, b"aaaaaaaaaa"); // 10 bytes
        let b = store_model(&gw, b"bbbbbbbbbb"); // 10 bytes
        let c = store_model(&gw, b"cccccccccc"); // 10 bytes

        drop(cache.acquire(&a).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        drop(cache.acquire(&b).await.unwrap());

        // Inserting c exceeds the budget; a is the LRU victim.
        let _c = cache.acquire(&c).await.unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert!(cache.total_bytes() <= 20);
    }

    #[tokio::test]
    async fn referenced_entries_are_not_evictable() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(20, dir.path(), &gw);
        let a = store_model(&gw, b"aaaaaaaaaa");
        let b = store_model(&gw, b"bbbbbbbbbb");
        let c = store_model(&gw, b"cccccccccc");

        // Budget exactly full, every byte referenced.
        let _lease_a = cache.acquire(&a).await.unwrap();
        let _lease_b = cache.acquire(&b).await.unwrap();

        let err = cache.acquire(&c).await.unwrap_err();
        assert!(matches!(err, DaemonError::CacheFull));
        assert_eq!(cache.total_bytes(), 20);
    }

    #[tokio::test]
    async fn artifact_larger_than_budget_is_cache_full() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(4, dir.path(), &gw);
        let big = store_model(&gw, b"too-big-for-the-budget");

        let err = cache.acquire(&big).await.unwrap_err();
        assert!(matches!(err, DaemonError::CacheFull));
    }

    #[tokio::test]
    async fn concurrent_acquires_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let cache = cache_with(1024, dir.path(), &gw);
        let model = store_model(&gw, b"shared-weights");

        let (first, second) = tokio::join!(cache.acquire(&model), cache.acquire(&model));
        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(cache.total_bytes(), 14);
        assert_eq!(cache.cached_models().len(), 1);
    }
}
