//! Model pre-warming from access-frequency tracking.
//!
//! Every dispatch records an access; a periodic cycle eagerly caches the
//! models accessed often enough inside the window, most popular first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_types::config::PrewarmConfig;

use crate::cache::ModelCache;

/// Access timestamps kept per model; older entries beyond this are dropped.
const MAX_TRACKED_ACCESSES: usize = 100;

pub struct Prewarmer {
    cfg: PrewarmConfig,
    cache: Arc<ModelCache>,
    accesses: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Prewarmer {
    pub fn new(cfg: PrewarmConfig, cache: Arc<ModelCache>) -> Self {
        Self {
            cfg,
            cache,
            accesses: Mutex::new(HashMap::new()),
        }
    }

    /// Note that a work item asked for `model_id`.
    pub fn record_access(&self, model_id: &str) {
        let mut accesses = self.accesses.lock().expect("access log poisoned");
        let log = accesses.entry(model_id.to_string()).or_default();
        log.push_back(Instant::now());
        while log.len() > MAX_TRACKED_ACCESSES {
            log.pop_front();
        }
    }

    /// Models above the access threshold within the window, hottest first,
    /// capped at the per-cycle limit, already-cached ones skipped.
    fn candidates(&self, now: Instant) -> Vec<String> {
        let window = Duration::from_secs(self.cfg.window_secs);
        let accesses = self.accesses.lock().expect("access log poisoned");

        let mut hot: Vec<(String, usize)> = accesses
            .iter()
            .map(|(model_id, log)| {
                let recent = log
                    .iter()
                    .filter(|at| now.duration_since(**at) < window)
                    .count();
                (model_id.clone(), recent)
            })
            .filter(|(model_id, recent)| {
                *recent >= self.cfg.min_access_count && !self.cache.contains(model_id)
            })
            .collect();

        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hot.into_iter()
            .take(self.cfg.max_models)
            .map(|(model_id, _)| model_id)
            .collect()
    }

    /// Pre-warm cycle loop. Leases are dropped immediately: the point is
    /// populating the cache, not holding entries hot forever.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.cfg.enabled {
            debug!("pre-warming disabled");
            return;
        }
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    for model_id in self.candidates(Instant::now()) {
                        match self.cache.acquire(&model_id).await {
                            Ok(lease) => {
                                info!(%model_id, "model pre-warmed");
                                drop(lease);
                            }
                            Err(e) => warn!(%model_id, %e, "pre-warm failed"),
                        }
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{LocalBus, StateGateway};
    use fleet_types::config::StateConfig;

    fn prewarmer(min_access_count: usize, dir: &std::path::Path) -> (Prewarmer, Arc<StateGateway>) {
        let state_cfg = StateConfig {
            data_dir: dir.to_path_buf(),
        };
        let gateway =
            Arc::new(StateGateway::new(&state_cfg, "node-a", Arc::new(LocalBus::new())).unwrap());
        let cache = Arc::new(
            ModelCache::new(dir.join("cache"), 1024, Arc::clone(&gateway)).unwrap(),
        );
        let cfg = PrewarmConfig {
            enabled: true,
            min_access_count,
            window_secs: 3600,
            interval_secs: 3600,
            max_models: 2,
        };
        (Prewarmer::new(cfg, cache), gateway)
    }

    #[test]
    fn cold_models_below_threshold_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let (prewarmer, _gw) = prewarmer(3, dir.path());

        prewarmer.record_access("m1");
        prewarmer.record_access("m1");
        assert!(prewarmer.candidates(Instant::now()).is_empty());

        prewarmer.record_access("m1");
        assert_eq!(prewarmer.candidates(Instant::now()), vec!["m1".to_string()]);
    }

    #[test]
    fn hottest_models_come_first_and_cycle_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let (prewarmer, _gw) = prewarmer(1, dir.path());

        for _ in 0..5 {
            prewarmer.record_access("m-warm");
        }
        for _ in 0..9 {
            prewarmer.record_access("m-hot");
        }
        prewarmer.record_access("m-cool");

        // max_models = 2: the coolest candidate is left for a later cycle.
        assert_eq!(
            prewarmer.candidates(Instant::now()),
            vec!["m-hot".to_string(), "m-warm".to_string()]
        );
    }

    #[tokio::test]
    async fn cached_models_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (prewarmer, gw) = prewarmer(1, dir.path());

        let model = gw.blobs().put(b"weights").unwrap();
        prewarmer.record_access(&model);
        drop(prewarmer.cache.acquire(&model).await.unwrap());

        assert!(prewarmer.candidates(Instant::now()).is_empty());
    }
}
