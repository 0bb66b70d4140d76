//! Resource accounting: pessimistic, atomic reservation of the node's
//! declared CPU, memory, and accelerator budgets.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleet_types::config::{ResourceBudget, WorkReservation};
use fleet_types::node::NodeLoad;

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    cpu: f64,
    memory_bytes: u64,
    accelerator_slots: u32,
    workers: u32,
}

pub struct ResourceAccountant {
    budget: ResourceBudget,
    usage: Mutex<Usage>,
    released: Notify,
}

impl ResourceAccountant {
    pub fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            usage: Mutex::new(Usage::default()),
            released: Notify::new(),
        }
    }

    /// Whether a reservation would currently succeed. The queue admits on
    /// this; the dispatcher still reserves for real before starting work.
    pub fn has_headroom(&self, req: &WorkReservation) -> bool {
        let usage = self.usage.lock().expect("usage lock poisoned");
        self.fits(&usage, req)
    }

    fn fits(&self, usage: &Usage, req: &WorkReservation) -> bool {
        usage.workers < self.budget.max_workers
            && usage.cpu + req.cpu <= self.budget.cpu
            && usage.memory_bytes + req.memory_bytes <= self.budget.memory_bytes
            && usage.accelerator_slots + req.accelerator_slots <= self.budget.accelerator_slots
    }

    /// Reserve atomically, or return `None` when over budget.
    pub fn try_reserve(self: &Arc<Self>, req: WorkReservation) -> Option<Reservation> {
        let mut usage = self.usage.lock().expect("usage lock poisoned");
        if !self.fits(&usage, &req) {
            return None;
        }
        usage.cpu += req.cpu;
        usage.memory_bytes += req.memory_bytes;
        usage.accelerator_slots += req.accelerator_slots;
        usage.workers += 1;
        debug!(workers = usage.workers, "resources reserved");
        Some(Reservation {
            accountant: Arc::clone(self),
            req,
            released: false,
        })
    }

    /// Reserve, waiting for running workers to release if necessary.
    /// Returns `None` only when cancelled.
    pub async fn reserve(
        self: &Arc<Self>,
        req: WorkReservation,
        cancel: &CancellationToken,
    ) -> Option<Reservation> {
        loop {
            if let Some(reservation) = self.try_reserve(req.clone()) {
                return Some(reservation);
            }
            tokio::select! {
                _ = self.released.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn release(&self, req: &WorkReservation) {
        let mut usage = self.usage.lock().expect("usage lock poisoned");
        usage.cpu = (usage.cpu - req.cpu).max(0.0);
        usage.memory_bytes = usage.memory_bytes.saturating_sub(req.memory_bytes);
        usage.accelerator_slots = usage
            .accelerator_slots
            .saturating_sub(req.accelerator_slots);
        usage.workers = usage.workers.saturating_sub(1);
        drop(usage);
        self.released.notify_waiters();
    }

    /// Reserved fractions for heartbeats.
    pub fn load(&self) -> NodeLoad {
        let usage = self.usage.lock().expect("usage lock poisoned");
        let frac = |used: f64, total: f64| if total > 0.0 { (used / total).min(1.0) } else { 0.0 };
        NodeLoad {
            active_jobs: usage.workers,
            queued_jobs: 0,
            cpu_reserved: frac(usage.cpu, self.budget.cpu),
            memory_reserved: frac(usage.memory_bytes as f64, self.budget.memory_bytes as f64),
            slots_reserved: frac(
                f64::from(usage.accelerator_slots),
                f64::from(self.budget.accelerator_slots),
            ),
        }
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }
}

/// A held reservation. Releases on [`Reservation::release`] or on drop, so
/// a panicking worker task still gives its resources back.
pub struct Reservation {
    accountant: Arc<ResourceAccountant>,
    req: WorkReservation,
    released: bool,
}

impl Reservation {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.accountant.release(&self.req);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(max_workers: u32) -> Arc<ResourceAccountant> {
        Arc::new(ResourceAccountant::new(ResourceBudget {
            cpu: 2.0,
            memory_bytes: 1024,
            accelerator_slots: 1,
            max_workers,
        }))
    }

    fn small() -> WorkReservation {
        WorkReservation {
            cpu: 1.0,
            memory_bytes: 512,
            accelerator_slots: 0,
        }
    }

    #[test]
    fn reserve_until_budget_exhausted() {
        let accountant = accountant(8);
        let first = accountant.try_reserve(small()).unwrap();
        let _second = accountant.try_reserve(small()).unwrap();
        // CPU and memory are both fully reserved now.
        assert!(accountant.try_reserve(small()).is_none());

        first.release();
        assert!(accountant.try_reserve(small()).is_some());
    }

    #[test]
    fn worker_count_caps_reservations() {
        let accountant = accountant(1);
        let _first = accountant
            .try_reserve(WorkReservation {
                cpu: 0.1,
                memory_bytes: 1,
                accelerator_slots: 0,
            })
            .unwrap();
        assert!(accountant
            .try_reserve(WorkReservation {
                cpu: 0.1,
                memory_bytes: 1,
                accelerator_slots: 0,
            })
            .is_none());
    }

    #[test]
    fn drop_releases() {
        let accountant = accountant(8);
        {
            let _reservation = accountant.try_reserve(small()).unwrap();
            let _second = accountant.try_reserve(small()).unwrap();
            assert!(!accountant.has_headroom(&small()));
        }
        assert!(accountant.has_headroom(&small()));
    }

    #[test]
    fn load_reports_fractions() {
        let accountant = accountant(8);
        let _reservation = accountant.try_reserve(small()).unwrap();
        let load = accountant.load();
        assert_eq!(load.active_jobs, 1);
        assert!((load.cpu_reserved - 0.5).abs() < 1e-12);
        assert!((load.memory_reserved - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn reserve_waits_for_release() {
        let accountant = accountant(1);
        let held = accountant.try_reserve(small()).unwrap();

        let waiter = {
            let accountant = Arc::clone(&accountant);
            tokio::spawn(async move {
                accountant
                    .reserve(small(), &CancellationToken::new())
                    .await
                    .is_some()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        held.release();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn reserve_cancels_cleanly() {
        let accountant = accountant(1);
        let _held = accountant.try_reserve(small()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(accountant.reserve(small(), &cancel).await.is_none());
    }
}
