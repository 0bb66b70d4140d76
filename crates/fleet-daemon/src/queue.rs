//! Node-local work queue: three priority bands, FIFO within each, a single
//! consumer, and admission control at the door.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleet_types::config::WorkReservation;
use fleet_types::job::Priority;
use fleet_types::work::WorkItem;

use crate::error::{DaemonError, Result};
use crate::resources::ResourceAccountant;

#[derive(Default)]
struct Bands {
    high: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    low: VecDeque<WorkItem>,
}

impl Bands {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn band(&mut self, priority: Priority) -> &mut VecDeque<WorkItem> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

pub struct WorkQueue {
    max_size: usize,
    per_work: WorkReservation,
    accountant: Arc<ResourceAccountant>,
    bands: Mutex<Bands>,
    available: Notify,
}

impl WorkQueue {
    pub fn new(
        max_size: usize,
        per_work: WorkReservation,
        accountant: Arc<ResourceAccountant>,
    ) -> Self {
        Self {
            max_size,
            per_work,
            accountant,
            bands: Mutex::new(Bands::default()),
            available: Notify::new(),
        }
    }

    /// Admit a work item iff the queue has room and the accountant has
    /// headroom right now; otherwise refuse with backpressure. The
    /// orchestrator treats backpressure as "try another node", never as a
    /// job failure.
    pub fn enqueue(&self, item: WorkItem) -> Result<()> {
        let mut bands = self.bands.lock().expect("queue lock poisoned");
        if bands.len() >= self.max_size {
            return Err(DaemonError::Backpressure(format!(
                "queue full ({} items)",
                self.max_size
            )));
        }
        if !self.accountant.has_headroom(&self.per_work) {
            return Err(DaemonError::Backpressure("no resource headroom".into()));
        }
        debug!(work_id = %item.id, priority = ?item.priority, "work enqueued");
        bands.band(item.priority).push_back(item);
        drop(bands);
        self.available.notify_one();
        Ok(())
    }

    /// Pop the highest-priority ready item, oldest first within a band.
    pub fn pop(&self) -> Option<WorkItem> {
        self.bands.lock().expect("queue lock poisoned").pop()
    }

    /// Await the next item; `None` once cancelled.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Drop a queued item by id (tombstoned work). Returns true if it was
    /// still waiting here.
    pub fn remove(&self, work_id: &str) -> bool {
        let mut bands = self.bands.lock().expect("queue lock poisoned");
        if let Some(pos) = bands.high.iter().position(|item| item.id == work_id) {
            bands.high.remove(pos);
            return true;
        }
        if let Some(pos) = bands.normal.iter().position(|item| item.id == work_id) {
            bands.normal.remove(pos);
            return true;
        }
        if let Some(pos) = bands.low.iter().position(|item| item.id == work_id) {
            bands.low.remove(pos);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.bands.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_types::config::ResourceBudget;

    fn queue(max_size: usize) -> WorkQueue {
        WorkQueue::new(
            max_size,
            WorkReservation::default(),
            Arc::new(ResourceAccountant::new(ResourceBudget::default())),
        )
    }

    fn item(id: &str, priority: Priority) -> WorkItem {
        WorkItem {
            id: id.into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            model_id: "m1".into(),
            input: None,
            data_selector: None,
            priority,
            timeout_secs: 30,
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn priority_bands_pop_in_order() {
        let queue = queue(10);
        queue.enqueue(item("low-1", Priority::Low)).unwrap();
        queue.enqueue(item("norm-1", Priority::Normal)).unwrap();
        queue.enqueue(item("high-1", Priority::High)).unwrap();
        queue.enqueue(item("norm-2", Priority::Normal)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|i| i.id)).collect();
        assert_eq!(order, ["high-1", "norm-1", "norm-2", "low-1"]);
    }

    #[test]
    fn full_queue_backpressures() {
        let queue = queue(2);
        queue.enqueue(item("a", Priority::Normal)).unwrap();
        queue.enqueue(item("b", Priority::Normal)).unwrap();
        let err = queue.enqueue(item("c", Priority::Normal)).unwrap_err();
        assert!(matches!(err, DaemonError::Backpressure(_)));
    }

    #[test]
    fn no_headroom_backpressures_even_when_idle() {
        let accountant = Arc::new(ResourceAccountant::new(ResourceBudget {
            max_workers: 1,
            ..Default::default()
        }));
        let running = accountant.try_reserve(WorkReservation::default()).unwrap();
        let queue = WorkQueue::new(10, WorkReservation::default(), Arc::clone(&accountant));

        // A saturated node refuses work outright, backlog or not.
        let err = queue.enqueue(item("a", Priority::Normal)).unwrap_err();
        assert!(matches!(err, DaemonError::Backpressure(_)));

        // Headroom back means admission resumes.
        running.release();
        queue.enqueue(item("a", Priority::Normal)).unwrap();
    }

    #[test]
    fn remove_tombstoned_item() {
        let queue = queue(10);
        queue.enqueue(item("a", Priority::Normal)).unwrap();
        queue.enqueue(item("b", Priority::Low)).unwrap();

        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_enqueue() {
        let queue = Arc::new(queue(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.recv(&cancel).await.map(|i| i.id) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.enqueue(item("a", Priority::Normal)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "a");
    }

    #[tokio::test]
    async fn recv_returns_none_on_cancel() {
        let queue = queue(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.recv(&cancel).await.is_none());
    }
}
