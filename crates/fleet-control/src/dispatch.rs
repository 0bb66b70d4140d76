//! Work dispatch and response correlation.
//!
//! Dispatches go out on `work.dispatch`; acks come back on the same topic
//! and partial results on `results.ready`. A router task matches both to
//! per-work-item channels registered at dispatch time, so an executor just
//! awaits its [`WorkHandle`]. Responses for forgotten (cancelled) work items
//! are dropped on the floor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fleet_state::StateGateway;
use fleet_types::config::TopicConfig;
use fleet_types::work::{AckStatus, PartialResult, WorkAck, WorkItem, WorkMessage};
use fleet_types::FailureKind;

pub const KIND_WORK_DISPATCH: &str = "work-dispatch";
pub const KIND_WORK_ACK: &str = "work-ack";
pub const KIND_PARTIAL_RESULT: &str = "partial-result";

/// The executor's side of one in-flight work item.
pub struct WorkHandle {
    pub work_id: String,
    pub node_id: String,
    ack_rx: Option<oneshot::Receiver<WorkAck>>,
    result_rx: Option<oneshot::Receiver<PartialResult>>,
}

impl WorkHandle {
    /// Wait for the target node's ack. A silent node counts as unavailable.
    pub async fn await_ack(&mut self, timeout: Duration) -> Result<AckStatus, FailureKind> {
        let rx = self
            .ack_rx
            .take()
            .ok_or_else(|| FailureKind::Internal("ack already awaited".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack.status),
            Ok(Err(_)) => Err(FailureKind::NodeUnavailable(self.node_id.clone())),
            Err(_) => Err(FailureKind::NodeUnavailable(self.node_id.clone())),
        }
    }

    /// Wait for the partial result, up to the work item's deadline.
    pub async fn await_result(&mut self, timeout: Duration) -> Result<PartialResult, FailureKind> {
        let rx = self
            .result_rx
            .take()
            .ok_or_else(|| FailureKind::Internal("result already awaited".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(partial)) => Ok(partial),
            Ok(Err(_)) => Err(FailureKind::NodeUnavailable(self.node_id.clone())),
            Err(_) => Err(FailureKind::Timeout),
        }
    }
}

/// Pending-response tables plus the publish side of dispatch.
pub struct WorkDispatcher {
    gateway: Arc<StateGateway>,
    topics: TopicConfig,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<WorkAck>>>,
    pending_results: Mutex<HashMap<String, oneshot::Sender<PartialResult>>>,
}

impl WorkDispatcher {
    pub fn new(gateway: Arc<StateGateway>, topics: TopicConfig) -> Self {
        Self {
            gateway,
            topics,
            pending_acks: Mutex::new(HashMap::new()),
            pending_results: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a work item and return the handle its responses arrive on.
    ///
    /// Both channels are registered before the publish so a fast node can
    /// never race its response past us.
    pub async fn dispatch(&self, item: WorkItem) -> Result<WorkHandle, FailureKind> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut acks = self.pending_acks.lock().expect("dispatcher lock poisoned");
            acks.insert(item.id.clone(), ack_tx);
        }
        {
            let mut results = self
                .pending_results
                .lock()
                .expect("dispatcher lock poisoned");
            results.insert(item.id.clone(), result_tx);
        }

        let handle = WorkHandle {
            work_id: item.id.clone(),
            node_id: item.node_id.clone(),
            ack_rx: Some(ack_rx),
            result_rx: Some(result_rx),
        };

        if let Err(e) = self
            .gateway
            .publish(
                &self.topics.work_dispatch,
                KIND_WORK_DISPATCH,
                &WorkMessage::Dispatch(item),
            )
            .await
        {
            self.forget(&handle.work_id);
            return Err(FailureKind::Internal(format!("dispatch publish: {e}")));
        }
        Ok(handle)
    }

    /// Drop the pending channels for a work item; any late response for it
    /// is discarded by the router.
    pub fn forget(&self, work_id: &str) {
        self.pending_acks
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(work_id);
        self.pending_results
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(work_id);
    }

    fn route_ack(&self, ack: WorkAck) {
        let sender = self
            .pending_acks
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(&ack.work_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!(work_id = %ack.work_id, "ack for unknown work item dropped"),
        }
    }

    fn route_result(&self, partial: PartialResult) {
        let sender = self
            .pending_results
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(&partial.work_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(partial);
            }
            None => debug!(
                work_id = %partial.work_id,
                "partial for unknown or cancelled work item dropped"
            ),
        }
    }

    /// Route acks and partials to their waiting handles until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut dispatch_sub = match self.gateway.subscribe(&self.topics.work_dispatch).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "dispatcher cannot subscribe to work topic");
                return;
            }
        };
        let mut result_sub = match self.gateway.subscribe(&self.topics.results).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "dispatcher cannot subscribe to results topic");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                envelope = dispatch_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    if envelope.kind != KIND_WORK_ACK {
                        continue;
                    }
                    match envelope.open::<WorkMessage>() {
                        Ok(WorkMessage::Ack(ack)) => self.route_ack(ack),
                        Ok(_) => {}
                        Err(e) => warn!(%e, "undecodable work message"),
                    }
                }

                envelope = result_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    match envelope.open::<PartialResult>() {
                        Ok(partial) => self.route_result(partial),
                        Err(e) => warn!(%e, "undecodable partial result"),
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
    use chrono::Utc;
    use fleet_state::LocalBus;
    use fleet_types::config::StateConfig;
    use fleet_types::job::Priority;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            id: id.into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            model_id: "m1".into(),
            input: None,
            data_selector: None,
            priority: Priority::Normal,
            timeout_secs: 5,
            issued_at: Utc::now(),
        }
    }

    fn dispatcher(dir: &std::path::Path) -> Arc<WorkDispatcher> {
        let cfg = StateConfig {
            data_dir: dir.to_path_buf(),
        };
        let gateway =
            Arc::new(StateGateway::new(&cfg, "replica-test", Arc::new(LocalBus::new())).unwrap());
        Arc::new(WorkDispatcher::new(gateway, TopicConfig::default()))
    }

    #[tokio::test]
    async fn ack_and_result_reach_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));
        tokio::task::yield_now().await;

        let mut handle = dispatcher.dispatch(item("work-1")).await.unwrap();

        dispatcher.route_ack(WorkAck {
            work_id: "work-1".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            status: AckStatus::Accepted,
        });
        assert_eq!(
            handle.await_ack(Duration::from_secs(1)).await.unwrap(),
            AckStatus::Accepted
        );

        dispatcher.route_result(PartialResult {
            work_id: "work-1".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            output: Some("bafyout".into()),
            elapsed_ms: 3,
            error: None,
        });
        let partial = handle.await_result(Duration::from_secs(1)).await.unwrap();
        assert!(partial.is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn silent_node_times_out_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let mut handle = dispatcher.dispatch(item("work-2")).await.unwrap();
        let err = handle.await_ack(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, FailureKind::NodeUnavailable(_)));
    }

    #[tokio::test]
    async fn forgotten_work_drops_late_results() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let mut handle = dispatcher.dispatch(item("work-3")).await.unwrap();
        dispatcher.forget("work-3");

        // The late partial has nowhere to go; the handle sees a closed channel.
        dispatcher.route_result(PartialResult {
            work_id: "work-3".into(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            output: Some("bafyout".into()),
            elapsed_ms: 3,
            error: None,
        });
        let err = handle
            .await_result(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FailureKind::NodeUnavailable(_)));
    }
}
