//! Daemon-level flow: dispatch over the bus, ack, execute, publish the
//! partial result.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_daemon::NodeDaemon;
use fleet_state::{LocalBus, StateGateway};
use fleet_types::config::{DaemonConfig, StateConfig, TopicConfig};
use fleet_types::job::Priority;
use fleet_types::work::{
    new_work_id, AckStatus, CancelMessage, PartialResult, WorkItem, WorkMessage, WorkOutput,
};

struct Harness {
    gateway: Arc<StateGateway>,
    topics: TopicConfig,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(dir: &std::path::Path, script: &str) -> Self {
        let bus = Arc::new(LocalBus::new());
        let state_cfg = StateConfig {
            data_dir: dir.to_path_buf(),
        };
        let orchestrator_gw = Arc::new(
            StateGateway::new(&state_cfg, "replica-test", Arc::clone(&bus) as Arc<dyn fleet_state::Bus>)
                .unwrap(),
        );
        let daemon_gw = Arc::new(
            StateGateway::new(&state_cfg, "node-a", Arc::clone(&bus) as Arc<dyn fleet_state::Bus>)
                .unwrap(),
        );

        let mut cfg = DaemonConfig::default();
        cfg.node_id = "node-a".into();
        cfg.heartbeat_interval_secs = 1;
        cfg.cache_dir = dir.join("cache");
        cfg.cache_budget_bytes = 1024 * 1024;
        cfg.prewarm.enabled = false;
        cfg.worker.program = "sh".into();
        cfg.worker.args = vec!["-c".into(), script.into()];

        let cancel = CancellationToken::new();
        let daemon = NodeDaemon::new(cfg, daemon_gw).unwrap();
        daemon.start(&cancel);
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            gateway: orchestrator_gw,
            topics: TopicConfig::default(),
            cancel,
        }
    }

    fn item(&self, model_id: &str) -> WorkItem {
        WorkItem {
            id: new_work_id(),
            job_id: "job-1".into(),
            node_id: "node-a".into(),
            model_id: model_id.to_string(),
            input: None,
            data_selector: None,
            priority: Priority::Normal,
            timeout_secs: 10,
            issued_at: chrono::Utc::now(),
        }
    }

    async fn dispatch(&self, item: &WorkItem) {
        self.gateway
            .publish(
                &self.topics.work_dispatch,
                "work-dispatch",
                &WorkMessage::Dispatch(item.clone()),
            )
            .await
            .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_is_acked_and_result_published() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::start(
        dir.path(),
        r#"cat > /dev/null; printf '{"Vector":[2.5]}'"#,
    )
    .await;

    let model = harness.gateway.blobs().put(b"weights").unwrap();
    let item = harness.item(&model);

    let mut acks = harness
        .gateway
        .subscribe(&harness.topics.work_dispatch)
        .await
        .unwrap();
    let mut results = harness
        .gateway
        .subscribe(&harness.topics.results)
        .await
        .unwrap();

    harness.dispatch(&item).await;

    // First the accept...
    let ack = loop {
        let env = tokio::time::timeout(Duration::from_secs(5), acks.recv())
            .await
            .unwrap()
            .unwrap();
        if env.kind == "work-ack" {
            if let WorkMessage::Ack(ack) = env.open().unwrap() {
                break ack;
            }
        }
    };
    assert_eq!(ack.work_id, item.id);
    assert_eq!(ack.status, AckStatus::Accepted);

    // ...then the partial.
    let env = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    let partial: PartialResult = env.open().unwrap();
    assert_eq!(partial.work_id, item.id);
    assert!(partial.is_ok());
    let output: WorkOutput = harness
        .gateway
        .get_payload(partial.output.as_deref().unwrap())
        .unwrap();
    assert_eq!(output, WorkOutput::Vector(vec![2.5]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_model_reports_fetch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::start(dir.path(), r#"cat > /dev/null; printf '{"Vector":[1.0]}'"#).await;

    let item = harness.item("bafynowhere");
    let mut results = harness
        .gateway
        .subscribe(&harness.topics.results)
        .await
        .unwrap();
    harness.dispatch(&item).await;

    let env = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    let partial: PartialResult = env.open().unwrap();
    assert!(!partial.is_ok());
    assert!(matches!(
        partial.error,
        Some(fleet_types::FailureKind::ModelFetchFailed(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tombstoned_running_work_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    // Slow worker so the tombstone lands while it runs.
    let harness = Harness::start(
        dir.path(),
        r#"cat > /dev/null; sleep 2; printf '{"Vector":[1.0]}'"#,
    )
    .await;

    let model = harness.gateway.blobs().put(b"weights").unwrap();
    let item = harness.item(&model);
    let mut results = harness
        .gateway
        .subscribe(&harness.topics.results)
        .await
        .unwrap();

    harness.dispatch(&item).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness
        .gateway
        .publish(
            &harness.topics.job_cancel,
            "work-tombstone",
            &CancelMessage::Tombstone {
                job_id: item.job_id.clone(),
                work_ids: vec![item.id.clone()],
            },
        )
        .await
        .unwrap();

    // No partial for the tombstoned item arrives.
    let got = tokio::time::timeout(Duration::from_secs(4), results.recv()).await;
    assert!(got.is_err(), "tombstoned work still published a result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatches_for_other_nodes_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::start(dir.path(), r#"cat > /dev/null; printf '{"Vector":[1.0]}'"#).await;

    let model = harness.gateway.blobs().put(b"weights").unwrap();
    let mut item = harness.item(&model);
    item.node_id = "node-z".into();

    let mut acks = harness
        .gateway
        .subscribe(&harness.topics.work_dispatch)
        .await
        .unwrap();
    harness.dispatch(&item).await;

    // Only the dispatch itself crosses the topic; no ack follows.
    let first = acks.recv().await.unwrap();
    assert_eq!(first.kind, "work-dispatch");
    let next = tokio::time::timeout(Duration::from_millis(500), acks.recv()).await;
    assert!(next.is_err());
}
