//! Job lifecycle management.
//!
//! The manager owns the per-job state machines. Every mutation of a `Job`
//! happens under that job's own lock (the per-job exclusive region), is
//! persisted through the StateGateway, and is published on `jobs.updates`
//! with a per-job sequence number before anything else observes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;
use fleet_types::config::ControlConfig;
use fleet_types::error::CancelOutcome;
use fleet_types::job::{new_job_id, Job, JobEvent, JobId, JobSpec, JobState, Priority};
use fleet_types::work::{CancelMessage, PartialStatus};
use fleet_types::FailureKind;

use crate::dispatch::WorkDispatcher;
use crate::executor::{
    ExecOutcome, ExecutorContext, ExecutorEvent, ExecutorEventKind, PatternExecutor,
};
use crate::ratelimit::RateLimiter;
use crate::registry::NodeRegistry;
use crate::selector::NodeSelector;

pub const KIND_JOB_EVENT: &str = "job-event";

// ── Views ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub pattern: String,
    pub progress: Progress,
    pub error: Option<FailureKind>,
    pub per_node: Vec<PartialStatus>,
    /// Set while this replica only forwards for the real owner.
    pub forwarded_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResultInfo {
    pub handle: String,
    pub nodes_used: Vec<String>,
    pub total_elapsed_ms: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Ready(ResultInfo),
    NotReady,
    Failed {
        kind: FailureKind,
        /// Diagnostic payload, e.g. consensus votes behind a review failure.
        attachment: Option<String>,
    },
    NotFound,
}

/// Sent to the peer coordinator when a submit should be offered away.
#[derive(Debug)]
pub struct HandoffRequest {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub owner: String,
    pub priority: Priority,
    pub cost_ceiling: Option<f64>,
}

// ── Internals ────────────────────────────────────────────────────────────────

struct JobCell {
    job: Job,
    /// Per-job event sequence, incremented on every published transition.
    seq: u64,
    forwarded_to: Option<String>,
    forwarded_at: Option<Instant>,
    terminal_at: Option<Instant>,
}

#[derive(Clone)]
struct JobEntry {
    cell: Arc<tokio::sync::Mutex<JobCell>>,
    cancel: CancellationToken,
}

struct ManagerInner {
    cfg: ControlConfig,
    gateway: Arc<StateGateway>,
    registry: Arc<NodeRegistry>,
    ctx: Arc<ExecutorContext>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    active_jobs: AtomicU32,
    exec_sem: Arc<Semaphore>,
    limiter: Mutex<RateLimiter>,
    events_tx: mpsc::UnboundedSender<ExecutorEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ExecutorEvent>>>,
    handoff_tx: Option<mpsc::Sender<HandoffRequest>>,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(
        cfg: ControlConfig,
        gateway: Arc<StateGateway>,
        registry: Arc<NodeRegistry>,
        dispatcher: Arc<WorkDispatcher>,
        handoff_tx: Option<mpsc::Sender<HandoffRequest>>,
    ) -> Self {
        let selector = Arc::new(NodeSelector::new(
            Arc::clone(&registry),
            cfg.score_weights,
        ));
        let ctx = Arc::new(ExecutorContext {
            replica_id: cfg.replica_id.clone(),
            cfg: cfg.clone(),
            gateway: Arc::clone(&gateway),
            registry: Arc::clone(&registry),
            selector,
            dispatcher,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                exec_sem: Arc::new(Semaphore::new(cfg.max_concurrent_executors)),
                limiter: Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute)),
                cfg,
                gateway,
                registry,
                ctx,
                jobs: Mutex::new(HashMap::new()),
                active_jobs: AtomicU32::new(0),
                events_tx,
                events_rx: tokio::sync::Mutex::new(Some(events_rx)),
                handoff_tx,
            }),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.cfg.replica_id
    }

    pub fn active_count(&self) -> u32 {
        self.inner.active_jobs.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> u32 {
        self.inner.cfg.local_capacity
    }

    pub fn load_fraction(&self) -> f64 {
        f64::from(self.active_count()) / f64::from(self.capacity().max(1))
    }

    // ── Submit ───────────────────────────────────────────────────────────

    /// Validate, persist, and start (or offer away) a new job.
    pub async fn submit(
        &self,
        spec: JobSpec,
        owner: &str,
        priority: Priority,
        cost_ceiling: Option<f64>,
    ) -> Result<JobId, FailureKind> {
        {
            let mut limiter = self.inner.limiter.lock().expect("limiter lock poisoned");
            if !limiter.allow(owner) {
                return Err(FailureKind::RateLimited);
            }
        }

        self.validate(&spec, cost_ceiling)?;

        let job_id = new_job_id();
        let job = Job::new(
            job_id.clone(),
            spec.clone(),
            owner.to_string(),
            priority,
            cost_ceiling,
        );

        let entry = JobEntry {
            cell: Arc::new(tokio::sync::Mutex::new(JobCell {
                job,
                seq: 0,
                forwarded_to: None,
                forwarded_at: None,
                terminal_at: None,
            })),
            cancel: CancellationToken::new(),
        };
        {
            let mut jobs = self.inner.jobs.lock().expect("jobs lock poisoned");
            jobs.insert(job_id.clone(), entry.clone());
        }
        self.inner.active_jobs.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self
            .inner
            .gateway
            .claim_ownership(&job_id, &self.inner.cfg.replica_id)
            .await
        {
            warn!(%job_id, %e, "ownership claim failed");
        }

        {
            let mut cell = entry.cell.lock().await;
            self.publish_state(&mut cell).await;
        }
        info!(%job_id, pattern = spec.pattern(), owner, "job submitted");

        // Load-aware handoff: above the threshold, offer the job to peers
        // instead of running it here.
        let over_threshold =
            self.load_fraction() > self.inner.cfg.handoff_load && self.inner.handoff_tx.is_some();
        if over_threshold {
            let request = HandoffRequest {
                job_id: job_id.clone(),
                spec,
                owner: owner.to_string(),
                priority,
                cost_ceiling,
            };
            let tx = self.inner.handoff_tx.as_ref().expect("checked above");
            if tx.send(request).await.is_err() {
                warn!(%job_id, "coordinator gone; executing locally");
                self.spawn_execution(&job_id);
            }
        } else {
            self.spawn_execution(&job_id);
        }

        Ok(job_id)
    }

    /// Submit-time validation against the spec and the live registry.
    fn validate(&self, spec: &JobSpec, cost_ceiling: Option<f64>) -> Result<(), FailureKind> {
        spec.validate_shape().map_err(FailureKind::BadSpec)?;

        for node_id in spec.referenced_nodes() {
            if !self.inner.registry.is_active(node_id) {
                return Err(FailureKind::BadSpec(format!(
                    "node {node_id} is not currently active"
                )));
            }
        }

        if let JobSpec::FanOut(fanout) = spec {
            let max = self.inner.registry.max_reputation();
            if fanout.min_reputation > max {
                return Err(FailureKind::BadSpec(format!(
                    "min_reputation {} exceeds the fleet maximum {max:.2}",
                    fanout.min_reputation
                )));
            }
        }

        // Advisory only: nothing meters cost at runtime.
        if let Some(ceiling) = cost_ceiling {
            let estimate =
                spec.initial_work_items() as f64 * self.inner.cfg.cost_per_work_item;
            if estimate > ceiling {
                return Err(FailureKind::BadSpec(format!(
                    "estimated cost {estimate:.2} exceeds ceiling {ceiling:.2}"
                )));
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn status(&self, job_id: &str) -> Option<JobStatusView> {
        let entry = self.entry(job_id)?;
        let cell = entry.cell.lock().await;
        let job = &cell.job;
        Some(JobStatusView {
            job_id: job.id.clone(),
            state: job.state,
            pattern: job.spec.pattern().to_string(),
            progress: Progress {
                completed: job.progress_completed,
                total: job.progress_total,
                percent: job.progress_percent(),
            },
            error: job.failure.clone(),
            per_node: job.partials.clone(),
            forwarded_to: cell.forwarded_to.clone(),
        })
    }

    pub async fn result(&self, job_id: &str) -> ResultOutcome {
        let Some(entry) = self.entry(job_id) else {
            return ResultOutcome::NotFound;
        };
        let cell = entry.cell.lock().await;
        let job = &cell.job;
        match job.state {
            JobState::Completed => {
                let handle = job.result.clone().unwrap_or_default();
                let elapsed = match (job.completed_at, job.started_at) {
                    (Some(done), Some(started)) => {
                        (done - started).num_milliseconds().max(0) as u64
                    }
                    _ => 0,
                };
                ResultOutcome::Ready(ResultInfo {
                    handle,
                    nodes_used: job
                        .partials
                        .iter()
                        .filter(|p| p.ok)
                        .map(|p| p.node_id.clone())
                        .collect(),
                    total_elapsed_ms: elapsed,
                    total_cost: f64::from(job.progress_total)
                        * self.inner.cfg.cost_per_work_item,
                })
            }
            JobState::Failed => ResultOutcome::Failed {
                kind: job
                    .failure
                    .clone()
                    .unwrap_or(FailureKind::Internal("failure kind missing".into())),
                attachment: job.result.clone(),
            },
            _ => ResultOutcome::NotReady,
        }
    }

    // ── Cancel ───────────────────────────────────────────────────────────

    /// Cancel a job. Terminal jobs reject the cancel; repeating a cancel on
    /// an already-cancelled job keeps returning `AlreadyTerminal`.
    pub async fn cancel(&self, job_id: &str) -> CancelOutcome {
        let Some(entry) = self.entry(job_id) else {
            return CancelOutcome::NotFound;
        };
        let mut cell = entry.cell.lock().await;
        if cell.job.state.is_terminal() {
            return CancelOutcome::AlreadyTerminal;
        }

        if let Some(owner) = cell.forwarded_to.clone() {
            // Not ours anymore: relay the cancel to the real owner.
            drop(cell);
            self.inner
                .gateway
                .publish_best_effort(
                    &self.inner.cfg.topics.job_cancel,
                    "cancel-job",
                    &CancelMessage::CancelJob {
                        job_id: job_id.to_string(),
                    },
                )
                .await;
            debug!(%job_id, %owner, "cancel relayed to owning replica");
            return CancelOutcome::Ack;
        }

        entry.cancel.cancel();
        if cell.job.transition(JobState::Cancelled).is_ok() {
            self.on_terminal(&mut cell);
            self.publish_state(&mut cell).await;
        }
        info!(%job_id, "job cancelled");
        CancelOutcome::Ack
    }

    // ── Execution plumbing ───────────────────────────────────────────────

    /// Spawn the pattern executor for a job this replica owns.
    pub fn spawn_execution(&self, job_id: &str) {
        let Some(entry) = self.entry(job_id) else {
            warn!(%job_id, "spawn requested for unknown job");
            return;
        };
        let manager = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let permit = manager
                .inner
                .exec_sem
                .clone()
                .acquire_owned()
                .await
                .expect("executor semaphore never closes");

            let (spec, priority) = {
                let cell = entry.cell.lock().await;
                (cell.job.spec.clone(), cell.job.priority)
            };
            let executor = Arc::new(PatternExecutor::new(
                Arc::clone(&manager.inner.ctx),
                job_id.clone(),
                spec,
                priority,
                entry.cancel.clone(),
                manager.inner.events_tx.clone(),
            ));
            let outcome = executor.run().await;
            drop(permit);
            manager.apply_outcome(&job_id, outcome).await;
        });
    }

    /// Take over a job another replica offered away. Ownership is already
    /// recorded for this replica by the time the grant arrives.
    pub async fn adopt(
        &self,
        job_id: JobId,
        spec: JobSpec,
        owner: String,
        priority: Priority,
        cost_ceiling: Option<f64>,
    ) {
        let job = Job::new(job_id.clone(), spec, owner, priority, cost_ceiling);
        let entry = JobEntry {
            cell: Arc::new(tokio::sync::Mutex::new(JobCell {
                job,
                seq: 0,
                forwarded_to: None,
                forwarded_at: None,
                terminal_at: None,
            })),
            cancel: CancellationToken::new(),
        };
        {
            let mut jobs = self.inner.jobs.lock().expect("jobs lock poisoned");
            jobs.insert(job_id.clone(), entry.clone());
        }
        self.inner.active_jobs.fetch_add(1, Ordering::SeqCst);
        {
            let mut cell = entry.cell.lock().await;
            self.publish_state(&mut cell).await;
        }
        info!(%job_id, "job adopted from peer");
        self.spawn_execution(&job_id);
    }

    /// Record that a job now runs on `to_replica`; this replica keeps a
    /// forwarding entry for the grace period.
    pub async fn mark_forwarded(&self, job_id: &str, to_replica: &str) {
        if let Some(entry) = self.entry(job_id) {
            let mut cell = entry.cell.lock().await;
            cell.forwarded_to = Some(to_replica.to_string());
            cell.forwarded_at = Some(Instant::now());
            self.inner.active_jobs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn apply_outcome(&self, job_id: &str, outcome: ExecOutcome) {
        let Some(entry) = self.entry(job_id) else { return };
        let mut cell = entry.cell.lock().await;
        if cell.job.state.is_terminal() {
            // Typically a cancel that already won the race; late outcomes
            // are discarded.
            debug!(%job_id, "outcome after terminal state discarded");
            return;
        }

        match outcome {
            ExecOutcome::Completed(report) => {
                // A consensus job whose first acks all failed may complete
                // without ever signalling Started; keep the edges legal.
                if cell.job.state == JobState::Pending {
                    let _ = cell.job.transition(JobState::Running);
                    self.publish_state(&mut cell).await;
                }
                cell.job.result = report.result;
                cell.job.progress_completed =
                    (report.partials.iter().filter(|p| p.ok).count() as u32)
                        .min(cell.job.progress_total);
                cell.job.partials = report.partials;
                let _ = cell.job.transition(JobState::Completed);
            }
            ExecOutcome::Failed {
                kind,
                partials,
                attachment,
            } => {
                cell.job.failure = Some(kind);
                cell.job.partials = partials;
                cell.job.result = attachment;
                let _ = cell.job.transition(JobState::Failed);
            }
            ExecOutcome::Cancelled => {
                let _ = cell.job.transition(JobState::Cancelled);
            }
        }
        self.on_terminal(&mut cell);
        self.publish_state(&mut cell).await;

        let gateway = Arc::clone(&self.inner.gateway);
        let job_id = job_id.to_string();
        drop(cell);
        // Final state is published; the ownership entry can go.
        if let Err(e) = gateway.release_ownership(&job_id).await {
            warn!(%job_id, %e, "ownership release failed");
        }
    }

    fn on_terminal(&self, cell: &mut JobCell) {
        cell.terminal_at = Some(Instant::now());
        self.inner.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Persist the job and publish its transition event, under the cell
    /// lock so per-job events leave in state order.
    async fn publish_state(&self, cell: &mut JobCell) {
        cell.seq += 1;
        if let Err(e) = self.inner.gateway.put_payload(&cell.job) {
            warn!(job_id = %cell.job.id, %e, "job state persist failed");
        }
        let event = JobEvent {
            job_id: cell.job.id.clone(),
            state: cell.job.state,
            seq: cell.seq,
            owner: self.inner.cfg.replica_id.clone(),
            failure: cell.job.failure.clone(),
            result: cell.job.result.clone(),
            at: chrono::Utc::now(),
        };
        self.inner
            .gateway
            .publish_best_effort(&self.inner.cfg.topics.job_updates, KIND_JOB_EVENT, &event)
            .await;
    }

    fn entry(&self, job_id: &str) -> Option<JobEntry> {
        self.inner
            .jobs
            .lock()
            .expect("jobs lock poisoned")
            .get(job_id)
            .cloned()
    }

    // ── Background loop ──────────────────────────────────────────────────

    /// Consume executor events, mirror updates for forwarded jobs, honor
    /// relayed cancels, and purge expired entries. Runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .expect("manager run() started twice");

        let mut updates_sub = match self
            .inner
            .gateway
            .subscribe(&self.inner.cfg.topics.job_updates)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "manager cannot subscribe to job updates");
                return;
            }
        };
        let mut cancel_sub = match self
            .inner
            .gateway
            .subscribe(&self.inner.cfg.topics.job_cancel)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%e, "manager cannot subscribe to job cancels");
                return;
            }
        };
        let mut purge_tick = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_executor_event(event).await;
                }

                envelope = updates_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    if envelope.sender_id == self.inner.cfg.replica_id {
                        continue;
                    }
                    if let Ok(event) = envelope.open::<JobEvent>() {
                        self.mirror_remote_event(event).await;
                    }
                }

                envelope = cancel_sub.recv() => {
                    let Some(envelope) = envelope else { return };
                    if let Ok(CancelMessage::CancelJob { job_id }) = envelope.open() {
                        self.handle_relayed_cancel(&job_id).await;
                    }
                }

                _ = purge_tick.tick() => self.purge_expired(),
            }
        }
    }

    async fn handle_executor_event(&self, event: ExecutorEvent) {
        let Some(entry) = self.entry(&event.job_id) else { return };
        let mut cell = entry.cell.lock().await;
        match event.kind {
            ExecutorEventKind::Started => {
                if cell.job.state == JobState::Pending
                    && cell.job.transition(JobState::Running).is_ok()
                {
                    self.publish_state(&mut cell).await;
                }
            }
            ExecutorEventKind::PartialObserved(status) => {
                if !cell.job.state.is_terminal() {
                    cell.job.progress_completed =
                        (cell.job.progress_completed + 1).min(cell.job.progress_total);
                    cell.job.partials.push(status);
                }
            }
        }
    }

    /// Keep forwarded mirrors in sync with the owning replica's events.
    async fn mirror_remote_event(&self, event: JobEvent) {
        let Some(entry) = self.entry(&event.job_id) else { return };
        let mut cell = entry.cell.lock().await;
        if cell.forwarded_to.is_none() {
            return;
        }
        cell.job.state = event.state;
        cell.job.failure = event.failure;
        cell.job.result = event.result;
        if event.state.is_terminal() {
            cell.terminal_at = Some(Instant::now());
        }
    }

    async fn handle_relayed_cancel(&self, job_id: &str) {
        let owned = match self.entry(job_id) {
            Some(entry) => entry.cell.lock().await.forwarded_to.is_none(),
            None => false,
        };
        if owned {
            let _ = self.cancel(job_id).await;
        }
    }

    /// Drop terminal entries past their TTL and forwarding entries past the
    /// grace period.
    fn purge_expired(&self) {
        let ttl = Duration::from_secs(self.inner.cfg.terminal_ttl_secs);
        let grace = Duration::from_secs(self.inner.cfg.forwarding_grace_secs);
        let now = Instant::now();

        let mut jobs = self.inner.jobs.lock().expect("jobs lock poisoned");
        jobs.retain(|job_id, entry| {
            // Entries busy elsewhere are never purged this round.
            let Ok(cell) = entry.cell.try_lock() else {
                return true;
            };
            if let Some(at) = cell.forwarded_at {
                if now.duration_since(at) > grace {
                    debug!(%job_id, "forwarding entry expired");
                    return false;
                }
                return true;
            }
            match cell.terminal_at {
                Some(at) if now.duration_since(at) > ttl => {
                    debug!(%job_id, "terminal job purged");
                    false
                }
                _ => true,
            }
        });
    }
}
