//! Pattern execution: one executor per job, destroyed at termination.
//!
//! The executor holds its job id and a handle to the shared control-plane
//! components; it never holds the `Job` itself. It reports lifecycle
//! moments (initial dispatch accepted, partial observed) through an event
//! channel that the `JobManager` consumes, which keeps every state
//! transition inside the manager's per-job exclusive region.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_state::StateGateway;
use fleet_types::config::ControlConfig;
use fleet_types::job::{ConsensusSpec, FanOutSpec, JobId, JobSpec, PipelineSpec, Priority};
use fleet_types::work::{
    new_work_id, CancelMessage, PartialResult, PartialStatus, WorkItem, WorkOutput,
};
use fleet_types::FailureKind;

use crate::dispatch::WorkDispatcher;
use crate::fusion::{self, ConsensusOutcome, NumericPartial, Vote};
use crate::registry::NodeRegistry;
use crate::selector::{NodeSelector, SelectionFilter};

pub const KIND_TOMBSTONE: &str = "work-tombstone";

/// Vote weight for models the spec does not rate.
const DEFAULT_MODEL_REPUTATION: f64 = 0.5;

// ── Shared context ───────────────────────────────────────────────────────────

/// Everything an executor borrows from its replica.
pub struct ExecutorContext {
    pub replica_id: String,
    pub cfg: ControlConfig,
    pub gateway: Arc<StateGateway>,
    pub registry: Arc<NodeRegistry>,
    pub selector: Arc<NodeSelector>,
    pub dispatcher: Arc<WorkDispatcher>,
}

// ── Events to the manager ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ExecutorEventKind {
    /// The initial dispatch round was accepted; the job is running.
    Started,
    /// A work item resolved, one way or the other.
    PartialObserved(PartialStatus),
}

#[derive(Debug)]
pub struct ExecutorEvent {
    pub job_id: JobId,
    pub kind: ExecutorEventKind,
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ExecutionReport {
    /// Blob handle of the fused result.
    pub result: Option<String>,
    pub nodes_used: Vec<String>,
    pub partials: Vec<PartialStatus>,
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub enum ExecOutcome {
    Completed(ExecutionReport),
    Failed {
        kind: FailureKind,
        partials: Vec<PartialStatus>,
        /// Blob handle with diagnostic payload, e.g. the votes behind a
        /// `ReviewRequired`.
        attachment: Option<String>,
    },
    Cancelled,
}

/// Internal strategy result; `run` converts it into an [`ExecOutcome`].
enum ExecError {
    Cancelled,
    Failed {
        kind: FailureKind,
        partials: Vec<PartialStatus>,
        attachment: Option<String>,
    },
}

impl ExecError {
    fn failed(kind: FailureKind, partials: Vec<PartialStatus>) -> Self {
        Self::Failed {
            kind,
            partials,
            attachment: None,
        }
    }
}

/// Payload persisted for consensus jobs: the winner (when there is one)
/// plus every present vote, for diagnosis and review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub winner: Option<ConsensusOutcome>,
    pub votes: Vec<VoteRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRecord {
    pub model_id: String,
    pub label: String,
    pub weight: f64,
}

// ── PatternExecutor ──────────────────────────────────────────────────────────

pub struct PatternExecutor {
    ctx: Arc<ExecutorContext>,
    job_id: JobId,
    spec: JobSpec,
    priority: Priority,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ExecutorEvent>,
    /// Work items dispatched but not yet resolved, for cancel tombstones.
    outstanding: Mutex<HashSet<String>>,
    started_sent: AtomicBool,
}

impl PatternExecutor {
    pub fn new(
        ctx: Arc<ExecutorContext>,
        job_id: JobId,
        spec: JobSpec,
        priority: Priority,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Self {
        Self {
            ctx,
            job_id,
            spec,
            priority,
            cancel,
            events,
            outstanding: Mutex::new(HashSet::new()),
            started_sent: AtomicBool::new(false),
        }
    }

    /// Execute the job's pattern to completion, failure, or cancellation.
    pub async fn run(self: Arc<Self>) -> ExecOutcome {
        let started = Instant::now();
        let budget = Duration::from_secs(
            self.spec
                .timeout_secs()
                .min(self.ctx.cfg.default_job_timeout_secs)
                .max(1),
        );
        let deadline = started + budget;

        let spec = self.spec.clone();
        let result = match spec {
            JobSpec::FanOut(s) => Arc::clone(&self).run_fanout(&s, deadline).await,
            JobSpec::Consensus(s) => Arc::clone(&self).run_consensus(&s, deadline).await,
            JobSpec::Pipeline(s) => Arc::clone(&self).run_pipeline(&s, deadline).await,
        };

        match result {
            Ok(mut report) => {
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                info!(job_id = %self.job_id, elapsed_ms = report.elapsed_ms, "job completed");
                ExecOutcome::Completed(report)
            }
            Err(ExecError::Cancelled) => {
                self.tombstone_outstanding().await;
                info!(job_id = %self.job_id, "job cancelled");
                ExecOutcome::Cancelled
            }
            Err(ExecError::Failed {
                kind,
                partials,
                attachment,
            }) => {
                self.tombstone_outstanding().await;
                warn!(job_id = %self.job_id, failure = %kind, "job failed");
                ExecOutcome::Failed {
                    kind,
                    partials,
                    attachment,
                }
            }
        }
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    /// Same model on every pinned node, in parallel, fused at quorum.
    async fn run_fanout(
        self: Arc<Self>,
        spec: &FanOutSpec,
        deadline: Instant,
    ) -> Result<ExecutionReport, ExecError> {
        let n = spec.nodes.len();
        let quorum = n.div_ceil(2);

        let pinned = SelectionFilter {
            min_reputation: spec.min_reputation,
            allowlist: Some(spec.nodes.clone()),
            ..Default::default()
        };
        let selected = self
            .ctx
            .selector
            .select(&pinned, n)
            .map_err(|kind| ExecError::failed(kind, Vec::new()))?;

        // Substitutes for dispatch-time failures: any eligible node outside
        // the pinned set, best first.
        let unpinned = SelectionFilter {
            min_reputation: spec.min_reputation,
            ..Default::default()
        };
        let substitutes: VecDeque<String> = self
            .ctx
            .selector
            .candidates(&unpinned)
            .into_iter()
            .map(|r| r.node_id)
            .filter(|id| !spec.nodes.contains(id))
            .collect();
        let substitutes = Arc::new(Mutex::new(substitutes));

        // ── Dispatch round: one item per node, acks in parallel ──────────
        let mut ack_tasks: JoinSet<Result<crate::dispatch::WorkHandle, PartialStatus>> =
            JoinSet::new();
        for record in selected {
            let this = Arc::clone(&self);
            let substitutes = Arc::clone(&substitutes);
            let model_id = spec.model_id.clone();
            let data_selector = spec.data_selector.clone();
            let item_timeout = per_item_timeout(spec.timeout_secs, deadline);
            ack_tasks.spawn(async move {
                let item = this.make_item(
                    &record.node_id,
                    &model_id,
                    None,
                    Some(data_selector.clone()),
                    item_timeout,
                );
                let work_id = item.id.clone();
                match this.dispatch_accept(item).await {
                    Ok(handle) => Ok(handle),
                    Err(kind) if kind.is_dispatch_error() => {
                        // Backpressure means "try another node", not failure.
                        let substitute =
                            substitutes.lock().expect("pool lock poisoned").pop_front();
                        match substitute {
                            Some(node_id) => {
                                debug!(from = %record.node_id, to = %node_id, "substituting node");
                                let retry = this.make_item(
                                    &node_id,
                                    &model_id,
                                    None,
                                    Some(data_selector),
                                    item_timeout,
                                );
                                let retry_id = retry.id.clone();
                                this.dispatch_accept(retry).await.map_err(|kind| {
                                    ack_failure(&retry_id, &node_id, kind)
                                })
                            }
                            None => Err(ack_failure(&work_id, &record.node_id, kind)),
                        }
                    }
                    Err(kind) => Err(ack_failure(&work_id, &record.node_id, kind)),
                }
            });
        }

        let mut handles = Vec::new();
        let mut statuses: Vec<PartialStatus> = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ExecError::Cancelled),
                joined = ack_tasks.join_next() => match joined {
                    Some(Ok(Ok(handle))) => handles.push(handle),
                    Some(Ok(Err(status))) => statuses.push(status),
                    Some(Err(e)) => {
                        warn!(job_id = %self.job_id, %e, "ack task panicked");
                    }
                    None => break,
                }
            }
        }

        // Dispatch-phase gate: with fewer than `quorum` items accepted,
        // the completed-partials quorum below can never be met, so fail
        // straight from Pending. Otherwise signal Started — the manager
        // moves the job to Running on this signal and nowhere else.
        if handles.len() < quorum {
            return Err(ExecError::failed(FailureKind::QuorumLost, statuses));
        }
        self.signal_started();

        // ── Collect partials until all resolve or the deadline fires ─────
        let mut result_tasks: JoinSet<PartialResult> = JoinSet::new();
        for handle in handles {
            let this = Arc::clone(&self);
            let timeout = deadline.saturating_duration_since(Instant::now());
            result_tasks.spawn(async move { this.collect_result(handle, timeout).await });
        }

        let mut partials = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ExecError::Cancelled),
                joined = result_tasks.join_next() => match joined {
                    Some(Ok(partial)) => partials.push(partial),
                    Some(Err(e)) => warn!(job_id = %self.job_id, %e, "result task panicked"),
                    None => break,
                }
            }
        }
        statuses.extend(partials.iter().map(PartialStatus::from));

        // ── Decode and fuse ──────────────────────────────────────────────
        let mut numeric = Vec::new();
        for partial in partials.iter().filter(|p| p.is_ok()) {
            let handle = partial.output.as_deref().expect("ok partial has output");
            match self.ctx.gateway.get_payload::<WorkOutput>(handle) {
                Ok(WorkOutput::Vector(values)) => numeric.push(NumericPartial {
                    node_id: partial.node_id.clone(),
                    values,
                    reputation: self
                        .ctx
                        .registry
                        .get(&partial.node_id)
                        .map_or(DEFAULT_MODEL_REPUTATION, |r| r.reputation),
                }),
                Ok(_) => {
                    warn!(node_id = %partial.node_id, "non-numeric fan-out output discarded");
                }
                Err(e) => {
                    warn!(node_id = %partial.node_id, %e, "unreadable fan-out output discarded");
                }
            }
        }

        // Execution-phase quorum: `ceil(n/2)` completed, decodable
        // partials, counted only now that every item resolved or the
        // deadline fired.
        if numeric.len() < quorum {
            return Err(ExecError::failed(FailureKind::QuorumLost, statuses));
        }

        let mut fused = fusion::fuse(&numeric, spec.aggregation)
            .map_err(|kind| ExecError::failed(kind, statuses.clone()))?;

        if let Some(epsilon) = spec.epsilon {
            let sensitivity = spec.sensitivity.unwrap_or(1.0);
            let mut rng = StdRng::from_entropy();
            fusion::apply_laplace_noise(&mut fused, epsilon, sensitivity, &mut rng);
        }

        let nodes_used: Vec<String> = numeric.iter().map(|p| p.node_id.clone()).collect();
        let result = self
            .ctx
            .gateway
            .put_payload(&WorkOutput::Vector(fused))
            .map_err(|e| {
                ExecError::failed(FailureKind::Internal(e.to_string()), statuses.clone())
            })?;

        Ok(ExecutionReport {
            result: Some(result),
            nodes_used,
            partials: statuses,
            elapsed_ms: 0,
        })
    }

    // ── Consensus ────────────────────────────────────────────────────────

    /// Each model runs sequentially on one node; a failed model is simply
    /// an absent vote.
    async fn run_consensus(
        self: Arc<Self>,
        spec: &ConsensusSpec,
        deadline: Instant,
    ) -> Result<ExecutionReport, ExecError> {
        let mut statuses: Vec<PartialStatus> = Vec::new();
        let mut votes: Vec<Vote> = Vec::new();

        for model_id in &spec.model_ids {
            if self.cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let timeout = per_item_timeout(spec.timeout_secs, deadline);
            if timeout == 0 {
                // Past the global deadline: the remaining votes stay absent.
                break;
            }

            let item = self.make_item(
                &spec.node_id,
                model_id,
                None,
                Some(spec.data_selector.clone()),
                timeout,
            );
            let work_id = item.id.clone();
            let handle = match self.dispatch_accept(item).await {
                Ok(handle) => handle,
                Err(kind) => {
                    statuses.push(ack_failure(&work_id, &spec.node_id, kind));
                    continue;
                }
            };
            self.signal_started();

            let partial = self
                .collect_result(handle, Duration::from_secs(timeout))
                .await;
            let mut status = PartialStatus::from(&partial);

            if partial.is_ok() {
                let handle = partial.output.as_deref().expect("ok partial has output");
                match self.ctx.gateway.get_payload::<WorkOutput>(handle) {
                    Ok(WorkOutput::Label(label)) => votes.push(Vote {
                        model_id: model_id.clone(),
                        label,
                        weight: spec
                            .model_reputations
                            .get(model_id)
                            .copied()
                            .unwrap_or(DEFAULT_MODEL_REPUTATION),
                    }),
                    Ok(_) => {
                        status.ok = false;
                        status.error =
                            Some(FailureKind::Internal("consensus output is not a label".into()));
                    }
                    Err(e) => {
                        status.ok = false;
                        status.error = Some(FailureKind::Internal(e.to_string()));
                    }
                }
            }
            statuses.push(status);
        }

        let vote_records: Vec<VoteRecord> = votes
            .iter()
            .map(|v| VoteRecord {
                model_id: v.model_id.clone(),
                label: v.label.clone(),
                weight: v.weight,
            })
            .collect();

        match fusion::combine_votes(&votes, spec.consensus, spec.min_agreement) {
            Ok(outcome) => {
                let report = ConsensusReport {
                    winner: Some(outcome),
                    votes: vote_records,
                };
                let result = self.ctx.gateway.put_payload(&report).map_err(|e| {
                    ExecError::failed(FailureKind::Internal(e.to_string()), statuses.clone())
                })?;
                Ok(ExecutionReport {
                    result: Some(result),
                    nodes_used: vec![spec.node_id.clone()],
                    partials: statuses,
                    elapsed_ms: 0,
                })
            }
            Err(kind) => {
                // Attach the votes so a human (or the client) can see what
                // the models actually said.
                let report = ConsensusReport {
                    winner: None,
                    votes: vote_records,
                };
                let attachment = self.ctx.gateway.put_payload(&report).ok();
                Err(ExecError::Failed {
                    kind,
                    partials: statuses,
                    attachment,
                })
            }
        }
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    /// Strictly sequential steps; step N+1 consumes step N's output handle.
    async fn run_pipeline(
        self: Arc<Self>,
        spec: &PipelineSpec,
        deadline: Instant,
    ) -> Result<ExecutionReport, ExecError> {
        let mut statuses: Vec<PartialStatus> = Vec::new();
        let mut nodes_used: Vec<String> = Vec::new();

        // Step 1 inputs come from the client; later steps chain.
        let mut input: Option<String> = match &spec.client_input {
            Some(payload) => Some(self.ctx.gateway.put_payload(payload).map_err(|e| {
                ExecError::failed(FailureKind::Internal(e.to_string()), Vec::new())
            })?),
            None => None,
        };

        for step in &spec.steps {
            let attempts = match spec.failure_policy {
                fleet_types::job::FailurePolicy::RollbackAndRetry => 1 + spec.retry_limit,
                fleet_types::job::FailurePolicy::FailFast => 1,
            };

            let mut step_output: Option<String> = None;
            for attempt in 0..attempts {
                if self.cancel.is_cancelled() {
                    return Err(ExecError::Cancelled);
                }
                let timeout = per_item_timeout(step.timeout_secs, deadline);
                if timeout == 0 {
                    break;
                }
                if attempt > 0 {
                    debug!(
                        job_id = %self.job_id,
                        step = step.index,
                        attempt,
                        "retrying pipeline step with unchanged inputs"
                    );
                }

                // Retries get a fresh work-item id, same inputs.
                let item = self.make_item(
                    &step.node_id,
                    &step.model_id,
                    input.clone(),
                    None,
                    timeout,
                );
                let work_id = item.id.clone();
                let handle = match self.dispatch_accept(item).await {
                    Ok(handle) => handle,
                    Err(kind) => {
                        statuses.push(ack_failure(&work_id, &step.node_id, kind));
                        continue;
                    }
                };
                if step.index == 1 {
                    self.signal_started();
                }

                let partial = self
                    .collect_result(handle, Duration::from_secs(timeout))
                    .await;
                statuses.push(PartialStatus::from(&partial));
                if partial.is_ok() {
                    step_output = partial.output;
                    break;
                }
            }

            match step_output {
                Some(output) => {
                    nodes_used.push(step.node_id.clone());
                    input = Some(output);
                }
                None => {
                    return Err(ExecError::failed(
                        FailureKind::StepFailed(step.index),
                        statuses,
                    ));
                }
            }
        }

        Ok(ExecutionReport {
            result: input,
            nodes_used,
            partials: statuses,
            elapsed_ms: 0,
        })
    }

    // ── Shared plumbing ──────────────────────────────────────────────────

    fn make_item(
        &self,
        node_id: &str,
        model_id: &str,
        input: Option<String>,
        data_selector: Option<String>,
        timeout_secs: u64,
    ) -> WorkItem {
        WorkItem {
            id: new_work_id(),
            job_id: self.job_id.clone(),
            node_id: node_id.to_string(),
            model_id: model_id.to_string(),
            input,
            data_selector,
            priority: self.priority,
            timeout_secs,
            issued_at: Utc::now(),
        }
    }

    /// Dispatch an item and wait for its ack. On anything but `Accepted`
    /// the pending channels are torn down before returning.
    async fn dispatch_accept(
        &self,
        item: WorkItem,
    ) -> Result<crate::dispatch::WorkHandle, FailureKind> {
        let work_id = item.id.clone();
        self.track(&work_id);

        let mut handle = match self.ctx.dispatcher.dispatch(item).await {
            Ok(handle) => handle,
            Err(kind) => {
                self.untrack(&work_id);
                return Err(kind);
            }
        };

        let ack_timeout = Duration::from_secs(self.ctx.cfg.dispatch_ack_timeout_secs);
        match handle.await_ack(ack_timeout).await {
            Ok(fleet_types::work::AckStatus::Accepted) => Ok(handle),
            Ok(fleet_types::work::AckStatus::Backpressure) => {
                self.untrack(&work_id);
                self.ctx.dispatcher.forget(&work_id);
                Err(FailureKind::Backpressure)
            }
            Err(kind) => {
                self.untrack(&work_id);
                self.ctx.dispatcher.forget(&work_id);
                Err(kind)
            }
        }
    }

    /// Await one partial, fold failures into a synthetic partial, and feed
    /// the registry's reputation loop.
    async fn collect_result(
        &self,
        mut handle: crate::dispatch::WorkHandle,
        timeout: Duration,
    ) -> PartialResult {
        let work_id = handle.work_id.clone();
        let node_id = handle.node_id.clone();

        let partial = match handle.await_result(timeout).await {
            Ok(partial) => partial,
            Err(kind) => {
                self.ctx.dispatcher.forget(&work_id);
                PartialResult {
                    work_id: work_id.clone(),
                    job_id: self.job_id.clone(),
                    node_id: node_id.clone(),
                    output: None,
                    elapsed_ms: timeout.as_millis() as u64,
                    error: Some(kind),
                }
            }
        };
        self.untrack(&work_id);
        self.ctx.registry.record_outcome(&node_id, partial.is_ok());
        let _ = self.events.send(ExecutorEvent {
            job_id: self.job_id.clone(),
            kind: ExecutorEventKind::PartialObserved(PartialStatus::from(&partial)),
        });
        partial
    }

    fn signal_started(&self) {
        if !self.started_sent.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ExecutorEvent {
                job_id: self.job_id.clone(),
                kind: ExecutorEventKind::Started,
            });
        }
    }

    fn track(&self, work_id: &str) {
        self.outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .insert(work_id.to_string());
    }

    fn untrack(&self, work_id: &str) {
        self.outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .remove(work_id);
    }

    /// Delete outstanding work items: forget their channels locally and
    /// publish a tombstone so nodes drop them wherever they are.
    async fn tombstone_outstanding(&self) {
        let work_ids: Vec<String> = {
            let mut outstanding = self.outstanding.lock().expect("outstanding lock poisoned");
            outstanding.drain().collect()
        };
        if work_ids.is_empty() {
            return;
        }
        for work_id in &work_ids {
            self.ctx.dispatcher.forget(work_id);
        }
        self.ctx
            .gateway
            .publish_best_effort(
                &self.ctx.cfg.topics.job_cancel,
                KIND_TOMBSTONE,
                &CancelMessage::Tombstone {
                    job_id: self.job_id.clone(),
                    work_ids,
                },
            )
            .await;
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Per-item deadline: `min(spec timeout, remaining global budget)`, in
/// whole seconds. Zero means the global deadline already passed.
fn per_item_timeout(spec_timeout_secs: u64, deadline: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(Instant::now()).as_secs();
    spec_timeout_secs.min(remaining)
}

fn ack_failure(work_id: &str, node_id: &str, kind: FailureKind) -> PartialStatus {
    PartialStatus {
        work_id: work_id.to_string(),
        node_id: node_id.to_string(),
        ok: false,
        error: Some(kind),
        elapsed_ms: 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
