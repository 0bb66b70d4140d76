//! Job model: specs for the three execution patterns, the per-job state
//! machine, and the `jobs.updates` event record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::work::PartialStatus;

pub type JobId = String;

/// Generate a fresh job id.
pub fn new_job_id() -> JobId {
    format!("job-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

// ── Job State Machine ────────────────────────────────────────────────────────

/// Pending → Running → (Completed | Failed | Cancelled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted and persisted; initial work items not yet accepted by nodes.
    Pending,
    /// All initial work items accepted by their target nodes.
    Running,
    /// The pattern executor produced a fused result.
    Completed,
    /// The pattern executor hit an irrecoverable error.
    Failed,
    /// Explicit cancel was observed before a terminal state.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `to` follows a defined edge.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// ── Priority ─────────────────────────────────────────────────────────────────

/// Queue priority on node daemons. Ordering: High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

// ── Job Specs ────────────────────────────────────────────────────────────────

/// Aggregation applied to numeric fan-out partials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationKind {
    Mean,
    WeightedMean,
    Median,
}

/// How consensus votes are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusKind {
    Majority,
    Weighted,
    Review,
}

/// What a pipeline step failure does to the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    RollbackAndRetry,
    FailFast,
}

/// Same model, different nodes, fused result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutSpec {
    pub model_id: String,
    /// Pinned target nodes. At least two.
    pub nodes: Vec<String>,
    /// Selects the node-local dataset the model runs over.
    pub data_selector: String,
    pub aggregation: AggregationKind,
    /// Differential-privacy budget. `None` disables post-fusion noise.
    pub epsilon: Option<f64>,
    /// Query sensitivity for the Laplace scale. Defaults to 1.0.
    pub sensitivity: Option<f64>,
    pub min_reputation: f64,
    pub timeout_secs: u64,
}

/// Different models, one node, combined by vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSpec {
    /// Executed sequentially on the same inputs. At least two.
    pub model_ids: Vec<String>,
    pub node_id: String,
    pub data_selector: String,
    pub consensus: ConsensusKind,
    /// Required weight share of the top label, in [0, 1].
    pub min_agreement: f64,
    /// Per-model vote weights. Missing models default to 0.5.
    #[serde(default)]
    pub model_reputations: BTreeMap<String, f64>,
    pub timeout_secs: u64,
}

/// Where a pipeline step reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepInput {
    /// The client payload carried in the spec.
    Client,
    /// The output of an earlier step (1-based index).
    Step(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based position in the pipeline.
    pub index: u32,
    pub model_id: String,
    pub node_id: String,
    pub input: StepInput,
    pub timeout_secs: u64,
}

/// Sequential steps, output-to-input chaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// At least two, numbered 1..=len in order.
    pub steps: Vec<PipelineStep>,
    pub failure_policy: FailurePolicy,
    pub retry_limit: u32,
    /// Input payload for steps that read from the client.
    pub client_input: Option<crate::work::WorkOutput>,
}

/// A client-submitted job spec. One behavior per tag; immutable after submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobSpec {
    FanOut(FanOutSpec),
    Consensus(ConsensusSpec),
    Pipeline(PipelineSpec),
}

impl JobSpec {
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::FanOut(_) => "fan-out",
            Self::Consensus(_) => "consensus",
            Self::Pipeline(_) => "pipeline",
        }
    }

    /// Wall-clock budget for the whole job, before the system default cap.
    pub fn timeout_secs(&self) -> u64 {
        match self {
            Self::FanOut(s) => s.timeout_secs,
            Self::Consensus(s) => s.timeout_secs,
            Self::Pipeline(s) => s.steps.iter().map(|st| st.timeout_secs).sum(),
        }
    }

    /// Node ids this spec pins work to.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        match self {
            Self::FanOut(s) => s.nodes.iter().map(String::as_str).collect(),
            Self::Consensus(s) => vec![s.node_id.as_str()],
            Self::Pipeline(s) => s.steps.iter().map(|st| st.node_id.as_str()).collect(),
        }
    }

    /// Number of work items the initial dispatch will create.
    pub fn initial_work_items(&self) -> usize {
        match self {
            Self::FanOut(s) => s.nodes.len(),
            Self::Consensus(s) => s.model_ids.len(),
            Self::Pipeline(s) => s.steps.len(),
        }
    }

    /// Shape validation, independent of any registry state.
    pub fn validate_shape(&self) -> Result<(), String> {
        match self {
            Self::FanOut(s) => {
                if s.nodes.len() < 2 {
                    return Err("fan-out requires at least 2 nodes".into());
                }
                if !(0.0..=1.0).contains(&s.min_reputation) {
                    return Err("min_reputation must be in [0, 1]".into());
                }
                if let Some(eps) = s.epsilon {
                    if eps <= 0.0 {
                        return Err("epsilon must be positive".into());
                    }
                }
            }
            Self::Consensus(s) => {
                if s.model_ids.len() < 2 {
                    return Err("consensus requires at least 2 models".into());
                }
                if !(0.0..=1.0).contains(&s.min_agreement) {
                    return Err("min_agreement must be in [0, 1]".into());
                }
            }
            Self::Pipeline(s) => {
                if s.steps.len() < 2 {
                    return Err("pipeline requires at least 2 steps".into());
                }
                for (i, step) in s.steps.iter().enumerate() {
                    let expected = i as u32 + 1;
                    if step.index != expected {
                        return Err(format!(
                            "step at position {i} is numbered {}, expected {expected}",
                            step.index
                        ));
                    }
                    match step.input {
                        StepInput::Client => {
                            if step.index != 1 {
                                return Err(format!(
                                    "step {} reads client input; only step 1 may",
                                    step.index
                                ));
                            }
                        }
                        StepInput::Step(n) => {
                            if step.index == 1 || n + 1 != step.index {
                                return Err(format!(
                                    "step {} must read from step {}",
                                    step.index,
                                    step.index.saturating_sub(1).max(1)
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Job ──────────────────────────────────────────────────────────────────────

/// A job as tracked by its owning orchestrator replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub owner: String,
    pub priority: Priority,
    pub cost_ceiling: Option<f64>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Blob handle of the fused result, set at Completed (and at
    /// Failed(ReviewRequired), where it points at the attached partials).
    pub result: Option<String>,
    pub failure: Option<FailureKind>,
    /// Per-work-item statuses for diagnosis.
    #[serde(default)]
    pub partials: Vec<PartialStatus>,
    /// Work items resolved so far out of the initial set.
    pub progress_completed: u32,
    pub progress_total: u32,
}

impl Job {
    pub fn new(
        id: JobId,
        spec: JobSpec,
        owner: String,
        priority: Priority,
        cost_ceiling: Option<f64>,
    ) -> Self {
        let total = spec.initial_work_items() as u32;
        Self {
            id,
            spec,
            owner,
            priority,
            cost_ceiling,
            state: JobState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            failure: None,
            partials: Vec::new(),
            progress_completed: 0,
            progress_total: total,
        }
    }

    /// Apply a state transition. Rejects edges the state machine does not
    /// define, so state never regresses.
    pub fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        match to {
            JobState::Running => self.started_at = Some(Utc::now()),
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            JobState::Pending => {}
        }
        self.state = to;
        Ok(())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.progress_total == 0 {
            return 0.0;
        }
        100.0 * f64::from(self.progress_completed) / f64::from(self.progress_total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

// ── Bus records ──────────────────────────────────────────────────────────────

/// Published on `jobs.updates` for every state transition of a job.
/// `seq` is per-job and strictly increasing, so consumers can replay the
/// state sequence in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub seq: u64,
    pub owner: String,
    pub failure: Option<FailureKind>,
    pub result: Option<String>,
    pub at: DateTime<Utc>,
}

/// The `active-jobs` mutable-name record: job id → owning replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnershipTable {
    pub jobs: BTreeMap<JobId, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fanout_spec(nodes: &[&str]) -> JobSpec {
        JobSpec::FanOut(FanOutSpec {
            model_id: "m1".into(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            data_selector: "default".into(),
            aggregation: AggregationKind::Mean,
            epsilon: None,
            sensitivity: None,
            min_reputation: 0.0,
            timeout_secs: 60,
        })
    }

    #[test]
    fn state_machine_happy_path() {
        let mut job = Job::new(
            new_job_id(),
            fanout_spec(&["a", "b"]),
            "user-1".into(),
            Priority::Normal,
            None,
        );
        assert_eq!(job.state, JobState::Pending);

        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());

        job.transition(JobState::Completed).unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.state.is_terminal());
    }

    #[test]
    fn no_state_regression() {
        let mut job = Job::new(
            new_job_id(),
            fanout_spec(&["a", "b"]),
            "user-1".into(),
            Priority::Normal,
            None,
        );
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Cancelled).unwrap();

        // Every edge out of a terminal state is rejected.
        for to in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert!(job.transition(to).is_err());
        }
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn pending_can_fail_or_cancel() {
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
    }

    #[test]
    fn fanout_shape_validation() {
        assert!(fanout_spec(&["a", "b"]).validate_shape().is_ok());
        assert!(fanout_spec(&["a"]).validate_shape().is_err());
    }

    #[test]
    fn consensus_needs_two_models() {
        let spec = JobSpec::Consensus(ConsensusSpec {
            model_ids: vec!["m1".into()],
            node_id: "a".into(),
            data_selector: "default".into(),
            consensus: ConsensusKind::Majority,
            min_agreement: 0.5,
            model_reputations: BTreeMap::new(),
            timeout_secs: 60,
        });
        assert!(spec.validate_shape().is_err());
    }

    #[test]
    fn pipeline_numbering_and_inputs() {
        let step = |index: u32, input: StepInput| PipelineStep {
            index,
            model_id: format!("m{index}"),
            node_id: "a".into(),
            input,
            timeout_secs: 30,
        };

        let good = JobSpec::Pipeline(PipelineSpec {
            steps: vec![step(1, StepInput::Client), step(2, StepInput::Step(1))],
            failure_policy: FailurePolicy::FailFast,
            retry_limit: 0,
            client_input: None,
        });
        assert!(good.validate_shape().is_ok());

        let bad_numbering = JobSpec::Pipeline(PipelineSpec {
            steps: vec![step(1, StepInput::Client), step(3, StepInput::Step(1))],
            failure_policy: FailurePolicy::FailFast,
            retry_limit: 0,
            client_input: None,
        });
        assert!(bad_numbering.validate_shape().is_err());

        let bad_input = JobSpec::Pipeline(PipelineSpec {
            steps: vec![step(1, StepInput::Client), step(2, StepInput::Client)],
            failure_policy: FailurePolicy::FailFast,
            retry_limit: 0,
            client_input: None,
        });
        assert!(bad_input.validate_shape().is_err());
    }

    #[test]
    fn job_spec_serde_round_trip() {
        let spec = fanout_spec(&["a", "b", "c"]);
        let json = serde_json::to_string(&spec).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        match back {
            JobSpec::FanOut(s) => assert_eq!(s.nodes.len(), 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }
}
