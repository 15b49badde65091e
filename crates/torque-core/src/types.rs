use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one execution of a plan.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a step within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Legal moves of the step state machine. Retries stay in `Running`.
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Classification of a per-step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Agent not in the directory, marked unhealthy, or unreachable.
    AgentUnavailable,
    /// An attempt exceeded the step's timeout.
    Timeout,
    /// The agent answered with `success = false`.
    AgentRejected,
    /// A dependency was not terminal when the step was dispatched.
    DependencyUnsatisfied,
    /// A bound upstream output was never written.
    MissingContextBinding,
    /// Cascade marker: an upstream step failed or was skipped.
    SkippedDueToDependency,
    /// Plan-wide abort suppressed this step.
    Aborted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::AgentUnavailable => "AgentUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::AgentRejected => "AgentRejected",
            ErrorKind::DependencyUnsatisfied => "DependencyUnsatisfied",
            ErrorKind::MissingContextBinding => "MissingContextBinding",
            ErrorKind::SkippedDueToDependency => "SkippedDueToDependency",
            ErrorKind::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Structured failure reason recorded on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why a step ended `skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum SkipCause {
    /// The step itself failed under `failure_policy = skip`.
    Policy,
    /// An ancestor failed or was skipped. `root` is the step where the
    /// cascade originated.
    Upstream { dependency: String, root: String },
    /// The plan-wide abort flag was set by `trigger`.
    Aborted { trigger: String },
}

/// Outcome of one invocation attempt, as produced by the step invoker.
#[derive(Debug, Clone)]
pub struct RawResult {
    pub outcome: std::result::Result<serde_json::Value, StepError>,
    pub elapsed: Duration,
}

impl RawResult {
    pub fn success(payload: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            outcome: Ok(payload),
            elapsed,
        }
    }

    pub fn failure(error: StepError, elapsed: Duration) -> Self {
        Self {
            outcome: Err(error),
            elapsed,
        }
    }

    pub fn ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Mutable per-step state owned by the run coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<SkipCause>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Per-step entry of the execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub status: StepStatus,
    pub attempts: u32,
    pub agent: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<SkipCause>,
}

/// Consolidated outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub success: bool,
    pub steps: BTreeMap<String, StepReport>,
    pub failed_steps: Vec<String>,
    pub summary: String,
}

impl ExecutionReport {
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    pub fn to_json_pretty(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Plan accepted, execution started.
    RunStarted { run_id: RunId, plan_id: String, steps: usize },
    /// Plan rejected before any step ran.
    RunRejected { run_id: RunId, reason: String },
    /// A wave was dispatched.
    WaveStarted { run_id: RunId, index: usize, steps: Vec<String> },
    /// An attempt is about to be made.
    StepAttempt { run_id: RunId, step_id: String, agent: String, attempt: u32 },
    /// An attempt failed and another will follow after `backoff_ms`.
    StepRetrying { run_id: RunId, step_id: String, attempt: u32, backoff_ms: u64, error: StepError },
    /// A step reached a terminal state.
    StepFinished { run_id: RunId, step_id: String, status: StepStatus, attempts: u32, elapsed_ms: u64 },
    /// The plan-wide abort flag was raised.
    AbortRaised { run_id: RunId, trigger: String },
    /// Run finished and the report is ready.
    RunComplete { run_id: RunId, plan_id: String, success: bool, failed_steps: Vec<String> },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::RunRejected { run_id, .. }
            | WorkflowEvent::WaveStarted { run_id, .. }
            | WorkflowEvent::StepAttempt { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepFinished { run_id, .. }
            | WorkflowEvent::AbortRaised { run_id, .. }
            | WorkflowEvent::RunComplete { run_id, .. } => run_id,
        }
    }
}
