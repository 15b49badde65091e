use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TorqueError};

/// Informational risk classification attached by the planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// What happens when a step's attempt fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fail on the first failed attempt; descendants are skipped.
    #[default]
    Abort,
    /// Retry up to `retry_budget` additional attempts, then fail.
    Retry,
    /// Retry up to `retry_budget` additional attempts, then skip.
    Skip,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Retry => "retry",
            FailurePolicy::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// One unit of work targeting exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the plan; also the context key for this step's output.
    pub step_id: String,
    /// Logical agent name, resolved through the service directory.
    pub target_agent: String,
    /// Opaque payload forwarded to the agent.
    #[serde(default)]
    pub instruction: serde_json::Value,
    /// Steps that must be terminal before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Upstream `step_id` -> key under which its output reaches this step.
    #[serde(default)]
    pub context_bindings: BTreeMap<String, String>,
    /// Advisory grouping tag, used for reporting only.
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Additional attempts after the first.
    #[serde(default)]
    pub retry_budget: u32,
    /// Per-attempt bound.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

fn default_timeout_seconds() -> f64 {
    30.0
}

impl Step {
    /// Create a step with default policy (abort, no retries, 30s timeout).
    pub fn new(step_id: impl Into<String>, target_agent: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            target_agent: target_agent.into(),
            instruction: serde_json::Value::Null,
            depends_on: vec![],
            context_bindings: BTreeMap::new(),
            parallel_group: None,
            failure_policy: FailurePolicy::default(),
            retry_budget: 0,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_instruction(mut self, instruction: serde_json::Value) -> Self {
        self.instruction = instruction;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Expose `upstream`'s output under `key`.
    pub fn bind(mut self, upstream: impl Into<String>, key: impl Into<String>) -> Self {
        self.context_bindings.insert(upstream.into(), key.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy, retry_budget: u32) -> Self {
        self.failure_policy = policy;
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Per-attempt timeout. Values outside `Duration`'s range saturate.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(Duration::MAX)
    }

    /// Short human-readable rendering of the instruction.
    pub fn instruction_text(&self) -> String {
        match &self.instruction {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => "(none)".to_string(),
            other => other.to_string(),
        }
    }
}

/// Immutable input to one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub plan_id: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub original_query: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowPlan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            risk_level: RiskLevel::default(),
            request_id: None,
            original_query: None,
            steps,
        }
    }

    /// Parse and field-validate a plan from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: WorkflowPlan =
            serde_json::from_str(json).map_err(|e| TorqueError::PlanParse(e.to_string()))?;
        plan.validate_fields()?;
        Ok(plan)
    }

    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Field-level checks. Graph-level checks (unknown references, cycles)
    /// happen when the dependency graph is built.
    pub fn validate_fields(&self) -> Result<()> {
        if self.plan_id.trim().is_empty() {
            return Err(TorqueError::PlanInvalid("plan_id must not be empty".into()));
        }
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(TorqueError::PlanInvalid("step_id must not be empty".into()));
            }
            if step.target_agent.trim().is_empty() {
                return Err(TorqueError::PlanInvalid(format!(
                    "step {} has no target_agent",
                    step.step_id
                )));
            }
            if !(step.timeout_seconds.is_finite() && step.timeout_seconds > 0.0) {
                return Err(TorqueError::PlanInvalid(format!(
                    "step {} timeout_seconds must be > 0",
                    step.step_id
                )));
            }
            if Duration::try_from_secs_f64(step.timeout_seconds).is_err() {
                return Err(TorqueError::PlanInvalid(format!(
                    "step {} timeout_seconds {} is out of range",
                    step.step_id, step.timeout_seconds
                )));
            }
        }
        Ok(())
    }
}
