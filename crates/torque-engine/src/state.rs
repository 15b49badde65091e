use std::collections::{BTreeMap, HashSet};

use torque_core::error::{Result, TorqueError};
use torque_core::plan::WorkflowPlan;
use torque_core::types::{SkipCause, StepError, StepResult, StepStatus};

/// Per-run result state. Every mutation goes through a checked transition.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    results: BTreeMap<String, StepResult>,
    failed_order: Vec<String>,
    emitted: HashSet<String>,
    aborting: Option<String>,
}

impl RunState {
    /// All steps of `plan` start in `pending`.
    pub fn new(plan: &WorkflowPlan) -> Self {
        let results = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepResult::default()))
            .collect();
        Self {
            results,
            ..Self::default()
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(|r| r.status)
    }

    pub fn results(&self) -> &BTreeMap<String, StepResult> {
        &self.results
    }

    /// Step ids in the order they reached `failed`.
    pub fn failed_order(&self) -> &[String] {
        &self.failed_order
    }

    pub fn is_complete(&self) -> bool {
        self.results.values().all(|r| r.status.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.results
            .values()
            .filter(|r| r.status == StepStatus::Running)
            .count()
    }

    /// Whether the step was already handed out in a wave.
    pub fn was_emitted(&self, step_id: &str) -> bool {
        self.emitted.contains(step_id)
    }

    pub(crate) fn mark_emitted(&mut self, step_id: &str) {
        self.emitted.insert(step_id.to_string());
    }

    /// The step whose failure raised the plan-wide abort flag.
    pub fn aborting(&self) -> Option<&str> {
        self.aborting.as_deref()
    }

    /// Raise the plan-wide abort flag. The first trigger wins.
    pub fn raise_abort(&mut self, trigger: &str) {
        if self.aborting.is_none() {
            self.aborting = Some(trigger.to_string());
        }
    }

    /// Move a step to `to`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, step_id: &str, to: StepStatus) -> Result<&mut StepResult> {
        let result = self
            .results
            .get_mut(step_id)
            .ok_or_else(|| TorqueError::StepNotFound(step_id.to_string()))?;
        if !result.status.can_transition_to(to) {
            return Err(TorqueError::InvalidTransition {
                step: step_id.to_string(),
                from: result.status,
                to,
            });
        }
        result.status = to;
        Ok(result)
    }

    pub fn mark_running(&mut self, step_id: &str) -> Result<()> {
        self.transition(step_id, StepStatus::Running)?;
        Ok(())
    }

    pub fn record_success(
        &mut self,
        step_id: &str,
        payload: serde_json::Value,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Result<()> {
        let result = self.transition(step_id, StepStatus::Succeeded)?;
        result.payload = Some(payload);
        result.attempts = attempts;
        result.elapsed_ms = elapsed_ms;
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        step_id: &str,
        error: StepError,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Result<()> {
        let result = self.transition(step_id, StepStatus::Failed)?;
        result.error = Some(error);
        result.attempts = attempts;
        result.elapsed_ms = elapsed_ms;
        self.failed_order.push(step_id.to_string());
        Ok(())
    }

    pub fn record_skip(
        &mut self,
        step_id: &str,
        cause: SkipCause,
        error: StepError,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Result<()> {
        let result = self.transition(step_id, StepStatus::Skipped)?;
        result.skip_cause = Some(cause);
        result.error = Some(error);
        result.attempts = attempts;
        result.elapsed_ms = elapsed_ms;
        Ok(())
    }

    /// The step a skip cascade ultimately originates from.
    pub fn cascade_root(&self, step_id: &str) -> String {
        match self.results.get(step_id).and_then(|r| r.skip_cause.as_ref()) {
            Some(SkipCause::Upstream { root, .. }) => root.clone(),
            Some(SkipCause::Aborted { trigger }) => trigger.clone(),
            _ => step_id.to_string(),
        }
    }
}
