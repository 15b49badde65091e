use std::collections::BTreeMap;
use std::fmt::Write;

use torque_core::error::TorqueError;
use torque_core::plan::{Step, WorkflowPlan};
use torque_core::types::{ExecutionReport, SkipCause, StepReport, StepResult, StepStatus};

use crate::state::RunState;

const INSTRUCTION_PREVIEW_CHARS: usize = 80;

/// Builds the execution report from the final run state.
///
/// Pure function of its inputs: aggregating the same state twice yields
/// identical reports.
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn aggregate(plan: &WorkflowPlan, state: &RunState) -> ExecutionReport {
        let steps = Self::step_reports(plan, state);
        let success = plan.steps.iter().all(|s| Self::acceptable(state, &s.step_id));
        let failed_steps = state.failed_order().to_vec();

        let succeeded = steps
            .values()
            .filter(|r| r.status == StepStatus::Succeeded)
            .count();

        let mut summary = format!(
            "Plan {}: {} ({} of {} steps succeeded)",
            plan.plan_id,
            if success { "SUCCEEDED" } else { "FAILED" },
            succeeded,
            plan.steps.len()
        );
        for (i, step) in plan.steps.iter().enumerate() {
            let result = state.get(&step.step_id).cloned().unwrap_or_default();
            summary.push('\n');
            Self::describe(&mut summary, i + 1, step, &result);
        }
        if !failed_steps.is_empty() {
            let _ = write!(summary, "\nFailed steps: {}", failed_steps.join(", "));
        }

        ExecutionReport {
            plan_id: plan.plan_id.clone(),
            success,
            steps,
            failed_steps,
            summary,
        }
    }

    /// Report for a plan rejected before any step ran.
    pub fn rejected(plan: &WorkflowPlan, error: &TorqueError) -> ExecutionReport {
        let state = RunState::new(plan);
        let steps = Self::step_reports(plan, &state);

        let cycle = error.cycle_steps();
        let summary = if cycle.is_empty() {
            format!("Plan {} rejected: {}. No steps were run.", plan.plan_id, error)
        } else {
            format!(
                "Plan {} rejected: dependency cycle between steps {}. No steps were run.",
                plan.plan_id,
                cycle.join(" -> ")
            )
        };

        ExecutionReport {
            plan_id: plan.plan_id.clone(),
            success: false,
            steps,
            failed_steps: Vec::new(),
            summary,
        }
    }

    fn step_reports(plan: &WorkflowPlan, state: &RunState) -> BTreeMap<String, StepReport> {
        plan.steps
            .iter()
            .map(|step| {
                let result = state.get(&step.step_id).cloned().unwrap_or_default();
                (
                    step.step_id.clone(),
                    StepReport {
                        status: result.status,
                        attempts: result.attempts,
                        agent: step.target_agent.clone(),
                        elapsed_ms: result.elapsed_ms,
                        error: result.error,
                        skip_cause: result.skip_cause,
                    },
                )
            })
            .collect()
    }

    /// A step is acceptable for overall success if it succeeded, was skipped
    /// by its own `skip` policy, or was cascade-skipped from such a step.
    fn acceptable(state: &RunState, step_id: &str) -> bool {
        let Some(result) = state.get(step_id) else {
            return false;
        };
        match (result.status, &result.skip_cause) {
            (StepStatus::Succeeded, _) => true,
            (StepStatus::Skipped, Some(SkipCause::Policy)) => true,
            (StepStatus::Skipped, Some(SkipCause::Upstream { root, .. })) => matches!(
                state.get(root).and_then(|r| r.skip_cause.as_ref()),
                Some(SkipCause::Policy)
            ),
            _ => false,
        }
    }

    fn describe(out: &mut String, index: usize, step: &Step, result: &StepResult) {
        let _ = write!(
            out,
            "{}. [{}] {} via {}",
            index, result.status, step.step_id, step.target_agent
        );
        if let Some(group) = &step.parallel_group {
            let _ = write!(out, " (group {})", group);
        }
        let _ = write!(out, ": \"{}\"", preview(&step.instruction_text()));
        match result.attempts {
            0 => {}
            1 => out.push_str(" (1 attempt)"),
            n => {
                let _ = write!(out, " ({} attempts)", n);
            }
        }
        if let Some(error) = &result.error {
            let _ = write!(out, ". {}", error);
        }
    }
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(INSTRUCTION_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}
