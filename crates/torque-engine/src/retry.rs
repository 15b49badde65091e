use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use torque_core::config::RetryConfig;
use torque_core::event::EventBus;
use torque_core::plan::{FailurePolicy, Step};
use torque_core::types::{RawResult, RunId, SkipCause, StepError, StepStatus, WorkflowEvent};

/// Terminal outcome of one step, as decided by its failure policy.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        payload: serde_json::Value,
        attempts: u32,
        elapsed_ms: u64,
    },
    Failed {
        error: StepError,
        attempts: u32,
        elapsed_ms: u64,
    },
    Skipped {
        cause: SkipCause,
        error: StepError,
        attempts: u32,
        elapsed_ms: u64,
    },
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Succeeded { .. } => StepStatus::Succeeded,
            StepOutcome::Failed { .. } => StepStatus::Failed,
            StepOutcome::Skipped { .. } => StepStatus::Skipped,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Succeeded { attempts, .. }
            | StepOutcome::Failed { attempts, .. }
            | StepOutcome::Skipped { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            StepOutcome::Succeeded { elapsed_ms, .. }
            | StepOutcome::Failed { elapsed_ms, .. }
            | StepOutcome::Skipped { elapsed_ms, .. } => *elapsed_ms,
        }
    }
}

/// Applies a step's failure policy and retry budget around its attempts.
pub struct RetryController {
    backoff: RetryConfig,
    event_bus: Arc<EventBus>,
}

impl RetryController {
    pub fn new(backoff: RetryConfig, event_bus: Arc<EventBus>) -> Self {
        Self { backoff, event_bus }
    }

    /// Whether another attempt follows a failed attempt number `attempts`.
    ///
    /// `abort` never retries. `retry` and `skip` retry while
    /// `attempts <= retry_budget`, so a step makes at most
    /// `1 + retry_budget` attempts.
    pub fn should_retry(step: &Step, attempts: u32) -> bool {
        match step.failure_policy {
            FailurePolicy::Abort => false,
            FailurePolicy::Retry | FailurePolicy::Skip => attempts <= step.retry_budget,
        }
    }

    /// Map a final failure to the terminal state the policy dictates.
    pub fn settle(step: &Step, error: StepError, attempts: u32, elapsed_ms: u64) -> StepOutcome {
        match step.failure_policy {
            FailurePolicy::Skip => StepOutcome::Skipped {
                cause: SkipCause::Policy,
                error,
                attempts,
                elapsed_ms,
            },
            FailurePolicy::Abort | FailurePolicy::Retry => StepOutcome::Failed {
                error,
                attempts,
                elapsed_ms,
            },
        }
    }

    /// Drive `attempt_fn` (called with the 1-based attempt number) until it
    /// succeeds or the policy gives up.
    pub async fn run<F, Fut>(&self, run_id: &RunId, step: &Step, mut attempt_fn: F) -> StepOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RawResult>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.event_bus.publish(WorkflowEvent::StepAttempt {
                run_id: run_id.clone(),
                step_id: step.step_id.clone(),
                agent: step.target_agent.clone(),
                attempt: attempts,
            });

            let raw = attempt_fn(attempts).await;
            let error = match raw.outcome {
                Ok(payload) => {
                    return StepOutcome::Succeeded {
                        payload,
                        attempts,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    };
                }
                Err(error) => error,
            };

            if !Self::should_retry(step, attempts) {
                info!(
                    step_id = %step.step_id,
                    policy = %step.failure_policy,
                    attempts,
                    error = %error,
                    "Step gave up"
                );
                return Self::settle(step, error, attempts, start.elapsed().as_millis() as u64);
            }

            let backoff = self.backoff.backoff(attempts);
            warn!(
                step_id = %step.step_id,
                attempt = attempts,
                retry_budget = step.retry_budget,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying step"
            );
            self.event_bus.publish(WorkflowEvent::StepRetrying {
                run_id: run_id.clone(),
                step_id: step.step_id.clone(),
                attempt: attempts,
                backoff_ms: backoff.as_millis() as u64,
                error,
            });
            tokio::time::sleep(backoff).await;
        }
    }
}
