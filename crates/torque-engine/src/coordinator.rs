use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use torque_core::config::{AbortMode, EngineConfig};
use torque_core::event::EventBus;
use torque_core::plan::{FailurePolicy, Step, WorkflowPlan};
use torque_core::traits::{AgentTransport, ServiceDirectory};
use torque_core::types::{
    ErrorKind, ExecutionReport, RunId, SkipCause, StepError, StepStatus, WorkflowEvent,
};

use crate::aggregator::ResultAggregator;
use crate::context::ExecutionContext;
use crate::graph::DependencyGraph;
use crate::invoker::StepInvoker;
use crate::retry::{RetryController, StepOutcome};
use crate::state::RunState;

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub report: ExecutionReport,
    pub state: RunState,
    pub context: ExecutionContext,
}

/// Plan-wide abort flag shared by the coordinator and in-flight step tasks.
#[derive(Clone, Default)]
struct AbortSignal {
    token: CancellationToken,
    trigger: Arc<OnceLock<String>>,
}

impl AbortSignal {
    fn raise(&self, step_id: &str) {
        let _ = self.trigger.set(step_id.to_string());
        self.token.cancel();
    }

    fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    fn trigger(&self) -> Option<&str> {
        self.trigger.get().map(String::as_str)
    }
}

/// Drives one workflow execution per `execute` call.
///
/// Holds no per-run state: every call builds its own `RunState`,
/// `ExecutionContext` and abort flag, so concurrent runs sharing one
/// coordinator do not interfere.
pub struct RunCoordinator {
    invoker: Arc<StepInvoker>,
    retry: Arc<RetryController>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl RunCoordinator {
    pub fn new(
        directory: Arc<dyn ServiceDirectory>,
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
    ) -> Self {
        Self::with_event_bus(directory, transport, config, Arc::new(EventBus::default()))
    }

    pub fn with_event_bus(
        directory: Arc<dyn ServiceDirectory>,
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let retry = Arc::new(RetryController::new(config.retry.clone(), event_bus.clone()));
        Self {
            invoker: Arc::new(StepInvoker::new(directory, transport)),
            retry,
            config,
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Execute `plan` and return its report. Never fails: rejected plans and
    /// failed steps are described inside the report.
    pub async fn execute(&self, plan: &WorkflowPlan) -> ExecutionReport {
        self.execute_run(plan).await.report
    }

    /// Execute `plan` and keep the final state and context alongside the report.
    pub async fn execute_run(&self, plan: &WorkflowPlan) -> RunOutcome {
        let run_id = RunId::new();
        let start = Instant::now();
        let mut state = RunState::new(plan);
        let context = ExecutionContext::new();

        let graph = match plan
            .validate_fields()
            .and_then(|_| DependencyGraph::build(plan))
        {
            Ok(graph) => graph,
            Err(e) => {
                error!(run_id = %run_id, plan_id = %plan.plan_id, error = %e, "Plan rejected");
                self.event_bus.publish(WorkflowEvent::RunRejected {
                    run_id: run_id.clone(),
                    reason: e.to_string(),
                });
                let report = ResultAggregator::rejected(plan, &e);
                self.publish_complete(&run_id, &report);
                return RunOutcome {
                    run_id,
                    report,
                    state,
                    context,
                };
            }
        };

        info!(
            run_id = %run_id,
            plan_id = %plan.plan_id,
            risk = ?plan.risk_level,
            steps = plan.steps.len(),
            "Workflow run started"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            plan_id: plan.plan_id.clone(),
            steps: plan.steps.len(),
        });

        let steps: HashMap<&str, &Step> =
            plan.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let abort = AbortSignal::default();
        let mut wave_index = 0usize;

        loop {
            let wave = graph.next_wave(&mut state);
            if wave.is_empty() {
                if state.running_count() > 0 {
                    warn!(run_id = %run_id, running = state.running_count(), "Empty wave with steps still running");
                }
                break;
            }

            wave_index += 1;
            debug!(run_id = %run_id, wave = wave_index, steps = ?wave, "Dispatching wave");
            self.event_bus.publish(WorkflowEvent::WaveStarted {
                run_id: run_id.clone(),
                index: wave_index,
                steps: wave.clone(),
            });

            self.run_wave(
                &run_id, &graph, &steps, &wave, &mut state, &context, &semaphore, &abort,
            )
            .await;
        }

        self.settle_leftovers(&graph, &mut state);

        let report = ResultAggregator::aggregate(plan, &state);
        info!(
            run_id = %run_id,
            plan_id = %plan.plan_id,
            success = report.success,
            waves = wave_index,
            failed = report.failed_steps.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Workflow run complete"
        );
        self.publish_complete(&run_id, &report);

        RunOutcome {
            run_id,
            report,
            state,
            context,
        }
    }

    /// Dispatch every member of `wave` and wait for all of them (the barrier).
    #[allow(clippy::too_many_arguments)]
    async fn run_wave(
        &self,
        run_id: &RunId,
        graph: &DependencyGraph,
        steps: &HashMap<&str, &Step>,
        wave: &[String],
        state: &mut RunState,
        context: &ExecutionContext,
        semaphore: &Arc<Semaphore>,
        abort: &AbortSignal,
    ) {
        let mut join_set = JoinSet::new();

        for id in wave {
            let Some(step) = steps.get(id.as_str()).copied() else {
                continue;
            };

            if let Some(dep) = graph
                .dependencies(id)
                .iter()
                .find(|d| state.status(d) != Some(StepStatus::Succeeded))
            {
                // Unreachable while the cascade rule holds.
                error!(step_id = %id, dependency = %dep, "Dependency unsatisfied at dispatch");
                let root = state.cascade_root(dep);
                let cause = SkipCause::Upstream {
                    dependency: dep.clone(),
                    root,
                };
                let error = StepError::new(
                    ErrorKind::DependencyUnsatisfied,
                    format!("dependency {} did not succeed", dep),
                );
                let outcome = StepOutcome::Skipped {
                    cause,
                    error,
                    attempts: 0,
                    elapsed_ms: 0,
                };
                self.apply(run_id, step, outcome, state, context, abort);
                continue;
            }

            if let Err(e) = state.mark_running(id) {
                error!(step_id = %id, error = %e, "Cannot dispatch step");
                continue;
            }

            let bound = match context.bind(step) {
                Ok(bound) => bound,
                Err(err) => {
                    warn!(step_id = %id, error = %err, "Missing context binding");
                    let outcome = RetryController::settle(step, err, 0, 0);
                    self.apply(run_id, step, outcome, state, context, abort);
                    continue;
                }
            };

            join_set.spawn(
                StepTask {
                    run_id: run_id.clone(),
                    step: step.clone(),
                    bound,
                    invoker: self.invoker.clone(),
                    retry: self.retry.clone(),
                    semaphore: semaphore.clone(),
                    abort: abort.clone(),
                    abort_mode: self.config.abort_mode,
                }
                .run(),
            );
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((step_id, outcome)) => {
                    if let Some(step) = steps.get(step_id.as_str()).copied() {
                        self.apply(run_id, step, outcome, state, context, abort);
                    }
                }
                Err(e) => error!(run_id = %run_id, error = %e, "Step task terminated unexpectedly"),
            }
        }

        // A panicked task leaves its step running; close it out.
        for id in wave {
            if state.status(id) == Some(StepStatus::Running) {
                if let Some(step) = steps.get(id.as_str()).copied() {
                    let outcome = StepOutcome::Failed {
                        error: StepError::new(
                            ErrorKind::AgentUnavailable,
                            "step task terminated unexpectedly",
                        ),
                        attempts: 0,
                        elapsed_ms: 0,
                    };
                    self.apply(run_id, step, outcome, state, context, abort);
                }
            }
        }
    }

    /// Record a terminal outcome. The only place step state leaves `running`.
    fn apply(
        &self,
        run_id: &RunId,
        step: &Step,
        outcome: StepOutcome,
        state: &mut RunState,
        context: &ExecutionContext,
        abort: &AbortSignal,
    ) {
        let step_id = step.step_id.as_str();
        let status = outcome.status();
        let attempts = outcome.attempts();
        let elapsed_ms = outcome.elapsed_ms();

        let recorded = match outcome {
            StepOutcome::Succeeded { payload, .. } => {
                if let Err(e) = context.write(step_id, payload.clone()) {
                    error!(step_id, error = %e, "Context write rejected");
                }
                state.record_success(step_id, payload, attempts, elapsed_ms)
            }
            StepOutcome::Failed { error, .. } => {
                warn!(step_id, agent = %step.target_agent, error = %error, attempts, "Step failed");
                let recorded = state.record_failure(step_id, error, attempts, elapsed_ms);
                if step.failure_policy == FailurePolicy::Abort
                    && self.config.abort_mode == AbortMode::Plan
                {
                    abort.raise(step_id);
                    let trigger = abort.trigger().unwrap_or(step_id).to_string();
                    if state.aborting().is_none() {
                        warn!(run_id = %run_id, trigger = %trigger, "Plan-wide abort raised");
                        self.event_bus.publish(WorkflowEvent::AbortRaised {
                            run_id: run_id.clone(),
                            trigger: trigger.clone(),
                        });
                    }
                    state.raise_abort(&trigger);
                }
                recorded
            }
            StepOutcome::Skipped { cause, error, .. } => {
                info!(step_id, error = %error, "Step skipped");
                state.record_skip(step_id, cause, error, attempts, elapsed_ms)
            }
        };

        if let Err(e) = recorded {
            error!(step_id, error = %e, "Step state transition rejected");
            return;
        }

        info!(step_id, status = %status, attempts, elapsed_ms, "Step finished");
        self.event_bus.publish(WorkflowEvent::StepFinished {
            run_id: run_id.clone(),
            step_id: step_id.to_string(),
            status,
            attempts,
            elapsed_ms,
        });
    }

    /// Close out anything left pending once no wave can be formed.
    fn settle_leftovers(&self, graph: &DependencyGraph, state: &mut RunState) {
        for id in graph.order() {
            if state.status(id) != Some(StepStatus::Pending) {
                continue;
            }
            let dep = graph
                .dependencies(id)
                .iter()
                .find(|d| state.status(d) != Some(StepStatus::Succeeded))
                .cloned()
                .unwrap_or_else(|| id.clone());
            error!(step_id = %id, dependency = %dep, "Step left pending at end of run");
            let root = state.cascade_root(&dep);
            if let Err(e) = state.record_skip(
                id,
                SkipCause::Upstream {
                    dependency: dep.clone(),
                    root,
                },
                StepError::new(
                    ErrorKind::DependencyUnsatisfied,
                    format!("dependency {} never completed", dep),
                ),
                0,
                0,
            ) {
                error!(step_id = %id, error = %e, "Step state transition rejected");
            }
        }
    }

    fn publish_complete(&self, run_id: &RunId, report: &ExecutionReport) {
        self.event_bus.publish(WorkflowEvent::RunComplete {
            run_id: run_id.clone(),
            plan_id: report.plan_id.clone(),
            success: report.success,
            failed_steps: report.failed_steps.clone(),
        });
    }
}

/// One step's dispatch, spawned onto the wave's task set.
struct StepTask {
    run_id: RunId,
    step: Step,
    bound: serde_json::Map<String, serde_json::Value>,
    invoker: Arc<StepInvoker>,
    retry: Arc<RetryController>,
    semaphore: Arc<Semaphore>,
    abort: AbortSignal,
    abort_mode: AbortMode,
}

impl StepTask {
    async fn run(self) -> (String, StepOutcome) {
        let step_id = self.step.step_id.clone();

        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let error = StepError::new(ErrorKind::AgentUnavailable, "concurrency limiter closed");
                return (step_id, RetryController::settle(&self.step, error, 0, 0));
            }
        };

        // Queued behind the ceiling when the abort was raised: never start.
        if self.abort.is_raised() {
            let trigger = self.abort.trigger().unwrap_or_default().to_string();
            let error = StepError::new(
                ErrorKind::Aborted,
                format!("run aborted after {} failed", trigger),
            );
            return (
                step_id,
                StepOutcome::Skipped {
                    cause: SkipCause::Aborted { trigger },
                    error,
                    attempts: 0,
                    elapsed_ms: 0,
                },
            );
        }

        let invoker = &self.invoker;
        let run_id = &self.run_id;
        let step = &self.step;
        let bound = &self.bound;
        let outcome = self
            .retry
            .run(run_id, step, move |attempt| invoker.invoke(run_id, step, bound, attempt))
            .await;

        if matches!(outcome, StepOutcome::Failed { .. })
            && step.failure_policy == FailurePolicy::Abort
            && self.abort_mode == AbortMode::Plan
        {
            self.abort.raise(&step_id);
        }

        (step_id, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use torque_core::config::AbortMode;
    use torque_test_utils::{
        fast_engine_config, repair_order_plan, CallMark, MockDirectory, Reply, ScriptedTransport,
    };

    fn coordinator(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> RunCoordinator {
        RunCoordinator::new(
            Arc::new(MockDirectory::automotive()),
            transport.clone(),
            config,
        )
    }

    fn position(marks: &[CallMark], mark: &CallMark) -> usize {
        marks
            .iter()
            .position(|m| m == mark)
            .unwrap_or_else(|| panic!("missing {mark:?}"))
    }

    #[tokio::test]
    async fn cyclic_plan_runs_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let plan = WorkflowPlan::new(
            "cyclic",
            vec![
                Step::new("a", "parts").depends_on(["b"]),
                Step::new("b", "parts").depends_on(["a"]),
            ],
        );
        let outcome = coordinator(&transport, fast_engine_config())
            .execute_run(&plan)
            .await;

        assert!(!outcome.report.success);
        assert!(outcome.report.summary.contains("cycle"));
        assert!(outcome.report.summary.contains('a') && outcome.report.summary.contains('b'));
        assert_eq!(transport.call_count(), 0);
        assert!(outcome
            .state
            .results()
            .values()
            .all(|r| r.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn failed_dependency_skips_without_invoking() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a", vec![Reply::reject("Repair Order Not Found")]);
        let plan = WorkflowPlan::new(
            "cascade",
            vec![
                Step::new("a", "repair_orders"),
                Step::new("b", "payment").depends_on(["a"]),
                Step::new("c", "payment").depends_on(["b"]),
            ],
        );
        let outcome = coordinator(&transport, fast_engine_config())
            .execute_run(&plan)
            .await;

        let report = &outcome.report;
        assert_eq!(report.status_of("a"), Some(StepStatus::Failed));
        assert_eq!(report.status_of("b"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("c"), Some(StepStatus::Skipped));
        assert_eq!(transport.calls_for("b"), 0);
        assert_eq!(transport.calls_for("c"), 0);
        assert_eq!(
            report.steps["c"].skip_cause,
            Some(SkipCause::Upstream {
                dependency: "b".into(),
                root: "a".into()
            })
        );
        assert_eq!(
            report.steps["b"].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::SkippedDueToDependency)
        );
        assert_eq!(report.failed_steps, vec!["a"]);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn retry_budget_caps_attempts() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("flaky", (0..5).map(|_| Reply::reject("busy")).collect());
        let plan = WorkflowPlan::new(
            "retry",
            vec![Step::new("flaky", "parts").with_policy(FailurePolicy::Retry, 2)],
        );
        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;

        assert_eq!(transport.calls_for("flaky"), 3);
        assert_eq!(report.steps["flaky"].attempts, 3);
        assert_eq!(report.status_of("flaky"), Some(StepStatus::Failed));
    }

    #[tokio::test]
    async fn timeouts_count_against_retry_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("slow", vec![Reply::Hang, Reply::Hang, Reply::Hang]);
        let plan = WorkflowPlan::new(
            "timeouts",
            vec![Step::new("slow", "parts")
                .with_policy(FailurePolicy::Retry, 2)
                .with_timeout(Duration::from_millis(20))],
        );
        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;

        assert_eq!(transport.calls_for("slow"), 3);
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(report.steps["slow"].attempts, 3);
        assert_eq!(report.status_of("slow"), Some(StepStatus::Failed));
        assert_eq!(
            report.steps["slow"].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn out_of_range_timeout_rejects_plan() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut step = Step::new("a", "parts");
        step.timeout_seconds = 1e20;
        let plan = WorkflowPlan::new("huge_timeout", vec![step]);
        let outcome = coordinator(&transport, fast_engine_config())
            .execute_run(&plan)
            .await;

        assert!(!outcome.report.success);
        assert!(outcome.report.summary.contains("out of range"));
        assert_eq!(outcome.report.status_of("a"), Some(StepStatus::Pending));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn steps_start_only_after_dependencies_finish() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.delay_all(Duration::from_millis(5));
        transport.delay_step("validate_part", Duration::from_millis(30));
        let plan = repair_order_plan(FailurePolicy::Abort);

        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;
        assert!(report.success);

        let marks = transport.marks();
        for step in &plan.steps {
            let started = position(&marks, &CallMark::Started(step.step_id.clone()));
            for dep in &step.depends_on {
                let finished = position(&marks, &CallMark::Finished(dep.clone()));
                assert!(finished < started, "{} started before {} finished", step.step_id, dep);
            }
        }
    }

    #[tokio::test]
    async fn wave_members_run_concurrently() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.delay_all(Duration::from_millis(40));
        let plan = WorkflowPlan::new(
            "parallel",
            vec![
                Step::new("a", "parts"),
                Step::new("b", "parts"),
                Step::new("c", "payment"),
            ],
        );
        coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;
        assert_eq!(transport.max_in_flight(), 3);
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_respected() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.delay_all(Duration::from_millis(10));
        let steps = (0..6).map(|i| Step::new(format!("s{i}"), "parts")).collect();
        let plan = WorkflowPlan::new("wide", steps);
        let config = EngineConfig {
            max_concurrency: 2,
            ..fast_engine_config()
        };

        let report = coordinator(&transport, config).execute(&plan).await;
        assert!(report.success);
        assert_eq!(transport.call_count(), 6);
        assert!(transport.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn bound_context_reaches_descendants() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "validate_ro",
            vec![Reply::success(serde_json::json!({"roNumber": "RO_001", "customerEmail": "abc@gmail.com"}))],
        );
        transport.script(
            "validate_part",
            vec![Reply::success(serde_json::json!({"partNumber": "PART_001", "stock": 4}))],
        );
        let plan = repair_order_plan(FailurePolicy::Abort);

        let outcome = coordinator(&transport, fast_engine_config())
            .execute_run(&plan)
            .await;
        assert!(outcome.report.success);
        assert_eq!(outcome.context.len(), 4);

        let reserve = transport
            .calls()
            .into_iter()
            .find(|c| c.step_id == "reserve_part")
            .unwrap();
        assert_eq!(reserve.request.context["repair_order"]["roNumber"], "RO_001");
        assert_eq!(reserve.request.context["part"]["stock"], 4);
    }

    #[tokio::test]
    async fn binding_to_unfinished_step_fails_without_invoking() {
        let transport = Arc::new(ScriptedTransport::new());
        // b binds a's output but does not depend on it; both run in wave one.
        let plan = WorkflowPlan::new(
            "unbound",
            vec![Step::new("a", "parts"), Step::new("b", "payment").bind("a", "part")],
        );
        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;

        assert_eq!(report.status_of("b"), Some(StepStatus::Failed));
        assert_eq!(report.steps["b"].attempts, 0);
        assert_eq!(
            report.steps["b"].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::MissingContextBinding)
        );
        assert_eq!(transport.calls_for("b"), 0);
    }

    #[tokio::test]
    async fn policy_skip_keeps_run_successful() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("optional", vec![Reply::reject("no"), Reply::reject("still no")]);
        let plan = WorkflowPlan::new(
            "optional",
            vec![
                Step::new("optional", "parts").with_policy(FailurePolicy::Skip, 1),
                Step::new("after", "payment").depends_on(["optional"]),
                Step::new("other", "repair_orders"),
            ],
        );
        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;

        assert_eq!(report.steps["optional"].attempts, 2);
        assert_eq!(report.status_of("optional"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("after"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("other"), Some(StepStatus::Succeeded));
        assert!(report.failed_steps.is_empty());
        assert!(report.success);
    }

    #[tokio::test]
    async fn unhealthy_agent_fails_without_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = RunCoordinator::new(
            Arc::new(MockDirectory::automotive().unhealthy("payment")),
            transport.clone(),
            fast_engine_config(),
        );
        let plan = WorkflowPlan::new("down", vec![Step::new("pay", "payment")]);
        let report = coordinator.execute(&plan).await;

        assert_eq!(report.status_of("pay"), Some(StepStatus::Failed));
        assert_eq!(
            report.steps["pay"].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::AgentUnavailable)
        );
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn plan_abort_mode_stops_unstarted_steps() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a", vec![Reply::reject("fatal")]);
        transport.delay_step("b", Duration::from_millis(30));
        let plan = WorkflowPlan::new(
            "abort_all",
            vec![
                Step::new("a", "parts"),
                Step::new("b", "repair_orders"),
                Step::new("queued", "payment"),
                Step::new("later", "payment").depends_on(["b"]),
            ],
        );
        let config = EngineConfig {
            max_concurrency: 2,
            abort_mode: AbortMode::Plan,
            ..fast_engine_config()
        };
        let coordinator = coordinator(&transport, config);
        let mut rx = coordinator.event_bus().subscribe();
        let report = coordinator.execute(&plan).await;

        assert_eq!(report.status_of("a"), Some(StepStatus::Failed));
        // Already in flight when the abort was raised.
        assert_eq!(report.status_of("b"), Some(StepStatus::Succeeded));
        assert_eq!(report.status_of("queued"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("later"), Some(StepStatus::Skipped));
        assert_eq!(
            report.steps["later"].skip_cause,
            Some(SkipCause::Aborted { trigger: "a".into() })
        );
        assert_eq!(transport.calls_for("queued"), 0);
        assert_eq!(transport.calls_for("later"), 0);
        assert!(!report.success);

        let mut aborts = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::AbortRaised { .. }) {
                aborts += 1;
            }
        }
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn branch_abort_mode_spares_independent_steps() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("validate_part", vec![Reply::reject("Part PART_001 not found")]);
        let plan = repair_order_plan(FailurePolicy::Abort);
        let report = coordinator(&transport, fast_engine_config())
            .execute(&plan)
            .await;

        assert_eq!(report.status_of("reserve_part"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("create_payment"), Some(StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = coordinator(&transport, fast_engine_config());
        let mut rx = coordinator.event_bus().subscribe();
        let outcome = coordinator
            .execute_run(&repair_order_plan(FailurePolicy::Abort))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), &outcome.run_id);
            events.push(event);
        }
        assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { steps: 4, .. })));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::RunComplete { success: true, .. })
        ));
        let waves = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::WaveStarted { .. }))
            .count();
        assert_eq!(waves, 2);
        let finished = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepFinished { .. }))
            .count();
        assert_eq!(finished, 4);
    }
}
