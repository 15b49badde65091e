//! Mocks and fixtures shared by Torque tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use torque_core::config::{EngineConfig, RetryConfig};
use torque_core::error::{Result, TorqueError};
use torque_core::plan::{FailurePolicy, Step, WorkflowPlan};
use torque_core::traits::{AgentEndpoint, AgentRequest, AgentResponse, AgentTransport, ServiceDirectory};

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// In-memory service directory. Every agent resolves to `mock://{name}`.
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    endpoints: BTreeMap<String, AgentEndpoint>,
}

impl MockDirectory {
    pub fn with_agents<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = names
            .into_iter()
            .map(|n| {
                let name = n.into();
                let endpoint = AgentEndpoint {
                    address: format!("mock://{}", name),
                    name: name.clone(),
                    healthy: true,
                };
                (name, endpoint)
            })
            .collect();
        Self { endpoints }
    }

    /// The three automotive agents.
    pub fn automotive() -> Self {
        Self::with_agents(["repair_orders", "parts", "payment"])
    }

    pub fn unhealthy(mut self, name: &str) -> Self {
        if let Some(endpoint) = self.endpoints.get_mut(name) {
            endpoint.healthy = false;
        }
        self
    }
}

impl ServiceDirectory for MockDirectory {
    fn resolve(&self, agent_name: &str) -> Result<AgentEndpoint> {
        self.endpoints
            .get(agent_name)
            .cloned()
            .ok_or_else(|| TorqueError::AgentNotFound(agent_name.to_string()))
    }

    fn endpoints(&self) -> Vec<AgentEndpoint> {
        self.endpoints.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Success(serde_json::Value),
    Reject(String),
    /// Transport-level failure.
    Unreachable(String),
    /// Never answers.
    Hang,
}

impl Reply {
    pub fn success(result: serde_json::Value) -> Self {
        Reply::Success(result)
    }

    pub fn reject(error: impl Into<String>) -> Self {
        Reply::Reject(error.into())
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Reply::Unreachable(message.into())
    }
}

/// A call observed by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub step_id: String,
    pub agent: String,
    pub attempt: u32,
    pub request: AgentRequest,
}

/// Start and finish marks, in the order calls began and ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallMark {
    Started(String),
    Finished(String),
}

/// Transport that answers from per-step scripts.
///
/// Replies are consumed in order per `step_id`. Once a step's script is
/// exhausted (or if it has none) the call succeeds with
/// `{"step": step_id, "agent": agent}`.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<CallRecord>>,
    marks: Mutex<Vec<CallMark>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `step_id`.
    pub fn script(&self, step_id: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .extend(replies);
    }

    /// Delay every reply for `step_id`.
    pub fn delay_step(&self, step_id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(step_id.to_string(), delay);
    }

    /// Delay every reply without a step-specific delay.
    pub fn delay_all(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_id == step_id)
            .count()
    }

    /// Distinct steps that were invoked at least once.
    pub fn invoked_steps(&self) -> HashSet<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.step_id.clone())
            .collect()
    }

    pub fn marks(&self) -> Vec<CallMark> {
        self.marks.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, step_id: &str) -> Option<Reply> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(step_id)
            .and_then(|q| q.pop_front())
    }

    fn delay_for(&self, step_id: &str) -> Option<Duration> {
        self.delays
            .lock()
            .unwrap()
            .get(step_id)
            .copied()
            .or(*self.default_delay.lock().unwrap())
    }
}

/// Releases an in-flight slot even when a timed-out call is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AgentTransport for ScriptedTransport {
    fn call(
        &self,
        endpoint: &AgentEndpoint,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let agent = endpoint.name.clone();
        let step_id = request
            .step_id()
            .unwrap_or(&request.request_id)
            .to_string();

        Box::pin(async move {
            self.calls.lock().unwrap().push(CallRecord {
                step_id: step_id.clone(),
                agent: agent.clone(),
                attempt: request.attempt().unwrap_or(0),
                request,
            });
            self.marks
                .lock()
                .unwrap()
                .push(CallMark::Started(step_id.clone()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _in_flight = InFlightGuard(&self.in_flight);

            let reply = self.next_reply(&step_id);
            let delay = self.delay_for(&step_id);

            if matches!(reply, Some(Reply::Hang)) {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.marks
                .lock()
                .unwrap()
                .push(CallMark::Finished(step_id.clone()));

            match reply {
                Some(Reply::Success(result)) => Ok(AgentResponse::ok(result)),
                Some(Reply::Reject(error)) => Ok(AgentResponse::rejected(error)),
                Some(Reply::Unreachable(message)) => Err(TorqueError::Transport { agent, message }),
                Some(Reply::Hang) => unreachable!("hung call resumed"),
                None => Ok(AgentResponse::ok(
                    serde_json::json!({ "step": step_id, "agent": agent }),
                )),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Engine config with zero backoff, for tests that exercise retries.
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        },
        ..EngineConfig::default()
    }
}

/// Validate a repair order and a part, reserve the part, and send a payment
/// link. `validate_part` carries the given failure policy.
pub fn repair_order_plan(part_policy: FailurePolicy) -> WorkflowPlan {
    WorkflowPlan::new(
        "add_part_and_payment_link",
        vec![
            Step::new("validate_ro", "repair_orders")
                .with_instruction(serde_json::json!("Validate repair order RO_001"))
                .in_group("validate"),
            Step::new("validate_part", "parts")
                .with_instruction(serde_json::json!("Validate part PART_001"))
                .in_group("validate")
                .with_policy(part_policy, 0),
            Step::new("reserve_part", "parts")
                .with_instruction(serde_json::json!("Reserve PART_001 for RO_001"))
                .depends_on(["validate_ro", "validate_part"])
                .bind("validate_ro", "repair_order")
                .bind("validate_part", "part"),
            Step::new("create_payment", "payment")
                .with_instruction(serde_json::json!("Send a payment link of 100 USD"))
                .depends_on(["validate_ro"])
                .bind("validate_ro", "repair_order"),
        ],
    )
}
