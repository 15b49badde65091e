use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use torque_core::plan::Step;
use torque_core::traits::{AgentRequest, AgentTransport, ServiceDirectory};
use torque_core::types::{ErrorKind, RawResult, RunId, StepError};

/// Sends one attempt of a step to its agent and normalizes the outcome.
///
/// Never touches step state; that belongs to the run coordinator.
pub struct StepInvoker {
    directory: Arc<dyn ServiceDirectory>,
    transport: Arc<dyn AgentTransport>,
}

impl StepInvoker {
    pub fn new(directory: Arc<dyn ServiceDirectory>, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// Invoke `step` once with its bound context.
    pub async fn invoke(
        &self,
        run_id: &RunId,
        step: &Step,
        context: &serde_json::Map<String, serde_json::Value>,
        attempt: u32,
    ) -> RawResult {
        let start = Instant::now();

        let endpoint = match self.directory.resolve(&step.target_agent) {
            Ok(endpoint) if endpoint.healthy => endpoint,
            Ok(_) => {
                warn!(step_id = %step.step_id, agent = %step.target_agent, "Agent marked unhealthy");
                return RawResult::failure(
                    StepError::new(
                        ErrorKind::AgentUnavailable,
                        format!("agent {} is marked unhealthy", step.target_agent),
                    ),
                    start.elapsed(),
                );
            }
            Err(e) => {
                warn!(step_id = %step.step_id, agent = %step.target_agent, error = %e, "Agent not resolvable");
                return RawResult::failure(
                    StepError::new(ErrorKind::AgentUnavailable, e.to_string()),
                    start.elapsed(),
                );
            }
        };

        let request = AgentRequest {
            request_id: AgentRequest::compose_id(&run_id.0, &step.step_id, attempt),
            instruction: step.instruction.clone(),
            context: context.clone(),
        };

        let timeout = step.timeout();
        let outcome = tokio::time::timeout(timeout, self.transport.call(&endpoint, request)).await;
        let elapsed = start.elapsed();

        let result = match outcome {
            Err(_) => RawResult::failure(
                StepError::new(
                    ErrorKind::Timeout,
                    format!("no response from {} within {:?}", endpoint.name, timeout),
                ),
                elapsed,
            ),
            Ok(Err(e)) => RawResult::failure(
                StepError::new(ErrorKind::AgentUnavailable, e.to_string()),
                elapsed,
            ),
            Ok(Ok(resp)) if resp.success => RawResult::success(resp.result, elapsed),
            Ok(Ok(resp)) => RawResult::failure(
                StepError::new(
                    ErrorKind::AgentRejected,
                    resp.error
                        .unwrap_or_else(|| "agent reported failure without an error message".into()),
                ),
                elapsed,
            ),
        };

        debug!(
            step_id = %step.step_id,
            agent = %endpoint.name,
            attempt,
            ok = result.ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Attempt finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use torque_test_utils::{MockDirectory, Reply, ScriptedTransport};

    fn invoker(dir: MockDirectory, transport: Arc<ScriptedTransport>) -> StepInvoker {
        StepInvoker::new(Arc::new(dir), transport)
    }

    #[tokio::test]
    async fn success_returns_payload() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("validate_ro", vec![Reply::success(serde_json::json!({"roNumber": "RO_001"}))]);
        let inv = invoker(MockDirectory::with_agents(["repair_orders"]), transport.clone());

        let step = Step::new("validate_ro", "repair_orders");
        let raw = inv
            .invoke(&RunId::from_string("r"), &step, &serde_json::Map::new(), 1)
            .await;
        assert!(raw.ok());
        assert_eq!(raw.outcome.unwrap()["roNumber"], "RO_001");

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].request.request_id, "r:validate_ro:1");
    }

    #[tokio::test]
    async fn unknown_agent_is_unavailable_without_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let inv = invoker(MockDirectory::with_agents(["parts"]), transport.clone());

        let step = Step::new("pay", "payment");
        let raw = inv
            .invoke(&RunId::new(), &step, &serde_json::Map::new(), 1)
            .await;
        assert_eq!(raw.outcome.unwrap_err().kind, ErrorKind::AgentUnavailable);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn unhealthy_agent_is_unavailable_without_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let dir = MockDirectory::with_agents(["parts"]).unhealthy("parts");
        let inv = invoker(dir, transport.clone());

        let raw = inv
            .invoke(&RunId::new(), &Step::new("a", "parts"), &serde_json::Map::new(), 1)
            .await;
        let err = raw.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentUnavailable);
        assert!(err.message.contains("unhealthy"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn rejection_keeps_agent_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a", vec![Reply::reject("Part PART_404 not found in catalog")]);
        let inv = invoker(MockDirectory::with_agents(["parts"]), transport);

        let raw = inv
            .invoke(&RunId::new(), &Step::new("a", "parts"), &serde_json::Map::new(), 1)
            .await;
        let err = raw.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentRejected);
        assert_eq!(err.message, "Part PART_404 not found in catalog");
    }

    #[tokio::test]
    async fn transport_error_is_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a", vec![Reply::unreachable("connection refused")]);
        let inv = invoker(MockDirectory::with_agents(["parts"]), transport);

        let raw = inv
            .invoke(&RunId::new(), &Step::new("a", "parts"), &serde_json::Map::new(), 1)
            .await;
        assert_eq!(raw.outcome.unwrap_err().kind, ErrorKind::AgentUnavailable);
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a", vec![Reply::Hang]);
        let inv = invoker(MockDirectory::with_agents(["parts"]), transport);

        let step = Step::new("a", "parts").with_timeout(Duration::from_millis(20));
        let raw = inv
            .invoke(&RunId::new(), &step, &serde_json::Map::new(), 1)
            .await;
        assert_eq!(raw.outcome.unwrap_err().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn context_and_instruction_are_forwarded() {
        let transport = Arc::new(ScriptedTransport::new());
        let inv = invoker(MockDirectory::with_agents(["payment"]), transport.clone());

        let mut ctx = serde_json::Map::new();
        ctx.insert("ro".into(), serde_json::json!({"customerEmail": "abc@gmail.com"}));
        let step = Step::new("create_payment", "payment")
            .with_instruction(serde_json::json!("Send a payment link of 100 USD"));
        inv.invoke(&RunId::new(), &step, &ctx, 2).await;

        let call = &transport.calls()[0];
        assert_eq!(call.request.instruction, "Send a payment link of 100 USD");
        assert_eq!(call.request.context["ro"]["customerEmail"], "abc@gmail.com");
        assert_eq!(call.request.attempt(), Some(2));
    }
}
