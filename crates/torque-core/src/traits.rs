use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Where an agent lives and whether it is currently accepting work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub name: String,
    pub address: String,
    pub healthy: bool,
}

/// Request sent to an agent for a single step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: String,
    pub instruction: serde_json::Value,
    /// Bound upstream outputs, keyed by binding name. May be empty.
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl AgentRequest {
    /// Request ids have the form `{run_id}:{step_id}:{attempt}`.
    pub fn compose_id(run_id: &str, step_id: &str, attempt: u32) -> String {
        format!("{}:{}:{}", run_id, step_id, attempt)
    }

    /// Step id embedded in `request_id`, if it has the composed form.
    pub fn step_id(&self) -> Option<&str> {
        let (_, rest) = self.request_id.split_once(':')?;
        let (step, _) = rest.rsplit_once(':')?;
        Some(step)
    }

    /// Attempt number embedded in `request_id`.
    pub fn attempt(&self) -> Option<u32> {
        let (_, attempt) = self.request_id.rsplit_once(':')?;
        attempt.parse().ok()
    }
}

/// Agent reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Service directory: logical agent name to endpoint.
///
/// Read-only from the engine's point of view for the duration of a run.
pub trait ServiceDirectory: Send + Sync + 'static {
    /// Resolve an agent. Returns `TorqueError::AgentNotFound` if unknown.
    fn resolve(&self, agent_name: &str) -> Result<AgentEndpoint>;

    /// All known endpoints, sorted by name.
    fn endpoints(&self) -> Vec<AgentEndpoint>;
}

/// Agent transport: one synchronous RPC-style call.
pub trait AgentTransport: Send + Sync + 'static {
    /// Deliver `request` to `endpoint`. Transport-level failures are `Err`;
    /// an agent that answered (even with `success = false`) is `Ok`.
    fn call(
        &self,
        endpoint: &AgentEndpoint,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_defaults() {
        let resp: AgentResponse = serde_json::from_str(r#"{"success": false, "error": "Repair Order Not Found"}"#).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Repair Order Not Found"));
        assert!(resp.result.is_null());
    }

    #[test]
    fn request_id_parts() {
        let req = AgentRequest {
            request_id: AgentRequest::compose_id("run-1", "reserve:part", 3),
            instruction: serde_json::Value::Null,
            context: serde_json::Map::new(),
        };
        assert_eq!(req.step_id(), Some("reserve:part"));
        assert_eq!(req.attempt(), Some(3));

        let opaque = AgentRequest {
            request_id: "plain".into(),
            ..req
        };
        assert_eq!(opaque.step_id(), None);
        assert_eq!(opaque.attempt(), None);
    }

    #[test]
    fn request_serializes_empty_context() {
        let req = AgentRequest {
            request_id: "r/a/1".into(),
            instruction: serde_json::json!("validate RO_001"),
            context: serde_json::Map::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["context"], serde_json::json!({}));
    }
}
