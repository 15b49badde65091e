use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use torque_core::error::{Result, TorqueError};
use torque_core::traits::{AgentEndpoint, AgentRequest, AgentResponse, AgentTransport};

/// JSON-over-HTTP agent transport.
///
/// POSTs the request to `{address}{invoke_path}`. Any reply carrying the
/// `{success, result, error}` envelope is returned as-is, whatever the HTTP
/// status. A non-2xx reply without an envelope becomes a rejection; a 2xx
/// reply without one is a transport error.
pub struct HttpTransport {
    client: reqwest::Client,
    invoke_path: String,
}

impl HttpTransport {
    pub fn new(invoke_path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent("Torque/0.3")
            .build()
            .map_err(|e| TorqueError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, invoke_path))
    }

    pub fn with_client(client: reqwest::Client, invoke_path: impl Into<String>) -> Self {
        Self {
            client,
            invoke_path: invoke_path.into(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn url(&self, endpoint: &AgentEndpoint) -> String {
        format!(
            "{}{}",
            endpoint.address.trim_end_matches('/'),
            self.invoke_path
        )
    }
}

impl AgentTransport for HttpTransport {
    fn call(
        &self,
        endpoint: &AgentEndpoint,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let url = self.url(endpoint);
        let agent = endpoint.name.clone();

        Box::pin(async move {
            debug!(agent = %agent, url = %url, request_id = %request.request_id, "Calling agent");

            let resp = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| TorqueError::Transport {
                    agent: agent.clone(),
                    message: format!("Request failed: {}", e),
                })?;

            let status = resp.status();
            let body = resp.text().await.map_err(|e| TorqueError::Transport {
                agent: agent.clone(),
                message: format!("Failed to read response body: {}", e),
            })?;

            if let Ok(envelope) = serde_json::from_str::<AgentResponse>(&body) {
                return Ok(envelope);
            }

            if status.is_success() {
                return Err(TorqueError::Transport {
                    agent,
                    message: format!("Response is not an agent envelope: {}", truncate(&body, 200)),
                });
            }

            Ok(AgentResponse::rejected(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                truncate(&body, 200)
            )))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
