use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use torque_core::config::AppConfig;
use torque_core::error::{Result, TorqueError};
use torque_core::traits::{AgentEndpoint, ServiceDirectory};

/// Service directory built from the `[agents.*]` config sections.
///
/// Immutable once built; `probe_health` returns a fresh snapshot rather than
/// mutating in place, so a run always sees a consistent directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    endpoints: BTreeMap<String, AgentEndpoint>,
    health_paths: BTreeMap<String, String>,
}

impl StaticDirectory {
    pub fn new(endpoints: Vec<AgentEndpoint>) -> Self {
        let health_paths = endpoints
            .iter()
            .map(|e| (e.name.clone(), "/health".to_string()))
            .collect();
        let endpoints = endpoints.into_iter().map(|e| (e.name.clone(), e)).collect();
        Self {
            endpoints,
            health_paths,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut endpoints = BTreeMap::new();
        let mut health_paths = BTreeMap::new();
        for (name, agent) in &config.agents {
            endpoints.insert(
                name.clone(),
                AgentEndpoint {
                    name: name.clone(),
                    address: agent.address.trim_end_matches('/').to_string(),
                    healthy: agent.healthy,
                },
            );
            health_paths.insert(name.clone(), agent.health_path.clone());
        }
        Self {
            endpoints,
            health_paths,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Probe every agent's health endpoint and return an updated snapshot.
    /// An agent is healthy iff the probe answers 2xx within `timeout`.
    pub async fn probe_health(&self, client: &reqwest::Client, timeout: Duration) -> Self {
        let probes = self.endpoints.values().map(|endpoint| {
            let path = self
                .health_paths
                .get(&endpoint.name)
                .map(String::as_str)
                .unwrap_or("/health");
            let url = format!("{}{}", endpoint.address, path);
            async move {
                let healthy = match client.get(&url).timeout(timeout).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        warn!(agent = %endpoint.name, url = %url, error = %e, "Health probe failed");
                        false
                    }
                };
                debug!(agent = %endpoint.name, healthy, "Health probe complete");
                AgentEndpoint {
                    healthy,
                    ..endpoint.clone()
                }
            }
        });

        let probed = join_all(probes).await;
        let healthy = probed.iter().filter(|e| e.healthy).count();
        info!(agents = probed.len(), healthy, "Service directory refreshed");

        Self {
            endpoints: probed.into_iter().map(|e| (e.name.clone(), e)).collect(),
            health_paths: self.health_paths.clone(),
        }
    }
}

impl ServiceDirectory for StaticDirectory {
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
