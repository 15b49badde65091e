use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TorqueError};

/// Top-level Torque configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Static service directory, keyed by logical agent name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

/// How an abort-policy failure affects the rest of the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortMode {
    /// Only the failed step's descendants are skipped.
    #[default]
    Branch,
    /// Every step that has not started yet is skipped.
    Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on concurrently running steps within a wave.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub abort_mode: AbortMode,
    /// Path appended to an agent's address for step invocations.
    #[serde(default = "default_invoke_path")]
    pub invoke_path: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            abort_mode: AbortMode::default(),
            invoke_path: default_invoke_path(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_invoke_path() -> String { "/invoke".to_string() }

/// Backoff between step retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based). Exponential, capped,
    /// never decreasing as `retry` grows.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(ms)
    }
}

fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 5000 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.torque/logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run and wave events, 2 = plus step results, 3 = plus every attempt.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.torque/logs".to_string() }
fn default_log_level() -> u8 { 2 }

/// One entry of the static service directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL, e.g. `http://localhost:3002`.
    pub address: String,
    /// Initial health flag before any probe.
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_healthy() -> bool { true }
fn default_health_path() -> String { "/health".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TorqueError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| TorqueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(TorqueError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        for (name, agent) in &self.agents {
            if agent.address.trim().is_empty() {
                return Err(TorqueError::Config(format!(
                    "agents.{} has an empty address",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    tracing::warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TORQUE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TORQUE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TORQUE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TORQUE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TORQUE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.abort_mode, AbortMode::Branch);
        assert_eq!(config.engine.invoke_path, "/invoke");
        assert_eq!(config.engine.retry.initial_backoff_ms, 200);
        assert!(config.log.is_none());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_agent_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[agents.payment]
address = "http://localhost:3002"
"#,
        )
        .unwrap();
        let payment = &config.agents["payment"];
        assert!(payment.healthy);
        assert_eq!(payment.health_path, "/health");
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 450,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(450));
        assert_eq!(retry.backoff(60), Duration::from_millis(450));

        let mut last = Duration::ZERO;
        for n in 1..40 {
            let d = retry.backoff(n);
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config: AppConfig = toml::from_str("[engine]\nmax_concurrency = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
