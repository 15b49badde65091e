use thiserror::Error;

use crate::types::StepStatus;

#[derive(Debug, Error)]
pub enum TorqueError {
    // Plan errors
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Invalid plan: {0}")]
    PlanInvalid(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step {step} references unknown step {missing}")]
    UnknownStep { step: String, missing: String },

    #[error("Dependency cycle detected: {}", steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    // Execution state errors
    #[error("Invalid transition for step {step}: {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Context already written for step: {0}")]
    ContextAlreadyWritten(String),

    #[error("Unknown step: {0}")]
    StepNotFound(String),

    // Directory errors
    #[error("Agent not found in directory: {0}")]
    AgentNotFound(String),

    // Transport errors
    #[error("Agent transport error: {agent}: {message}")]
    Transport { agent: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TorqueError {
    /// Step ids named by a cycle error, empty for every other variant.
    pub fn cycle_steps(&self) -> &[String] {
        match self {
            TorqueError::Cycle { steps } => steps,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, TorqueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = TorqueError::Cycle {
            steps: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert_eq!(err.cycle_steps().len(), 3);
    }

    #[test]
    fn non_cycle_has_no_steps() {
        let err = TorqueError::DuplicateStep("x".into());
        assert!(err.cycle_steps().is_empty());
    }
}
