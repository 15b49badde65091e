pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TorqueError};
pub use event::EventBus;
pub use plan::{FailurePolicy, RiskLevel, Step, WorkflowPlan};
pub use types::*;
