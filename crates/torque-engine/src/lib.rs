pub mod aggregator;
pub mod context;
pub mod coordinator;
pub mod directory;
pub mod graph;
pub mod invoker;
pub mod retry;
pub mod run_log;
pub mod state;
pub mod transport;

pub use aggregator::ResultAggregator;
pub use context::ExecutionContext;
pub use coordinator::{RunCoordinator, RunOutcome};
pub use directory::StaticDirectory;
pub use graph::DependencyGraph;
pub use invoker::StepInvoker;
pub use retry::{RetryController, StepOutcome};
pub use run_log::RunLogger;
pub use state::RunState;
pub use transport::HttpTransport;
