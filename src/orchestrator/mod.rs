pub mod runner;
pub mod state;

pub use runner::{BuildOrchestrator, OrchestratorSettings};
pub use state::{BuildMetrics, BuildStatus, FailureReport};
