//! Deployment orchestration
//!
//! Sequences mapping, analysis, generation, testing and git phases for each
//! recommendation, schedules batches in dependency order and records the
//! outcome in the progress file and the batch report.

pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod types;

pub use lifecycle::{Lifecycle, LifecycleEvent, Phase};
pub use orchestrator::{DeploymentOrchestrator, OrchestratorParts, OrchestratorSettings};
pub use progress::{ProgressEntry, ProgressError, ProgressFile, ProgressStore};
pub use report::BatchReport;
pub use types::{DeploymentMode, DeploymentResult, DeploymentStatus, Outcome};
