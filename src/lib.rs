// rec-deploy library - recommendation-driven code deployment
// This exposes the core components for testing and integration

pub mod analysis;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod deployment;
pub mod error;
pub mod generation;
pub mod git;
pub mod inventory;
pub mod lang;
pub mod priority;
pub mod process;
pub mod recommendations;
pub mod safety;
pub mod shutdown;
pub mod structure;
pub mod telemetry;
pub mod testing;
pub mod text;

// Re-export key types for easy access
pub use analysis::{CodeIntegrationAnalyzer, IntegrationAnalysis, IntegrationStrategy};
pub use config::DeployerConfig;
pub use deployment::{
    BatchReport, DeploymentMode, DeploymentOrchestrator, DeploymentResult, DeploymentStatus,
    OrchestratorParts, OrchestratorSettings,
};
pub use error::DeploymentError;
pub use generation::{AiCodeImplementer, CodeArtifact, CodeGenerator, TestArtifact, TestGenerator};
pub use git::{GitOperationError, GitWorkflowManager, PullRequestHost, VersionControl};
pub use priority::Priority;
pub use recommendations::{Recommendation, RecommendationLoader};
pub use safety::{CircuitBreaker, SafetyManager};
pub use shutdown::ShutdownCoordinator;
pub use structure::{FileMapping, ProjectStructureMapper};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use testing::TestGeneratorRunner;
