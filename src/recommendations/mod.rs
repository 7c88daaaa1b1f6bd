//! Recommendation records: the input unit of the pipeline.
//!
//! Records are produced by an external analysis pipeline and are immutable
//! once loaded. The loader validates each record independently so that a
//! malformed record is reported without failing the rest of the batch.

pub mod loader;
pub mod ordering;
pub mod types;

pub use loader::{LoadError, LoadOutcome, RecommendationLoader, RejectedRecord, ValidationError};
pub use ordering::{DependencyPlan, plan_waves};
pub use types::{DataRequirements, DateRange, Recommendation};
