//! Project structure mapping
//!
//! Scans the destination codebase into a categorized directory index and
//! decides where each recommendation's implementation should live.

pub mod mapper;
pub mod scanner;

pub use mapper::{is_related, FileMapping, MapperSettings, MappingError, ProjectStructureMapper};
pub use scanner::{Category, DirectoryEntry, DirectoryIndex, ProjectScanner};

/// Header line written into generated files so later runs can recognise
/// which recommendation produced them.
pub fn provenance_marker(recommendation_id: &str) -> String {
    format!("Recommendation: {recommendation_id}")
}
