//! Code integration analysis
//!
//! Looks at the mapped destination and its neighbors to decide how new code
//! should be integrated and what it should reuse.

pub mod analyzer;
pub mod similarity;

pub use analyzer::{
    AnalyzerSettings, CodeIntegrationAnalyzer, IntegrationAnalysis, IntegrationStrategy,
    SimilarSymbol,
};
pub use similarity::QueryTokens;
