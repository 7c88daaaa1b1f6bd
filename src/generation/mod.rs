//! AI code generation
//!
//! Capability traits for the external code and test generators, the HTTP and
//! command-line backends that implement them, prompt construction, and the
//! retrying implementer that validates generated source.

pub mod backends;
pub mod capability;
pub mod implementer;
pub mod prompt;

pub use backends::{CommandGenerationBackend, HttpGenerationBackend};
pub use capability::{CallLimits, CapabilityError, CodeGenerator, GenerationRequest, TestGenerator};
pub use implementer::{with_provenance, AiCodeImplementer, CodeArtifact, ImplementerSettings, TestArtifact};
pub use prompt::{extract_code, PromptBuilder};
