//! Test generation and isolated execution
//!
//! Generated tests never touch the live working tree: they are written into
//! a temporary copy of the repository together with the generated code and
//! run there as a subprocess.

pub mod output;
pub mod runner;
pub mod workspace;

pub use output::{parse_test_output, TestCounts};
pub use runner::{import_path, TestGeneratorRunner, TestOutcome, TestRunnerSettings};
pub use workspace::{checked_relative, IsolatedWorkspace};
