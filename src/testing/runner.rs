use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::output::{parse_test_output, TestCounts};
use super::workspace::IsolatedWorkspace;
use crate::error::DeploymentError;
use crate::generation::{
    extract_code, CapabilityError, CodeArtifact, GenerationRequest, PromptBuilder, TestArtifact,
    TestGenerator,
};
use crate::lang::{syntax_check, TargetLanguage};
use crate::process::{CommandError, CommandExecutor, CommandSpec};
use crate::recommendations::Recommendation;

const OUTPUT_TAIL_CHARS: usize = 2_000;

#[derive(Debug, Clone)]
pub struct TestRunnerSettings {
    pub language: TargetLanguage,
    /// Runner argv; `{test_file}` and `{workspace}` are substituted
    pub command: Vec<String>,
    pub timeout: Duration,
    pub pass_threshold: f64,
    /// Accept results below the threshold
    pub allow_below_threshold: bool,
    pub max_generation_attempts: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_prompt_chars: usize,
    pub ignore_patterns: Vec<String>,
}

impl Default for TestRunnerSettings {
    fn default() -> Self {
        Self {
            language: TargetLanguage::Python,
            command: vec![
                "python".into(),
                "-m".into(),
                "pytest".into(),
                "-q".into(),
                "{test_file}".into(),
            ],
            timeout: Duration::from_secs(300),
            pass_threshold: 0.9,
            allow_below_threshold: false,
            max_generation_attempts: 3,
            temperature: 0.1,
            max_output_tokens: 4096,
            max_prompt_chars: 24_000,
            ignore_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub artifact: TestArtifact,
    pub counts: TestCounts,
    pub pass_rate: f64,
    pub runner_exit_code: i32,
    /// Last part of the runner's combined output
    pub output_tail: String,
}

/// Generates tests for a code artifact and runs them in an isolated copy of
/// the repository.
pub struct TestGeneratorRunner {
    generator: Arc<dyn TestGenerator>,
    executor: Arc<dyn CommandExecutor>,
    repo_root: PathBuf,
    prompts: PromptBuilder,
    settings: TestRunnerSettings,
}

impl TestGeneratorRunner {
    pub fn new(
        generator: Arc<dyn TestGenerator>,
        executor: Arc<dyn CommandExecutor>,
        repo_root: impl Into<PathBuf>,
        settings: TestRunnerSettings,
    ) -> Self {
        let prompts = PromptBuilder::new(settings.language, settings.max_prompt_chars.saturating_sub(600));
        Self {
            generator,
            executor,
            repo_root: repo_root.into(),
            prompts,
            settings,
        }
    }

    pub fn pass_threshold(&self) -> f64 {
        self.settings.pass_threshold
    }

    /// Generate, write and run tests. Below-threshold results are returned as
    /// `DeploymentError::TestFailure` carrying the measured pass rate unless
    /// the override is set.
    pub async fn generate_and_run(
        &self,
        rec: &Recommendation,
        code: &CodeArtifact,
        cancel: &CancellationToken,
    ) -> Result<TestOutcome, DeploymentError> {
        let outcome = self.execute(rec, code, cancel).await?;
        self.gate(&outcome)?;
        Ok(outcome)
    }

    /// Generate, write and run tests without applying the pass-rate gate.
    #[instrument(skip_all, fields(recommendation.id = %rec.id))]
    pub async fn execute(
        &self,
        rec: &Recommendation,
        code: &CodeArtifact,
        cancel: &CancellationToken,
    ) -> Result<TestOutcome, DeploymentError> {
        let artifact = self.generate(rec, code, cancel).await?;

        let root = self.repo_root.clone();
        let ignore = self.settings.ignore_patterns.clone();
        let code_path = code.target_path.clone();
        let code_source = code.source.clone();
        let test_path = artifact.target_path.clone();
        let test_source = artifact.source.clone();
        let workspace = tokio::task::spawn_blocking(move || -> std::io::Result<IsolatedWorkspace> {
            let ws = IsolatedWorkspace::create(&root, &ignore)?;
            ws.write_file(&code_path, &code_source)?;
            ws.write_file(&test_path, &test_source)?;
            Ok(ws)
        })
        .await
        .map_err(|e| DeploymentError::TestFailure {
            pass_rate: None,
            detail: format!("workspace setup panicked: {e}"),
        })?
        .map_err(|e| DeploymentError::TestFailure {
            pass_rate: None,
            detail: format!("could not prepare isolated workspace: {e}"),
        })?;

        let spec = self.command_spec(workspace.path(), &artifact.target_path, &code.target_path)?;
        let output = self
            .executor
            .execute(&spec, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled => DeploymentError::Cancelled,
                other => DeploymentError::TestFailure {
                    pass_rate: None,
                    detail: format!("test runner failed: {other}"),
                },
            })?;
        drop(workspace);

        let combined = output.combined();
        let tail = tail_chars(&combined, OUTPUT_TAIL_CHARS);
        let counts = parse_test_output(&combined).ok_or_else(|| DeploymentError::TestFailure {
            pass_rate: None,
            detail: format!(
                "could not read a test summary from runner output (exit {}): {}",
                output.status_code,
                tail_chars(&combined, 300)
            ),
        })?;
        let pass_rate = counts.pass_rate();

        info!(
            passed = counts.passed,
            failed = counts.failed,
            errors = counts.errors,
            pass_rate,
            threshold = self.settings.pass_threshold,
            "Generated tests executed"
        );

        Ok(TestOutcome {
            artifact,
            counts,
            pass_rate,
            runner_exit_code: output.status_code,
            output_tail: tail,
        })
    }

    pub fn gate(&self, outcome: &TestOutcome) -> Result<(), DeploymentError> {
        let pass_rate = outcome.pass_rate;
        if pass_rate >= self.settings.pass_threshold {
            return Ok(());
        }
        if self.settings.allow_below_threshold {
            warn!(pass_rate, "Pass rate below threshold accepted by override");
            return Ok(());
        }
        Err(DeploymentError::TestFailure {
            pass_rate: Some(pass_rate),
            detail: format!(
                "pass rate {:.2} below threshold {:.2} ({} of {} passed)",
                pass_rate,
                self.settings.pass_threshold,
                outcome.counts.passed,
                outcome.counts.executed()
            ),
        })
    }

    async fn generate(
        &self,
        rec: &Recommendation,
        code: &CodeArtifact,
        cancel: &CancellationToken,
    ) -> Result<TestArtifact, DeploymentError> {
        let language = self.settings.language;
        let module = import_path(&code.target_path, language);
        let target_path = language.test_path_for(&code.target_path);
        let max_attempts = self.settings.max_generation_attempts.max(1);
        let mut feedback = Vec::new();
        let mut last_problem = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(DeploymentError::Cancelled);
            }
            let request = GenerationRequest {
                system: self.prompts.test_system(),
                prompt: self.prompts.test_prompt(rec, &code.source, &module, &feedback),
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_output_tokens,
            };
            let response = match self.generator.generate_tests(&request, cancel).await {
                Ok(response) => response,
                Err(CapabilityError::Cancelled) => return Err(DeploymentError::Cancelled),
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Test generation call failed");
                    last_problem = e.to_string();
                    continue;
                }
                Err(e) => {
                    return Err(DeploymentError::TestFailure {
                        pass_rate: None,
                        detail: format!("test generation failed: {e}"),
                    })
                }
            };

            let source = extract_code(&response, language);
            match syntax_check(&source, language) {
                Ok(()) => {
                    return Ok(TestArtifact {
                        source,
                        target_path,
                        syntax_valid: true,
                        generation_attempts: attempt,
                    })
                }
                Err(issue) => {
                    warn!(attempt, error = %issue, "Generated tests failed to parse");
                    last_problem = issue.to_string();
                    feedback.push(format!("The tests did not parse: {issue}"));
                }
            }
        }

        Err(DeploymentError::TestFailure {
            pass_rate: None,
            detail: format!("no usable tests after {max_attempts} attempt(s): {last_problem}"),
        })
    }

    fn command_spec(
        &self,
        workspace: &Path,
        test_file: &Path,
        code_file: &Path,
    ) -> Result<CommandSpec, DeploymentError> {
        let ws = workspace.to_string_lossy();
        let test = test_file.to_string_lossy();
        let mut argv = self
            .settings
            .command
            .iter()
            .map(|arg| arg.replace("{test_file}", &test).replace("{workspace}", &ws));
        let program = argv.next().ok_or_else(|| DeploymentError::TestFailure {
            pass_rate: None,
            detail: "test command is empty".into(),
        })?;

        let mut spec = CommandSpec::new(program, self.settings.timeout)
            .args(argv)
            .current_dir(workspace);
        if self.settings.language == TargetLanguage::Python {
            spec = spec.env("PYTHONPATH", python_path(workspace, code_file));
            spec = spec.env("PYTHONDONTWRITEBYTECODE", "1");
        }
        Ok(spec)
    }
}

/// Dotted module path for Python (`src/` prefix dropped), crate path for Rust.
pub fn import_path(target: &Path, language: TargetLanguage) -> String {
    let without_ext = target.with_extension("");
    let parts: Vec<String> = without_ext
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .map(str::to_string)
        .collect();
    let parts = match parts.split_first() {
        Some((first, rest)) if first == "src" && !rest.is_empty() => rest.to_vec(),
        _ => parts,
    };
    match language {
        TargetLanguage::Python => parts.join("."),
        TargetLanguage::Rust => format!("crate::{}", parts.join("::")),
    }
}

fn python_path(workspace: &Path, code_file: &Path) -> String {
    let mut entries = vec![workspace.to_string_lossy().to_string()];
    if code_file.starts_with("src") {
        entries.push(workspace.join("src").to_string_lossy().to_string());
    }
    entries.join(":")
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max)).collect()
}
