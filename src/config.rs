use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lang::TargetLanguage;

/// Main configuration structure for rec-deploy
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// Target repository layout
    pub repository: RepositoryConfig,
    /// Code-generation backend
    pub generation: GenerationConfig,
    /// Generated test execution and the pass-rate gate
    pub testing: TestingConfig,
    /// Local git behaviour
    pub git: GitConfig,
    /// Pull request hosting
    pub hosting: HostingConfig,
    pub safety: SafetyConfig,
    /// Batch scheduling, progress and reports
    pub pipeline: PipelineConfig,
    pub inventory: InventoryConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root of the repository recommendations are deployed into
    pub path: PathBuf,
    pub language: TargetLanguage,
    /// Where new files go when no directory matches the category
    pub default_dir: PathBuf,
    /// Directory names skipped when scanning and copying
    pub ignore_patterns: Vec<String>,
    /// Highest numeric suffix tried when a destination name is taken
    pub max_suffix: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            language: TargetLanguage::Python,
            default_dir: PathBuf::from("src"),
            ignore_patterns: [
                ".git",
                ".rec-deploy",
                "node_modules",
                "__pycache__",
                ".venv",
                "venv",
                "target",
                "dist",
                "build",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_suffix: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackendKind {
    /// OpenAI-compatible chat-completions endpoint
    Http,
    /// External program fed the prompt on stdin
    Command,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub backend: GenerationBackendKind,
    pub base_url: String,
    pub model: String,
    /// API key (can be set via REC_DEPLOY_API_KEY)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Program and arguments for the command backend
    pub command: Vec<String>,
    pub max_attempts: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_prompt_chars: usize,
    pub timeout_seconds: u64,
    pub requests_per_minute: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackendKind::Http,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            command: Vec::new(),
            max_attempts: 3,
            temperature: 0.1,
            max_output_tokens: 4096,
            max_prompt_chars: 24_000,
            timeout_seconds: 120,
            requests_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Runner invocation; `{test_file}` is replaced with the generated file
    pub command: Vec<String>,
    pub timeout_seconds: u64,
    pub pass_threshold: f64,
    /// Let deployments through the gate regardless of pass rate
    pub allow_below_threshold: bool,
    pub max_generation_attempts: u32,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            command: ["python", "-m", "pytest", "-q", "{test_file}"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_seconds: 300,
            pass_threshold: 0.9,
            allow_below_threshold: false,
            max_generation_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    pub base_branch: String,
    /// Attempts per git or hosting call, the first one included
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_seconds: u64,
    pub call_timeout_seconds: u64,
    /// Labels added to every pull request
    pub labels: Vec<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_seconds: 30,
            call_timeout_seconds: 120,
            labels: vec!["automated".to_string(), "recommendation".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HostingConfig {
    /// GitHub API token (can be set via GITHUB_TOKEN)
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Repository owner; inferred from the remote URL when unset
    pub owner: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub min_free_mb: u64,
    /// Programs that must be on PATH before anything is mutated
    pub required_binaries: Vec<String>,
    pub backup_dir: PathBuf,
    pub circuit_breaker_threshold: u32,
    pub rollback_timeout_seconds: u64,
    /// Keep a local branch for deployments blocked by the test gate
    pub retain_failed_branches: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_free_mb: 512,
            required_binaries: Vec::new(),
            backup_dir: PathBuf::from(".rec-deploy/backups"),
            circuit_breaker_threshold: 3,
            rollback_timeout_seconds: 60,
            retain_failed_branches: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub recommendations_file: PathBuf,
    pub max_concurrency: usize,
    pub max_deployments: Option<usize>,
    pub skip_existing: bool,
    /// Skip ids the progress file records as done in this mode or a stronger one
    pub resume: bool,
    pub progress_file: PathBuf,
    pub staging_dir: PathBuf,
    pub report_output: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recommendations_file: PathBuf::from("recommendations.json"),
            max_concurrency: 1,
            max_deployments: None,
            skip_existing: false,
            resume: false,
            progress_file: PathBuf::from(".rec-deploy/progress.json"),
            staging_dir: PathBuf::from(".rec-deploy/staging"),
            report_output: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// JSON inventory summary; an empty inventory is used when unset
    pub file: Option<PathBuf>,
    pub cache_ttl_seconds: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            file: None,
            cache_ttl_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl DeployerConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. rec-deploy.toml in the working directory
    /// 3. The explicit `--config` file
    /// 4. Environment variables (prefixed with REC_DEPLOY__)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&DeployerConfig::default()).context("invalid built-in defaults")?);

        if Path::new("rec-deploy.toml").exists() {
            builder = builder.add_source(File::with_name("rec-deploy"));
        }

        if let Some(path) = explicit {
            if !path.exists() {
                bail!("configuration file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("REC_DEPLOY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: DeployerConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        // Secrets fall back to well-known variables
        if config.hosting.token.is_none() {
            config.hosting.token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        }
        if config.generation.api_key.is_none() {
            config.generation.api_key = std::env::var("REC_DEPLOY_API_KEY").ok().filter(|k| !k.is_empty());
        }

        Ok(config)
    }

    /// Reject settings no run could work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.testing.pass_threshold) {
            bail!(
                "testing.pass_threshold must be between 0 and 1, got {}",
                self.testing.pass_threshold
            );
        }
        if self.pipeline.max_concurrency == 0 {
            bail!("pipeline.max_concurrency must be at least 1");
        }
        if self.generation.max_attempts == 0 {
            bail!("generation.max_attempts must be at least 1");
        }
        if self.testing.max_generation_attempts == 0 {
            bail!("testing.max_generation_attempts must be at least 1");
        }
        if self.testing.command.is_empty() {
            bail!("testing.command must name a program");
        }
        if self.git.retry_attempts == 0 {
            bail!("git.retry_attempts must be at least 1");
        }
        if self.generation.backend == GenerationBackendKind::Command && self.generation.command.is_empty() {
            bail!("generation.command is required for the command backend");
        }
        if self.safety.circuit_breaker_threshold == 0 {
            bail!("safety.circuit_breaker_threshold must be at least 1");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Resolve a configured path against the repository root.
    pub fn repo_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repository.path.join(path)
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.timeout_seconds)
    }
}
