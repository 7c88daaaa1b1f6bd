//! Scripted collaborators and throw-away git repositories for orchestrator
//! integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use git2::{BranchType, Repository, RepositoryInitOptions, Signature, StatusOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use rec_deploy::analysis::AnalyzerSettings;
use rec_deploy::deployment::{OrchestratorParts, OrchestratorSettings, ProgressStore};
use rec_deploy::generation::{CapabilityError, GenerationRequest, ImplementerSettings};
use rec_deploy::git::{
    ExistingPullRequest, Git2VersionControl, PullRequestSpec, RetryPolicy,
};
use rec_deploy::inventory::{CachedInventory, EmptyInventory};
use rec_deploy::lang::TargetLanguage;
use rec_deploy::process::{CommandError, CommandExecutor, CommandOutput, CommandSpec};
use rec_deploy::recommendations::{Recommendation, RecommendationLoader};
use rec_deploy::safety::SafetySettings;
use rec_deploy::structure::{MapperSettings, ProjectScanner};
use rec_deploy::testing::TestRunnerSettings;
use rec_deploy::{
    AiCodeImplementer, CodeGenerator, CodeIntegrationAnalyzer, DeploymentOrchestrator,
    GitOperationError, GitWorkflowManager, ProjectStructureMapper, PullRequestHost,
    SafetyManager, TestGenerator, TestGeneratorRunner,
};

pub const GENERATED_CODE: &str = "def compute_metric(values):\n    return sum(values) / max(len(values), 1)\n";
pub const GENERATED_TESTS: &str = "from metric import compute_metric\n\n\ndef test_compute_metric():\n    assert compute_metric([2, 4]) == 3\n";
pub const BROKEN_CODE: &str = "def compute_metric(values:\n    return\n";

pub fn pytest_summary(passed: u32, failed: u32) -> String {
    if failed == 0 {
        format!("..........\n{passed} passed in 0.12s\n")
    } else {
        format!("..F.\nFAILED tests/test_x.py::test_edge\n{failed} failed, {passed} passed in 0.31s\n")
    }
}

/// Build one validated recommendation the way the loader would.
pub fn recommendation(id: &str, title: &str) -> Recommendation {
    recommendation_with(serde_json::json!({
        "id": id,
        "title": title,
        "description": format!("{title} for the weekly analytics report"),
        "category": "metrics",
        "priority": "high",
    }))
}

pub fn recommendation_with(value: serde_json::Value) -> Recommendation {
    let mut outcome = RecommendationLoader::new().load_values(vec![value]);
    assert!(outcome.rejected.is_empty(), "fixture record rejected: {:?}", outcome.rejected);
    outcome.valid.remove(0)
}

/// Code generator that returns unparsable source for any prompt mentioning
/// one of `failing`, and valid source otherwise.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub failing: Vec<String>,
    pub code_calls: AtomicUsize,
    pub test_calls: AtomicUsize,
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate_code(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|marker| request.prompt.contains(marker.as_str())) {
            return Ok(format!("```python\n{BROKEN_CODE}```"));
        }
        Ok(format!("Here is the module:\n```python\n{GENERATED_CODE}```\n"))
    }
}

#[async_trait]
impl TestGenerator for ScriptedGenerator {
    async fn generate_tests(
        &self,
        _request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        self.test_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GENERATED_TESTS.to_string())
    }
}

/// Holds the test runner until the test releases it.
#[derive(Default)]
pub struct RunnerGate {
    pub started: Notify,
    pub release: Notify,
}

/// Test runner that answers with a canned summary chosen by a substring of
/// the generated test file name.
pub struct ScriptedRunner {
    pub outcomes: Vec<(String, String)>,
    pub default_output: String,
    pub calls: Mutex<Vec<CommandSpec>>,
    pub gate: Option<Arc<RunnerGate>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
            default_output: pytest_summary(10, 0),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedRunner {
    async fn execute(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        self.calls.lock().unwrap().push(spec.clone());
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            tokio::select! {
                _ = gate.release.notified() => {}
                _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            }
        }
        let stdout = self
            .outcomes
            .iter()
            .find(|(marker, _)| spec.args.iter().any(|a| a.contains(marker.as_str())))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| self.default_output.clone());
        let status_code = if stdout.contains("failed") { 1 } else { 0 };
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr: String::new(),
        })
    }
}

/// In-memory pull request host.
#[derive(Default)]
pub struct FakeHost {
    pub opened: Mutex<Vec<PullRequestSpec>>,
    pub existing: Vec<ExistingPullRequest>,
    pub fail_open: bool,
}

#[async_trait]
impl PullRequestHost for FakeHost {
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<String, GitOperationError> {
        if self.fail_open {
            return Err(GitOperationError::Hosting {
                operation: "create pull request",
                message: "Validation Failed".into(),
                retryable: false,
            });
        }
        let mut opened = self.opened.lock().unwrap();
        opened.push(spec.clone());
        Ok(format!("https://github.com/acme/analytics/pull/{}", opened.len()))
    }

    async fn find_pull_requests(&self, head_prefix: &str) -> Result<Vec<ExistingPullRequest>, GitOperationError> {
        Ok(self
            .existing
            .iter()
            .filter(|pr| pr.head.starts_with(head_prefix))
            .cloned()
            .collect())
    }
}

/// A committed repository on `main` with a bare `origin` next to it.
pub struct TestRepo {
    dir: TempDir,
    remote: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&root, &opts).unwrap();
        Repository::init_bare(remote.path()).unwrap();
        repo.remote("origin", remote.path().to_str().unwrap()).unwrap();

        let files = [
            (".gitignore", ".rec-deploy/\n__pycache__/\n"),
            ("README.md", "# analytics\n"),
            ("src/__init__.py", ""),
            ("src/metrics/__init__.py", ""),
            (
                "src/metrics/scoring.py",
                "def shooting_score(made, attempts):\n    return made / attempts if attempts else 0.0\n",
            ),
            ("tests/__init__.py", ""),
        ];
        for (path, content) in files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }

        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Fixture", "fixture@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();

        Self { dir, remote, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn repo(&self) -> Repository {
        Repository::open(&self.root).unwrap()
    }

    pub fn branches(&self) -> Vec<String> {
        let repo = self.repo();
        let mut names: Vec<String> = repo
            .branches(Some(BranchType::Local))
            .unwrap()
            .filter_map(|b| b.ok()?.0.name().ok().flatten().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Deployment branches, `main` excluded.
    pub fn deployment_branches(&self) -> Vec<String> {
        self.branches().into_iter().filter(|b| b != "main").collect()
    }

    pub fn remote_branches(&self) -> Vec<String> {
        let repo = Repository::open_bare(self.remote.path()).unwrap();
        let mut names: Vec<String> = repo
            .branches(Some(BranchType::Local))
            .unwrap()
            .filter_map(|b| b.ok()?.0.name().ok().flatten().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Uncommitted paths in the working tree, ignored files excluded.
    pub fn dirty(&self) -> Vec<String> {
        let repo = self.repo();
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts)).unwrap();
        statuses
            .iter()
            .filter_map(|s| s.path().map(str::to_string))
            .collect()
    }

    pub fn head_branch(&self) -> String {
        self.repo().head().unwrap().shorthand().unwrap().to_string()
    }

    /// Content of `path` at the tip of `branch`.
    pub fn file_on_branch(&self, branch: &str, path: &str) -> Option<String> {
        let repo = self.repo();
        let branch = repo.find_branch(branch, BranchType::Local).ok()?;
        let tree = branch.get().peel_to_tree().ok()?;
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }

    /// Paths added by the tip commit of `branch` relative to `main`.
    pub fn files_changed_on(&self, branch: &str) -> Vec<String> {
        let repo = self.repo();
        let base = repo.find_branch("main", BranchType::Local).unwrap().get().peel_to_tree().unwrap();
        let tip = repo.find_branch(branch, BranchType::Local).unwrap().get().peel_to_tree().unwrap();
        let diff = repo.diff_tree_to_tree(Some(&base), Some(&tip), None).unwrap();
        diff.deltas()
            .filter_map(|d| d.new_file().path().map(|p| p.to_string_lossy().to_string()))
            .collect()
    }
}

/// Knobs for one orchestrator under test.
pub struct Harness {
    pub generator: Arc<ScriptedGenerator>,
    pub runner: Arc<ScriptedRunner>,
    pub host: Option<Arc<FakeHost>>,
    pub pass_threshold: f64,
    pub allow_below_threshold: bool,
    pub breaker_threshold: u32,
    pub max_concurrency: usize,
    pub skip_existing: bool,
    pub resume: bool,
    pub retain_failed_branches: bool,
    pub base_branch: String,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            generator: Arc::new(ScriptedGenerator::default()),
            runner: Arc::new(ScriptedRunner::default()),
            host: None,
            pass_threshold: 0.9,
            allow_below_threshold: false,
            breaker_threshold: 3,
            max_concurrency: 1,
            skip_existing: false,
            resume: false,
            retain_failed_branches: false,
            base_branch: "main".into(),
        }
    }
}

impl Harness {
    pub fn failing_generation(mut self, markers: &[&str]) -> Self {
        self.generator = Arc::new(ScriptedGenerator {
            failing: markers.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        });
        self
    }

    pub fn runner_outputs(mut self, outcomes: &[(&str, String)]) -> Self {
        self.runner = Arc::new(ScriptedRunner {
            outcomes: outcomes.iter().map(|(m, o)| (m.to_string(), o.clone())).collect(),
            ..Default::default()
        });
        self
    }

    /// Runner that blocks every test run on the returned gate.
    pub fn gated_runner(mut self) -> (Self, Arc<RunnerGate>) {
        let gate = Arc::new(RunnerGate::default());
        self.runner = Arc::new(ScriptedRunner {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        (self, gate)
    }

    pub fn with_host(mut self, host: FakeHost) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    pub fn build(&self, repo: &TestRepo) -> DeploymentOrchestrator {
        let root = repo.path().to_path_buf();
        let ignore = vec![".rec-deploy".to_string(), "__pycache__".to_string()];
        let language = TargetLanguage::Python;

        let index = ProjectScanner::new(ignore.clone(), language).scan(&root).unwrap();
        let mapper = ProjectStructureMapper::new(
            Arc::new(index),
            MapperSettings {
                default_dir: PathBuf::from("src"),
                language,
                max_suffix: 100,
            },
        );
        let analyzer = CodeIntegrationAnalyzer::new(&root, language, AnalyzerSettings::default());
        let implementer = AiCodeImplementer::new(
            self.generator.clone(),
            ImplementerSettings {
                max_attempts: 2,
                ..Default::default()
            },
        );
        let tester = TestGeneratorRunner::new(
            self.generator.clone(),
            self.runner.clone(),
            &root,
            TestRunnerSettings {
                pass_threshold: self.pass_threshold,
                allow_below_threshold: self.allow_below_threshold,
                timeout: Duration::from_secs(30),
                ignore_patterns: ignore,
                ..Default::default()
            },
        );

        let vcs = Git2VersionControl::new(&root, "origin", None);
        let host = self.host.clone().map(|h| h as Arc<dyn PullRequestHost>);
        let git = Arc::new(
            GitWorkflowManager::new(Arc::new(vcs), host, self.base_branch.clone())
                .with_retry(RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    jitter: false,
                })
                .with_call_timeout(Duration::from_secs(30))
                .with_labels(vec!["automated".into()]),
        );
        let safety = SafetyManager::new(
            &root,
            SafetySettings {
                min_free_bytes: 0,
                required_binaries: Vec::new(),
                backup_dir: PathBuf::from(".rec-deploy/backups"),
                state_dirs: vec![PathBuf::from(".rec-deploy")],
                circuit_breaker_threshold: self.breaker_threshold,
                rollback_timeout: Duration::from_secs(30),
            },
            git.clone(),
        );

        DeploymentOrchestrator::new(OrchestratorParts {
            progress: Some(ProgressStore::new(root.join(".rec-deploy/progress.json"))),
            repo_root: root,
            mapper,
            analyzer,
            implementer,
            tester,
            git,
            safety,
            inventory: CachedInventory::new(Arc::new(EmptyInventory), Duration::from_secs(60)),
            settings: OrchestratorSettings {
                max_concurrency: self.max_concurrency,
                skip_existing: self.skip_existing,
                resume: self.resume,
                retain_failed_branches: self.retain_failed_branches,
                staging_dir: PathBuf::from(".rec-deploy/staging"),
            },
        })
    }
}
