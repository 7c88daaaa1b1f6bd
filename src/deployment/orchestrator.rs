use anyhow::Context;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::lifecycle::{Lifecycle, LifecycleEvent};
use super::progress::{ProgressFile, ProgressStore};
use super::report::BatchReport;
use super::types::{DeploymentMode, DeploymentResult, DeploymentStatus};
use crate::analysis::{AnalyzerSettings, CodeIntegrationAnalyzer};
use crate::config::{DeployerConfig, GenerationBackendKind};
use crate::error::DeploymentError;
use crate::generation::{
    AiCodeImplementer, CallLimits, CodeArtifact, CodeGenerator, CommandGenerationBackend,
    HttpGenerationBackend, ImplementerSettings, TestGenerator,
};
use crate::git::{
    commit_message, parse_github_url, pull_request_body, pull_request_title, BranchCreation,
    FileChange, Git2VersionControl, GitHubPullRequests, GitWorkflowManager, PullRequestHost,
    RetryPolicy, TestSummary,
};
use crate::inventory::{CachedInventory, EmptyInventory, InventoryProvider, JsonFileInventory};
use crate::process::{CommandExecutor, ProcessCommandExecutor};
use crate::recommendations::{plan_waves, Recommendation, RejectedRecord};
use crate::safety::{CheckResult, RollbackScope, SafetyCheckpoint, SafetyManager, SafetySettings};
use crate::structure::{FileMapping, MapperSettings, MappingError, ProjectScanner, ProjectStructureMapper};
use crate::testing::{checked_relative, TestGeneratorRunner, TestOutcome, TestRunnerSettings};
use crate::text::slugify;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrency: usize,
    /// Skip recommendations that already have an open or merged deployment
    pub skip_existing: bool,
    /// Skip recommendations the progress file records as done in this mode
    pub resume: bool,
    /// Keep a local commit for deployments blocked by the test gate
    pub retain_failed_branches: bool,
    /// Dry-run output root; relative paths are resolved against the repository
    pub staging_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            skip_existing: false,
            resume: false,
            retain_failed_branches: true,
            staging_dir: PathBuf::from(".rec-deploy/staging"),
        }
    }
}

/// Everything the orchestrator drives. Built by
/// [`DeploymentOrchestrator::from_config`] or assembled directly in tests.
pub struct OrchestratorParts {
    pub repo_root: PathBuf,
    pub mapper: ProjectStructureMapper,
    pub analyzer: CodeIntegrationAnalyzer,
    pub implementer: AiCodeImplementer,
    pub tester: TestGeneratorRunner,
    pub git: Arc<GitWorkflowManager>,
    pub safety: SafetyManager,
    pub inventory: CachedInventory,
    pub progress: Option<ProgressStore>,
    pub settings: OrchestratorSettings,
}

/// Per-item outcome plus the reason the whole run must stop, if any.
struct ItemOutcome {
    result: DeploymentResult,
    fatal: Option<String>,
}

/// State a failing deployment needs to undo its own work.
struct Attempt {
    result: DeploymentResult,
    lifecycle: Lifecycle,
    checkpoint: Option<SafetyCheckpoint>,
    restored: bool,
    branch_created: Option<String>,
    pushed: bool,
}

impl Attempt {
    fn advance(&mut self, event: LifecycleEvent) {
        if !self.lifecycle.advance(event.clone()) {
            warn!(event = ?event, phase = ?self.lifecycle.phase(), "Lifecycle rejected event");
        }
    }
}

/// Releases a claimed destination path when dropped.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.path);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sequences every phase for one recommendation and schedules batches.
pub struct DeploymentOrchestrator {
    repo_root: PathBuf,
    mapper: ProjectStructureMapper,
    analyzer: CodeIntegrationAnalyzer,
    implementer: AiCodeImplementer,
    tester: TestGeneratorRunner,
    git: Arc<GitWorkflowManager>,
    safety: SafetyManager,
    inventory: CachedInventory,
    progress: Option<ProgressStore>,
    settings: OrchestratorSettings,
    /// Destinations claimed by in-flight deployments
    reserved: Mutex<HashSet<PathBuf>>,
}

impl DeploymentOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            repo_root: parts.repo_root,
            mapper: parts.mapper,
            analyzer: parts.analyzer,
            implementer: parts.implementer,
            tester: parts.tester,
            git: parts.git,
            safety: parts.safety,
            inventory: parts.inventory,
            progress: parts.progress,
            settings: parts.settings,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    async fn load_progress(&self) -> ProgressFile {
        let Some(store) = self.progress.clone() else {
            return ProgressFile::default();
        };
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(Ok(progress)) => progress,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read progress file; treating it as empty");
                ProgressFile::default()
            }
            Err(e) => {
                warn!(error = %e, "Progress read panicked");
                ProgressFile::default()
            }
        }
    }

    async fn save_progress(&self, result: &DeploymentResult) {
        let Some(store) = self.progress.clone() else {
            return;
        };
        let result = result.clone();
        match tokio::task::spawn_blocking(move || store.record(&[result])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Could not update progress file"),
            Err(e) => warn!(error = %e, "Progress write panicked"),
        }
    }

    /// Deploy a single recommendation.
    pub async fn run(
        &self,
        rec: &Recommendation,
        mode: DeploymentMode,
        cancel: &CancellationToken,
    ) -> (DeploymentResult, Option<String>) {
        self.safety.breaker().reset();
        let progress = self.load_progress().await;
        let outcome = self.run_item(rec, mode, &progress, cancel).await;
        self.save_progress(&outcome.result).await;
        (outcome.result, outcome.fatal)
    }

    /// Deploy a batch in dependency order, at most `max_deployments` items.
    /// Records rejected by the loader are reported as `failed_validation`.
    pub async fn run_batch(
        &self,
        recommendations: Vec<Recommendation>,
        rejected: &[RejectedRecord],
        max_deployments: Option<usize>,
        mode: DeploymentMode,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let run_id = crate::telemetry::generate_correlation_id();
        let started_at = chrono::Utc::now();
        let span = info_span!("batch", run_id = %run_id, mode = %mode);
        async {
            self.safety.breaker().reset();
            let run_token = cancel.child_token();
            let progress = self.load_progress().await;

            let mut results: Vec<DeploymentResult> = rejected
                .iter()
                .map(|r| {
                    DeploymentResult::terminal(
                        r.report_id(),
                        mode,
                        DeploymentStatus::FailedValidation,
                        Some(r.error.to_string()),
                    )
                })
                .collect();

            let mut plan = plan_waves(&recommendations);
            if let Some(max) = max_deployments {
                plan.truncate(max);
            }
            for (rec, pending) in &plan.cyclic {
                results.push(DeploymentResult::terminal(
                    rec.id.clone(),
                    mode,
                    DeploymentStatus::FailedValidation,
                    Some(format!("dependency cycle through {}", pending.join(", "))),
                ));
            }
            info!(
                items = plan.len(),
                waves = plan.waves.len(),
                rejected = rejected.len(),
                "Starting batch"
            );

            let in_batch: HashSet<&str> = recommendations.iter().map(|r| r.id.as_str()).collect();
            let mut statuses: HashMap<String, DeploymentStatus> = HashMap::new();
            let mut abort_reason: Option<String> = None;
            let concurrency = self.settings.max_concurrency.max(1);

            for wave in &plan.waves {
                let mut runnable = Vec::new();
                for rec in wave {
                    let blocked = rec.dependencies.iter().find(|dep| {
                        in_batch.contains(dep.as_str())
                            && !statuses.get(dep.as_str()).is_some_and(|s| s.is_ok())
                    });
                    match blocked {
                        Some(dep) => {
                            let result = DeploymentResult::terminal(
                                rec.id.clone(),
                                mode,
                                DeploymentStatus::FailedValidation,
                                Some(format!("prerequisite {dep} did not succeed")),
                            );
                            statuses.insert(rec.id.clone(), result.status);
                            results.push(result);
                        }
                        None => runnable.push(rec),
                    }
                }

                let outcomes: Vec<ItemOutcome> = stream::iter(runnable)
                    .map(|rec| {
                        let run_token = run_token.clone();
                        let progress = &progress;
                        async move {
                            let outcome = self.run_item(rec, mode, progress, &run_token).await;
                            if outcome.fatal.is_some() {
                                run_token.cancel();
                            }
                            self.save_progress(&outcome.result).await;
                            outcome
                        }
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;

                for outcome in outcomes {
                    if abort_reason.is_none() {
                        abort_reason = outcome.fatal.clone();
                    }
                    statuses.insert(outcome.result.recommendation_id.clone(), outcome.result.status);
                    results.push(outcome.result);
                }
            }

            // keep input order in the report
            let position: HashMap<&str, usize> = recommendations
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id.as_str(), i))
                .collect();
            results.sort_by_key(|r| position.get(r.recommendation_id.as_str()).copied().unwrap_or(0));

            let report = BatchReport::new(
                run_id.clone(),
                mode,
                started_at,
                results,
                self.safety.breaker().snapshot(),
                abort_reason,
            );
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                aborted = report.aborted,
                "Batch finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn run_item(
        &self,
        rec: &Recommendation,
        mode: DeploymentMode,
        progress: &ProgressFile,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let mut attempt = Attempt {
            result: DeploymentResult::pending(rec.id.clone(), mode),
            lifecycle: Lifecycle::new(rec.id.clone()),
            checkpoint: None,
            restored: false,
            branch_created: None,
            pushed: false,
        };
        let span = info_span!(
            "deployment",
            recommendation.id = %rec.id,
            correlation_id = %attempt.result.correlation_id,
            mode = %mode,
        );
        async move {
            if cancel.is_cancelled() {
                return self.finish(attempt, DeploymentStatus::SkippedCircuitOpen, Some("run cancelled".into()));
            }
            if self.safety.breaker().is_open() {
                return self.finish(
                    attempt,
                    DeploymentStatus::SkippedCircuitOpen,
                    Some("circuit breaker open".into()),
                );
            }
            if let Some(skip) = self.existing_deployment(rec, mode, progress, cancel).await {
                return match skip {
                    Ok((detail, url)) => {
                        attempt.result.pull_request_url = url;
                        self.finish(attempt, DeploymentStatus::SkippedExisting, Some(detail))
                    }
                    Err(e) => self.fail(attempt, e).await,
                };
            }

            let item_token = cancel.child_token();
            match self.deploy(rec, mode, &mut attempt, &item_token).await {
                Ok(status) => {
                    self.safety.breaker().record_success();
                    if let Some(checkpoint) = attempt.checkpoint.take() {
                        self.safety.release(&checkpoint).await;
                    }
                    self.finish(attempt, status, None)
                }
                Err(e) => self.fail(attempt, e).await,
            }
        }
        .instrument(span)
        .await
    }

    fn finish(&self, mut attempt: Attempt, status: DeploymentStatus, detail: Option<String>) -> ItemOutcome {
        attempt.advance(LifecycleEvent::Finish(status));
        attempt.result.finish(status, detail);
        info!(status = %status, "Deployment finished");
        ItemOutcome {
            result: attempt.result,
            fatal: None,
        }
    }

    /// Roll back whatever the attempt did, account for the failure and build
    /// the terminal result.
    async fn fail(&self, mut attempt: Attempt, e: DeploymentError) -> ItemOutcome {
        let mut status = e.status();
        let mut detail = match &e {
            DeploymentError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };
        if let DeploymentError::TestFailure {
            pass_rate: Some(rate), ..
        } = &e
        {
            attempt.result.test_pass_rate = Some(*rate);
        }

        let checkpoint = attempt.checkpoint.take();
        let needs_restore = checkpoint.is_some() && !attempt.restored;
        let mut restore_failed = false;
        if needs_restore || attempt.branch_created.is_some() {
            let scope = RollbackScope {
                checkpoint: checkpoint.as_ref().filter(|_| needs_restore),
                branch: attempt.branch_created.as_deref(),
                pushed: attempt.pushed,
            };
            if let Err(rollback_error) = self.safety.rollback(scope).await {
                error!(error = %rollback_error, "Rollback failed");
                detail = format!("{detail}; rollback failed: {rollback_error}");
                restore_failed = true;
            }
            if attempt.branch_created.is_some() {
                attempt.result.branch_name = None;
                attempt.result.commit_sha = None;
                attempt.result.pull_request_url = None;
            }
        }
        if let Some(checkpoint) = &checkpoint {
            // a failed restore keeps its backups for manual recovery
            if !restore_failed {
                self.safety.release(checkpoint).await;
            }
        }

        if e.counts_as_failure() {
            self.safety.breaker().record_failure();
        }
        if restore_failed {
            status = DeploymentStatus::RolledBack;
        }

        let fatal = if e.is_batch_fatal() || restore_failed {
            error!(reason = %detail, "Safety violation; aborting run");
            self.safety.breaker().trip(detail.clone());
            Some(detail.clone())
        } else {
            None
        };
        match &e {
            DeploymentError::Validation(_) | DeploymentError::MappingConflict { .. } => {
                warn!(error = %e, "Deployment rejected")
            }
            _ => error!(error = %e, status = %status, "Deployment failed"),
        }
        attempt.advance(LifecycleEvent::Finish(status));
        attempt.result.finish(status, Some(detail));
        ItemOutcome {
            result: attempt.result,
            fatal,
        }
    }

    /// `Some` when the recommendation must not be deployed again.
    async fn existing_deployment(
        &self,
        rec: &Recommendation,
        mode: DeploymentMode,
        progress: &ProgressFile,
        cancel: &CancellationToken,
    ) -> Option<Result<(String, Option<String>), DeploymentError>> {
        if self.settings.resume && progress.completed(&rec.id, mode) {
            let url = progress.entries.get(&rec.id).and_then(|e| e.pull_request_url.clone());
            return Some(Ok((format!("already deployed in {mode} mode"), url)));
        }
        if !self.settings.skip_existing {
            return None;
        }
        if progress.deployed_with_pr(&rec.id) {
            let url = progress.entries.get(&rec.id).and_then(|e| e.pull_request_url.clone());
            return Some(Ok(("already deployed with a pull request".into(), url)));
        }
        match self.git.find_existing(&rec.title, cancel).await {
            Ok(Some(pr)) => Some(Ok((
                format!("pull request #{} already {:?}", pr.number, pr.state).to_lowercase(),
                Some(pr.url),
            ))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }

    async fn deploy(
        &self,
        rec: &Recommendation,
        mode: DeploymentMode,
        attempt: &mut Attempt,
        cancel: &CancellationToken,
    ) -> Result<DeploymentStatus, DeploymentError> {
        let pre_checks = self.safety.pre_check(mode.mutates_git(), cancel).await?;

        let (mapping, reservation) = self.map(rec, None)?;
        attempt.result.target_path = Some(mapping.relative_path.clone());
        attempt.advance(LifecycleEvent::Mapped);

        let inventory = self.inventory.summary_or_empty().await;
        let mut analysis = self.analyzer.analyze(rec, &mapping, &inventory)?;
        let (mapping, _reservation) = if analysis.conflict_flag {
            warn!(
                path = %mapping.relative_path.display(),
                "Destination holds unrelated code; choosing another name"
            );
            let (remapped, renamed) = self.map(rec, Some(&mapping))?;
            drop(reservation);
            analysis = self.analyzer.analyze(rec, &remapped, &inventory)?;
            if analysis.conflict_flag {
                return Err(DeploymentError::MappingConflict {
                    path: remapped.relative_path.clone(),
                    reason: "destination still holds unrelated code after renaming".into(),
                });
            }
            attempt.result.target_path = Some(remapped.relative_path.clone());
            (remapped, renamed)
        } else {
            (mapping, reservation)
        };
        attempt.advance(LifecycleEvent::Analyzed);

        let code = self
            .implementer
            .implement(rec, &mapping, &analysis, &inventory, cancel)
            .await?;
        attempt.advance(LifecycleEvent::Generated);

        let tests = self.tester.execute(rec, &code, cancel).await?;
        attempt.result.test_pass_rate = Some(tests.pass_rate);
        attempt.advance(LifecycleEvent::Tested);

        if let Err(gate) = self.tester.gate(&tests) {
            if mode.mutates_git() && self.settings.retain_failed_branches {
                if let Err(e) = self.retain_failed(rec, attempt, &code, &tests, pre_checks, cancel).await {
                    if e.is_batch_fatal() {
                        return Err(e);
                    }
                    // the caller rolls back whatever the retention left behind
                    warn!(error = %e, "Could not retain failing deployment");
                }
            }
            return Err(gate);
        }
        attempt.advance(LifecycleEvent::Gated);

        if !mode.mutates_git() {
            let staging = self.stage(attempt, &code, &tests).await?;
            info!(staging = %staging.display(), "Dry run output staged");
            attempt.result.staging_path = Some(staging);
            return Ok(DeploymentStatus::DryRunComplete);
        }

        let summary = self.summary(&tests);
        let message = commit_message(rec, &[code.target_path.clone(), tests.artifact.target_path.clone()], Some(&summary));
        self.commit_to_branch(rec, attempt, &code, &tests, &message, pre_checks, cancel)
            .await?;
        attempt.advance(LifecycleEvent::Committed);

        if !mode.uses_network() {
            return Ok(DeploymentStatus::Succeeded);
        }

        let branch = attempt.result.branch_name.clone().unwrap_or_default();
        self.safety.breaker().ensure_closed()?;
        self.git.push(&branch, cancel).await?;
        attempt.pushed = true;
        attempt.advance(LifecycleEvent::Pushed);

        self.safety.breaker().ensure_closed()?;
        let url = self
            .git
            .open_pull_request(
                &branch,
                &pull_request_title(rec),
                &pull_request_body(rec, &analysis, Some(&summary)),
                cancel,
            )
            .await?;
        attempt.result.pull_request_url = Some(url);
        attempt.advance(LifecycleEvent::PrOpened);
        Ok(DeploymentStatus::Succeeded)
    }

    fn summary(&self, tests: &TestOutcome) -> TestSummary {
        TestSummary {
            passed: tests.counts.passed,
            executed: tests.counts.executed(),
            pass_rate: tests.pass_rate,
            threshold: self.tester.pass_threshold(),
        }
    }

    /// Map `rec`, or move `previous` to a suffixed name, and claim the path.
    fn map(
        &self,
        rec: &Recommendation,
        previous: Option<&FileMapping>,
    ) -> Result<(FileMapping, Option<Reservation<'_>>), DeploymentError> {
        let mut claimed = lock(&self.reserved).clone();
        claimed.extend(self.safety.held_paths());
        let mapping = match previous {
            None => self.mapper.map(rec, &claimed),
            Some(previous) => self.mapper.remap_with_suffix(rec, previous, &claimed),
        }
        .map_err(|e| match e {
            MappingError::Exhausted { path, attempts } => DeploymentError::MappingConflict {
                path,
                reason: format!("no free name after {attempts} attempts"),
            },
        })?;

        // existing files are shared through the path lock instead
        if mapping.existing_file {
            return Ok((mapping, None));
        }
        let mut reserved = lock(&self.reserved);
        if !reserved.insert(mapping.relative_path.clone()) {
            return Err(DeploymentError::MappingConflict {
                path: mapping.relative_path.clone(),
                reason: "claimed by another deployment".into(),
            });
        }
        drop(reserved);
        let reservation = Reservation {
            set: &self.reserved,
            path: mapping.relative_path.clone(),
        };
        Ok((mapping, Some(reservation)))
    }

    fn files(code: &CodeArtifact, tests: &TestOutcome) -> Vec<FileChange> {
        vec![
            FileChange {
                path: code.target_path.clone(),
                content: code.source.clone(),
            },
            FileChange {
                path: tests.artifact.target_path.clone(),
                content: tests.artifact.source.clone(),
            },
        ]
    }

    async fn write_files(root: &Path, files: &[FileChange]) -> Result<(), DeploymentError> {
        for file in files {
            let target = root.join(checked_relative(&file.path)?);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
        }
        Ok(())
    }

    /// Dry run: write the artifacts under the staging directory only.
    async fn stage(
        &self,
        attempt: &Attempt,
        code: &CodeArtifact,
        tests: &TestOutcome,
    ) -> Result<PathBuf, DeploymentError> {
        self.safety.breaker().ensure_closed()?;
        let base = if self.settings.staging_dir.is_absolute() {
            self.settings.staging_dir.clone()
        } else {
            self.repo_root.join(&self.settings.staging_dir)
        };
        let staging = base.join(Self::attempt_key(&attempt.result));
        Self::write_files(&staging, &Self::files(code, tests)).await?;
        Ok(staging)
    }

    fn attempt_key(result: &DeploymentResult) -> String {
        let short: String = result.correlation_id.chars().take(8).collect();
        let id = slugify(&result.recommendation_id, '-', 40);
        if id.is_empty() {
            short
        } else {
            format!("{id}-{short}")
        }
    }

    /// Write the files into the working tree under a checkpoint, verify,
    /// commit them onto a fresh branch and restore the working tree.
    #[allow(clippy::too_many_arguments)]
    async fn commit_to_branch(
        &self,
        rec: &Recommendation,
        attempt: &mut Attempt,
        code: &CodeArtifact,
        tests: &TestOutcome,
        message: &str,
        pre_checks: Vec<CheckResult>,
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        let files = Self::files(code, tests);
        let mut paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        paths.dedup();

        // no writes once the breaker is open
        self.safety.breaker().ensure_closed()?;

        // sorted acquisition keeps two deployments from deadlocking
        let mut guards = Vec::with_capacity(paths.len());
        for path in &paths {
            guards.push(self.safety.lock_path(path, cancel).await?);
        }

        let before = self.safety.snapshot_dirty(cancel).await?;
        let checkpoint = self
            .safety
            .checkpoint(&Self::attempt_key(&attempt.result), paths.clone(), pre_checks)
            .await?;
        attempt.checkpoint = Some(checkpoint);

        self.safety.breaker().ensure_closed()?;
        Self::write_files(&self.repo_root, &files).await?;
        if let Some(checkpoint) = attempt.checkpoint.as_mut() {
            self.safety.post_check(checkpoint, &before, &paths, cancel).await?;
        }

        self.safety.breaker().ensure_closed()?;
        let branch = self.git.generate_branch_name(&rec.title);
        if self.git.create_branch(&branch, cancel).await? == BranchCreation::Created {
            attempt.branch_created = Some(branch.clone());
        }
        attempt.result.branch_name = Some(branch.clone());

        self.safety.breaker().ensure_closed()?;
        let sha = self.git.commit(&branch, &files, message, cancel).await?;
        attempt.result.commit_sha = Some(sha);

        if let Some(checkpoint) = &attempt.checkpoint {
            self.safety.restore(checkpoint).await?;
            attempt.restored = true;
        }
        drop(guards);
        info!(branch = %branch, "Committed deployment");
        Ok(())
    }

    /// Commit a deployment that failed the test gate so it can be inspected.
    /// The branch is local only.
    async fn retain_failed(
        &self,
        rec: &Recommendation,
        attempt: &mut Attempt,
        code: &CodeArtifact,
        tests: &TestOutcome,
        pre_checks: Vec<CheckResult>,
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        let summary = self.summary(tests);
        let message = commit_message(
            rec,
            &[code.target_path.clone(), tests.artifact.target_path.clone()],
            Some(&summary),
        );
        self.commit_to_branch(rec, attempt, code, tests, &message, pre_checks, cancel)
            .await?;
        // keep the branch through the failure path
        attempt.branch_created = None;
        if let Some(checkpoint) = attempt.checkpoint.take() {
            self.safety.release(&checkpoint).await;
        }
        info!(
            branch = attempt.result.branch_name.as_deref().unwrap_or_default(),
            pass_rate = tests.pass_rate,
            "Retained failing deployment on a local branch"
        );
        Ok(())
    }
}

impl DeploymentOrchestrator {
    /// Assemble the production collaborators: git2 on the configured
    /// repository, GitHub when a token is available, and the configured
    /// generation backend.
    pub fn from_config(config: &DeployerConfig) -> anyhow::Result<Self> {
        let root = config
            .repository
            .path
            .canonicalize()
            .with_context(|| format!("repository {} not found", config.repository.path.display()))?;
        let language = config.repository.language;
        let ignore = config.repository.ignore_patterns.clone();

        let index = ProjectScanner::new(ignore.clone(), language)
            .scan(&root)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        let mapper = ProjectStructureMapper::new(
            Arc::new(index),
            MapperSettings {
                default_dir: config.repository.default_dir.clone(),
                language,
                max_suffix: config.repository.max_suffix,
            },
        );
        let analyzer = CodeIntegrationAnalyzer::new(&root, language, AnalyzerSettings::default());

        let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor);
        let generation = &config.generation;
        let limits = CallLimits::new(
            generation.max_prompt_chars,
            config.generation_timeout(),
            generation.requests_per_minute,
        );
        let (coder, tester): (Arc<dyn CodeGenerator>, Arc<dyn TestGenerator>) = match generation.backend {
            GenerationBackendKind::Http => {
                let backend = Arc::new(HttpGenerationBackend::new(
                    &generation.base_url,
                    generation.model.clone(),
                    generation.api_key.clone(),
                    limits,
                )?);
                let coder: Arc<dyn CodeGenerator> = backend.clone();
                let tester: Arc<dyn TestGenerator> = backend;
                (coder, tester)
            }
            GenerationBackendKind::Command => {
                let backend = Arc::new(CommandGenerationBackend::new(
                    executor.clone(),
                    &generation.command,
                    limits,
                )?);
                let coder: Arc<dyn CodeGenerator> = backend.clone();
                let tester: Arc<dyn TestGenerator> = backend;
                (coder, tester)
            }
        };
        let implementer = AiCodeImplementer::new(
            coder,
            ImplementerSettings {
                language,
                max_attempts: generation.max_attempts,
                temperature: generation.temperature,
                max_output_tokens: generation.max_output_tokens,
                max_prompt_chars: generation.max_prompt_chars,
            },
        );
        let testing = &config.testing;
        let runner = TestGeneratorRunner::new(
            tester,
            executor,
            &root,
            TestRunnerSettings {
                language,
                command: testing.command.clone(),
                timeout: Duration::from_secs(testing.timeout_seconds),
                pass_threshold: testing.pass_threshold,
                allow_below_threshold: testing.allow_below_threshold,
                max_generation_attempts: testing.max_generation_attempts,
                temperature: generation.temperature,
                max_output_tokens: generation.max_output_tokens,
                max_prompt_chars: generation.max_prompt_chars,
                ignore_patterns: ignore,
            },
        );

        let vcs = Git2VersionControl::new(&root, config.git.remote.clone(), config.hosting.token.clone());
        let host: Option<Arc<dyn PullRequestHost>> = match &config.hosting.token {
            Some(token) => {
                let inferred = vcs.remote_url().as_deref().and_then(parse_github_url);
                let owner = config.hosting.owner.clone().or_else(|| inferred.as_ref().map(|i| i.owner.clone()));
                let repo = config.hosting.repo.clone().or_else(|| inferred.as_ref().map(|i| i.repo.clone()));
                match (owner, repo) {
                    (Some(owner), Some(repo)) => {
                        info!(owner = %owner, repo = %repo, "Pull requests go to GitHub");
                        let github: Arc<dyn PullRequestHost> = Arc::new(GitHubPullRequests::new(token, owner, repo)?);
                        Some(github)
                    }
                    _ => {
                        warn!("GitHub token set but the repository could not be determined");
                        None
                    }
                }
            }
            None => None,
        };
        let git = Arc::new(
            GitWorkflowManager::new(Arc::new(vcs), host, config.git.base_branch.clone())
                .with_retry(RetryPolicy {
                    max_attempts: config.git.retry_attempts,
                    base_delay: Duration::from_millis(config.git.retry_base_delay_ms),
                    max_delay: Duration::from_secs(config.git.retry_max_delay_seconds),
                    jitter: true,
                })
                .with_call_timeout(Duration::from_secs(config.git.call_timeout_seconds))
                .with_labels(config.git.labels.clone()),
        );

        let mut required_binaries = config.safety.required_binaries.clone();
        if let Some(program) = testing.command.first() {
            if !required_binaries.contains(program) {
                required_binaries.push(program.clone());
            }
        }
        let safety = SafetyManager::new(
            &root,
            SafetySettings {
                min_free_bytes: config.safety.min_free_mb.saturating_mul(1024 * 1024),
                required_binaries,
                backup_dir: config.safety.backup_dir.clone(),
                state_dirs: vec![PathBuf::from(".rec-deploy")],
                circuit_breaker_threshold: config.safety.circuit_breaker_threshold,
                rollback_timeout: Duration::from_secs(config.safety.rollback_timeout_seconds),
            },
            git.clone(),
        );

        let provider: Arc<dyn InventoryProvider> = match &config.inventory.file {
            Some(file) => Arc::new(JsonFileInventory::new(config.repo_path(file))),
            None => Arc::new(EmptyInventory),
        };
        let inventory = CachedInventory::new(provider, Duration::from_secs(config.inventory.cache_ttl_seconds));

        let pipeline = &config.pipeline;
        Ok(Self::new(OrchestratorParts {
            progress: Some(ProgressStore::new(root.join(&pipeline.progress_file))),
            settings: OrchestratorSettings {
                max_concurrency: pipeline.max_concurrency,
                skip_existing: pipeline.skip_existing,
                resume: pipeline.resume,
                retain_failed_branches: config.safety.retain_failed_branches,
                staging_dir: pipeline.staging_dir.clone(),
            },
            repo_root: root,
            mapper,
            analyzer,
            implementer,
            tester: runner,
            git,
            safety,
            inventory,
        }))
    }

    /// Whether `full_pr` deployments have somewhere to open pull requests.
    pub fn can_open_pull_requests(&self) -> bool {
        self.git.has_host()
    }
}
