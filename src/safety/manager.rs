use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::checkpoint::SafetyCheckpoint;
use super::checks::{check_binaries, check_clean, check_disk_space, check_no_side_effects, CheckResult};
use super::circuit_breaker::CircuitBreaker;
use super::locks::{PathLockGuard, PathLocks};
use crate::error::DeploymentError;
use crate::git::GitWorkflowManager;

#[derive(Debug, Clone)]
pub struct SafetySettings {
    pub min_free_bytes: u64,
    /// Programs that must resolve on `PATH` before anything is mutated
    pub required_binaries: Vec<String>,
    /// Where checkpoints keep their backups
    pub backup_dir: PathBuf,
    /// Repository-relative directories the tool itself writes to; changes
    /// there never count as dirty
    pub state_dirs: Vec<PathBuf>,
    pub circuit_breaker_threshold: u32,
    /// Bound on each cleanup call made during rollback
    pub rollback_timeout: Duration,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            min_free_bytes: 512 * 1024 * 1024,
            required_binaries: Vec::new(),
            backup_dir: PathBuf::from(".rec-deploy/backups"),
            state_dirs: vec![PathBuf::from(".rec-deploy")],
            circuit_breaker_threshold: 3,
            rollback_timeout: Duration::from_secs(60),
        }
    }
}

/// What a deployment had done before it failed, so rollback can undo it.
#[derive(Debug, Default)]
pub struct RollbackScope<'a> {
    pub checkpoint: Option<&'a SafetyCheckpoint>,
    /// Branch created by this attempt
    pub branch: Option<&'a str>,
    pub pushed: bool,
}

/// Brackets every mutating phase with checks, backups and rollback, and owns
/// the batch's circuit breaker and path locks.
pub struct SafetyManager {
    repo_root: PathBuf,
    settings: SafetySettings,
    breaker: Arc<CircuitBreaker>,
    locks: PathLocks,
    git: Arc<GitWorkflowManager>,
}

impl SafetyManager {
    pub fn new(repo_root: impl Into<PathBuf>, settings: SafetySettings, git: Arc<GitWorkflowManager>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(settings.circuit_breaker_threshold));
        Self {
            repo_root: repo_root.into(),
            settings,
            breaker,
            locks: PathLocks::new(),
            git,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn backup_root(&self) -> PathBuf {
        if self.settings.backup_dir.is_absolute() {
            self.settings.backup_dir.clone()
        } else {
            self.repo_root.join(&self.settings.backup_dir)
        }
    }

    fn violation(results: &[CheckResult]) -> Option<DeploymentError> {
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.name, r.detail))
            .collect();
        if failed.is_empty() {
            None
        } else {
            Some(DeploymentError::SafetyViolation(failed.join("; ")))
        }
    }

    /// Repository cleanliness (when the deployment will touch the working
    /// tree), free disk space and required programs.
    #[instrument(skip(self, cancel))]
    pub async fn pre_check(
        &self,
        touches_working_tree: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, DeploymentError> {
        let mut results = Vec::new();
        if touches_working_tree {
            let (dirty, held) = self.dirty_and_held(cancel).await?;
            results.push(check_clean(&dirty, &held, &self.settings.state_dirs));
        }
        results.push(check_disk_space(&self.repo_root, self.settings.min_free_bytes));
        results.push(check_binaries(&self.settings.required_binaries));

        match Self::violation(&results) {
            Some(violation) => Err(violation),
            None => Ok(results),
        }
    }

    pub async fn lock_path(&self, path: &Path, cancel: &CancellationToken) -> Result<PathLockGuard, DeploymentError> {
        self.locks.acquire(&self.repo_root, path, cancel).await
    }

    /// Paths other in-flight deployments hold, for mapping.
    pub fn held_paths(&self) -> std::collections::HashSet<PathBuf> {
        self.locks.held_paths(&self.repo_root)
    }

    /// Dirty paths plus every path locked at any point around the status
    /// call. A deployment may release its lock while the status runs.
    async fn dirty_and_held(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PathBuf>, std::collections::HashSet<PathBuf>), DeploymentError> {
        let mut held = self.locks.held_paths(&self.repo_root);
        let dirty = self.git.dirty_paths(cancel).await?;
        held.extend(self.locks.held_paths(&self.repo_root));
        Ok((dirty, held))
    }

    /// Back up `paths` before they are overwritten.
    pub async fn checkpoint(
        &self,
        id: &str,
        paths: Vec<PathBuf>,
        pre_check_results: Vec<CheckResult>,
    ) -> Result<SafetyCheckpoint, DeploymentError> {
        let root = self.repo_root.clone();
        let backup_root = self.backup_root();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            SafetyCheckpoint::create(&root, &backup_root, &id, &paths, pre_check_results)
        })
        .await
        .map_err(|e| DeploymentError::Io(std::io::Error::other(e)))?
        .map_err(DeploymentError::Io)
    }

    /// Dirty paths right now, to compare against after a write.
    pub async fn snapshot_dirty(&self, cancel: &CancellationToken) -> Result<Vec<PathBuf>, DeploymentError> {
        self.git.dirty_paths(cancel).await
    }

    /// Verify that writing `expected` changed nothing else.
    pub async fn post_check(
        &self,
        checkpoint: &mut SafetyCheckpoint,
        before: &[PathBuf],
        expected: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        let (after, held) = self.dirty_and_held(cancel).await?;
        let result = check_no_side_effects(before, &after, expected, &held, &self.settings.state_dirs);
        checkpoint.post_check_results.push(result);
        match Self::violation(&checkpoint.post_check_results) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Put the working tree back to the checkpoint. A restore that cannot be
    /// verified is a safety violation.
    pub async fn restore(&self, checkpoint: &SafetyCheckpoint) -> Result<(), DeploymentError> {
        let root = self.repo_root.clone();
        let checkpoint = checkpoint.clone();
        let id = checkpoint.id.clone();
        tokio::task::spawn_blocking(move || checkpoint.restore(&root))
            .await
            .map_err(|e| DeploymentError::SafetyViolation(format!("restore of {id} panicked: {e}")))?
            .map_err(|e| DeploymentError::SafetyViolation(format!("could not restore checkpoint {id}: {e}")))
    }

    /// Undo whatever `scope` records. Runs on its own token so that a
    /// cancelled run still cleans up, and is not gated by the breaker.
    #[instrument(skip_all, fields(branch = scope.branch))]
    pub async fn rollback(&self, scope: RollbackScope<'_>) -> Result<(), DeploymentError> {
        let cleanup = CancellationToken::new();
        let mut outcome = Ok(());

        if let Some(checkpoint) = scope.checkpoint {
            match tokio::time::timeout(self.settings.rollback_timeout, self.restore(checkpoint)).await {
                Ok(Ok(())) => info!(checkpoint = %checkpoint.id, "Restored working tree"),
                Ok(Err(e)) => outcome = Err(e),
                Err(_) => {
                    outcome = Err(DeploymentError::SafetyViolation(format!(
                        "restoring checkpoint {} timed out",
                        checkpoint.id
                    )))
                }
            }
        }

        if let Some(branch) = scope.branch {
            let delete = self.git.delete_branch(branch, scope.pushed, &cleanup);
            if tokio::time::timeout(self.settings.rollback_timeout, delete).await.is_err() {
                warn!(branch = %branch, "Branch cleanup timed out");
            }
        }
        outcome
    }

    /// Drop the checkpoint's backups once the deployment is terminal.
    pub async fn release(&self, checkpoint: &SafetyCheckpoint) {
        let checkpoint = checkpoint.clone();
        match tokio::task::spawn_blocking(move || checkpoint.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to remove checkpoint backups"),
            Err(e) => warn!(error = %e, "Checkpoint cleanup panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitOperationError, MockVersionControl};
    use std::fs;
    use tempfile::TempDir;

    fn manager(root: &Path, vcs: MockVersionControl) -> SafetyManager {
        let git = Arc::new(GitWorkflowManager::new(Arc::new(vcs), None, "main"));
        SafetyManager::new(
            root,
            SafetySettings {
                min_free_bytes: 1,
                ..SafetySettings::default()
            },
            git,
        )
    }

    #[tokio::test]
    async fn test_pre_check_passes_on_clean_repo() {
        let dir = TempDir::new().unwrap();
        let mut vcs = MockVersionControl::new();
        vcs.expect_dirty_paths()
            .returning(|| Ok(vec![PathBuf::from(".rec-deploy/progress.json")]));
        let safety = manager(dir.path(), vcs);
        let results = safety.pre_check(true, &CancellationToken::new()).await.unwrap();
        assert!(results.iter().all(|r| r.passed));
    }

    #[tokio::test]
    async fn test_pre_check_dirty_repo_is_violation() {
        let dir = TempDir::new().unwrap();
        let mut vcs = MockVersionControl::new();
        vcs.expect_dirty_paths()
            .returning(|| Ok(vec![PathBuf::from("src/app.py")]));
        let safety = manager(dir.path(), vcs);
        let err = safety.pre_check(true, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_batch_fatal());
        assert!(err.to_string().contains("src/app.py"));
    }

    #[tokio::test]
    async fn test_pre_check_without_working_tree_skips_status() {
        let dir = TempDir::new().unwrap();
        // no dirty_paths expectation: calling it would panic
        let safety = manager(dir.path(), MockVersionControl::new());
        assert!(safety.pre_check(false, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_insufficient_disk_space_is_violation() {
        let dir = TempDir::new().unwrap();
        let git = Arc::new(GitWorkflowManager::new(Arc::new(MockVersionControl::new()), None, "main"));
        let safety = SafetyManager::new(
            dir.path(),
            SafetySettings {
                min_free_bytes: u64::MAX,
                ..SafetySettings::default()
            },
            git,
        );
        let err = safety.pre_check(false, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeploymentError::SafetyViolation(ref m) if m.contains("disk_space")));
    }

    #[tokio::test]
    async fn test_rollback_restores_and_deletes_branch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.py"), "original\n").unwrap();
        let mut vcs = MockVersionControl::new();
        vcs.expect_delete_branch()
            .withf(|name| name == "feature/x-1-abcdefgh")
            .times(1)
            .returning(|_| Ok(true));
        let safety = manager(dir.path(), vcs);

        let checkpoint = safety
            .checkpoint(
                "r1",
                vec![PathBuf::from("keep.py"), PathBuf::from("src/new.py")],
                vec![],
            )
            .await
            .unwrap();
        fs::write(dir.path().join("keep.py"), "changed\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/new.py"), "x = 1\n").unwrap();

        safety
            .rollback(RollbackScope {
                checkpoint: Some(&checkpoint),
                branch: Some("feature/x-1-abcdefgh"),
                pushed: false,
            })
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("keep.py")).unwrap(), "original\n");
        assert!(!dir.path().join("src/new.py").exists());
        safety.release(&checkpoint).await;
        assert!(!checkpoint.backup_location.exists());
    }

    #[tokio::test]
    async fn test_rollback_ignores_branch_cleanup_failures() {
        let dir = TempDir::new().unwrap();
        let mut vcs = MockVersionControl::new();
        vcs.expect_delete_branch()
            .returning(|_| Err(GitOperationError::BranchNotFound("x".into())));
        let safety = manager(dir.path(), vcs);
        let result = safety
            .rollback(RollbackScope {
                checkpoint: None,
                branch: Some("x"),
                pushed: false,
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_post_check_flags_unexpected_files() {
        let dir = TempDir::new().unwrap();
        let mut vcs = MockVersionControl::new();
        vcs.expect_dirty_paths()
            .returning(|| Ok(vec![PathBuf::from("src/a.py"), PathBuf::from("Makefile")]));
        let safety = manager(dir.path(), vcs);
        let mut checkpoint = safety.checkpoint("r1", vec![], vec![]).await.unwrap();
        let err = safety
            .post_check(&mut checkpoint, &[], &[PathBuf::from("src/a.py")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_batch_fatal());
        assert_eq!(checkpoint.post_check_results.len(), 1);
    }
}
