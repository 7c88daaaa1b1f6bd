use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{
    branch_prefix, generate_branch_name, is_branch_for, BranchCreation, ExistingPullRequest,
    FileChange, GitOperationError, PullRequestHost, PullRequestSpec, RetryPolicy, VersionControl,
};
use crate::cancel::{with_deadline, Interrupted};
use crate::error::DeploymentError;

/// Git and pull request operations with per-call timeouts, cancellation and
/// bounded retry.
pub struct GitWorkflowManager {
    vcs: Arc<dyn VersionControl>,
    host: Option<Arc<dyn PullRequestHost>>,
    retry: RetryPolicy,
    call_timeout: Duration,
    base_branch: String,
    labels: Vec<String>,
}

fn interrupted(operation: &'static str, e: Interrupted) -> GitOperationError {
    match e {
        Interrupted::TimedOut(timeout) => GitOperationError::Timeout { operation, timeout },
        Interrupted::Cancelled => GitOperationError::Cancelled,
    }
}

fn into_deployment(e: GitOperationError) -> DeploymentError {
    match e {
        GitOperationError::Cancelled => DeploymentError::Cancelled,
        other => DeploymentError::GitOperation(other),
    }
}

impl GitWorkflowManager {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        host: Option<Arc<dyn PullRequestHost>>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            host,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
            base_branch: base_branch.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn generate_branch_name(&self, title: &str) -> String {
        generate_branch_name(title)
    }

    /// Each attempt gets its own deadline; the retry loop observes `cancel`.
    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, GitOperationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GitOperationError>>,
    {
        let timeout = self.call_timeout;
        self.retry
            .run(operation, cancel, || {
                let fut = f();
                async move {
                    match with_deadline(cancel, timeout, fut).await {
                        Ok(result) => result,
                        Err(e) => Err(interrupted(operation, e)),
                    }
                }
            })
            .await
    }

    #[instrument(skip(self, cancel))]
    pub async fn create_branch(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<BranchCreation, DeploymentError> {
        self.call("create branch", cancel, || self.vcs.create_branch(name, &self.base_branch))
            .await
            .map_err(into_deployment)
    }

    #[instrument(skip(self, files, message, cancel), fields(files = files.len()))]
    pub async fn commit(
        &self,
        branch: &str,
        files: &[FileChange],
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploymentError> {
        self.call("commit", cancel, || self.vcs.commit_files(branch, files, message))
            .await
            .map_err(into_deployment)
    }

    #[instrument(skip(self, cancel))]
    pub async fn push(&self, branch: &str, cancel: &CancellationToken) -> Result<(), DeploymentError> {
        self.call("push", cancel, || self.vcs.push(branch))
            .await
            .map_err(into_deployment)
    }

    #[instrument(skip(self, title, body, cancel))]
    pub async fn open_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploymentError> {
        let host = self.host.as_ref().ok_or_else(|| {
            DeploymentError::GitOperation(GitOperationError::NotConfigured(
                "no GitHub token or repository configured".into(),
            ))
        })?;
        let spec = PullRequestSpec {
            title: title.to_string(),
            body: body.to_string(),
            head: branch.to_string(),
            base: self.base_branch.clone(),
            labels: self.labels.clone(),
        };
        self.call("open pull request", cancel, || host.open_pull_request(&spec))
            .await
            .map_err(into_deployment)
    }

    /// Best-effort removal of `name`, locally and optionally on the remote.
    /// Failures are logged and never returned; cleanup must not mask the
    /// original failure.
    pub async fn delete_branch(&self, name: &str, remote: bool, cancel: &CancellationToken) {
        match self.call("delete branch", cancel, || self.vcs.delete_branch(name)).await {
            Ok(true) => info!(branch = %name, "Removed branch"),
            Ok(false) => {}
            Err(e) => warn!(branch = %name, error = %e, "Failed to remove branch"),
        }
        if remote {
            if let Err(e) = self
                .call("delete remote branch", cancel, || self.vcs.delete_remote_branch(name))
                .await
            {
                warn!(branch = %name, error = %e, "Failed to remove remote branch");
            }
        }
    }

    /// Open or merged pull request previously raised for `title`, if any.
    pub async fn find_existing(
        &self,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ExistingPullRequest>, DeploymentError> {
        let Some(host) = &self.host else {
            return Ok(None);
        };
        let prefix = branch_prefix(title);
        let found = self
            .call("find pull request", cancel, || host.find_pull_requests(&prefix))
            .await
            .map_err(into_deployment)?;
        Ok(found.into_iter().find(|pr| is_branch_for(title, &pr.head)))
    }

    pub async fn dirty_paths(&self, cancel: &CancellationToken) -> Result<Vec<PathBuf>, DeploymentError> {
        self.call("status", cancel, || self.vcs.dirty_paths())
            .await
            .map_err(into_deployment)
    }
}
