//! Git workflow management
//!
//! Local repository operations go through [`VersionControl`] (libgit2 in
//! production), pull requests through [`PullRequestHost`] (GitHub via
//! octocrab). [`GitWorkflowManager`] adds timeouts, cancellation and bounded
//! retry on top of both.

pub mod hosting;
pub mod local;
pub mod naming;
pub mod retry;
pub mod templates;
pub mod workflow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use hosting::{parse_github_url, GitHubPullRequests, GitHubRepoInfo};
pub use local::Git2VersionControl;
pub use naming::{branch_prefix, generate_branch_name, is_branch_for};
pub use retry::RetryPolicy;
pub use templates::{commit_message, pull_request_body, pull_request_title, TestSummary};
pub use workflow::GitWorkflowManager;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GitOperationError {
    #[error("git {operation} failed: {message}")]
    Repository {
        operation: &'static str,
        message: String,
        retryable: bool,
    },
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("hosting {operation} failed: {message}")]
    Hosting {
        operation: &'static str,
        message: String,
        retryable: bool,
    },
    #[error("git {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("git operation cancelled")]
    Cancelled,
    #[error("pull request hosting is not configured: {0}")]
    NotConfigured(String),
}

impl GitOperationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GitOperationError::Repository { retryable, .. }
            | GitOperationError::Hosting { retryable, .. } => *retryable,
            GitOperationError::Timeout { .. } => true,
            GitOperationError::BranchNotFound(_)
            | GitOperationError::Cancelled
            | GitOperationError::NotConfigured(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCreation {
    Created,
    AlreadyExists,
}

/// A file to place in a commit, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingPullRequest {
    pub number: u64,
    pub url: String,
    pub head: String,
    pub state: PullRequestState,
}

/// Local repository operations. Commits are written straight onto the
/// branch ref, so no operation touches `HEAD` or the working tree.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Name of the branch `HEAD` points at.
    async fn head_branch(&self) -> Result<String, GitOperationError>;

    async fn branch_exists(&self, name: &str) -> Result<bool, GitOperationError>;

    /// Create `name` at `base`. An existing branch is left untouched.
    async fn create_branch(&self, name: &str, base: &str) -> Result<BranchCreation, GitOperationError>;

    /// Commit `files` on top of `branch` and return the branch tip. When the
    /// files are already committed the tip is returned unchanged.
    async fn commit_files(
        &self,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> Result<String, GitOperationError>;

    async fn push(&self, branch: &str) -> Result<(), GitOperationError>;

    /// Returns whether the branch existed.
    async fn delete_branch(&self, name: &str) -> Result<bool, GitOperationError>;

    async fn delete_remote_branch(&self, name: &str) -> Result<(), GitOperationError>;

    /// Paths with uncommitted changes, untracked files included.
    async fn dirty_paths(&self) -> Result<Vec<PathBuf>, GitOperationError>;
}

/// Pull-request side of the hosting service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PullRequestHost: Send + Sync {
    /// Open a pull request, or return the URL of the one already open for
    /// the same head branch.
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<String, GitOperationError>;

    /// Open or merged pull requests whose head branch starts with
    /// `head_prefix`, newest first.
    async fn find_pull_requests(
        &self,
        head_prefix: &str,
    ) -> Result<Vec<ExistingPullRequest>, GitOperationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GitOperationError::Timeout {
            operation: "push",
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(GitOperationError::Hosting {
            operation: "create pull request",
            message: "502".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!GitOperationError::Cancelled.is_retryable());
        assert!(!GitOperationError::BranchNotFound("x".into()).is_retryable());
    }
}
