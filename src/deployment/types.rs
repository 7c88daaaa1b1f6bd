use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Write into a staging directory only; no git or network side effects
    DryRun,
    /// Commit on a local branch; nothing is pushed
    LocalCommit,
    /// Commit, push and open a pull request
    FullPr,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::DryRun => "dry_run",
            DeploymentMode::LocalCommit => "local_commit",
            DeploymentMode::FullPr => "full_pr",
        }
    }

    /// How far a mode goes. A success in a stronger mode covers a weaker one.
    pub fn strength(self) -> u8 {
        match self {
            DeploymentMode::DryRun => 0,
            DeploymentMode::LocalCommit => 1,
            DeploymentMode::FullPr => 2,
        }
    }

    pub fn mutates_git(self) -> bool {
        !matches!(self, DeploymentMode::DryRun)
    }

    pub fn uses_network(self) -> bool {
        matches!(self, DeploymentMode::FullPr)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    DryRunComplete,
    Succeeded,
    FailedValidation,
    FailedGeneration,
    FailedTests,
    FailedGit,
    SkippedCircuitOpen,
    SkippedExisting,
    RolledBack,
}

/// Report bucket a status falls into. Every status is in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        self != DeploymentStatus::Pending
    }

    pub fn outcome(self) -> Outcome {
        match self {
            DeploymentStatus::DryRunComplete | DeploymentStatus::Succeeded => Outcome::Succeeded,
            DeploymentStatus::SkippedCircuitOpen | DeploymentStatus::SkippedExisting => Outcome::Skipped,
            DeploymentStatus::Pending
            | DeploymentStatus::FailedValidation
            | DeploymentStatus::FailedGeneration
            | DeploymentStatus::FailedTests
            | DeploymentStatus::FailedGit
            | DeploymentStatus::RolledBack => Outcome::Failed,
        }
    }

    /// Whether the recommendation needs no further work: it deployed, or it
    /// had already been deployed.
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            DeploymentStatus::DryRunComplete | DeploymentStatus::Succeeded | DeploymentStatus::SkippedExisting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::DryRunComplete => "dry_run_complete",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::FailedValidation => "failed_validation",
            DeploymentStatus::FailedGeneration => "failed_generation",
            DeploymentStatus::FailedTests => "failed_tests",
            DeploymentStatus::FailedGit => "failed_git",
            DeploymentStatus::SkippedCircuitOpen => "skipped_circuit_open",
            DeploymentStatus::SkippedExisting => "skipped_existing",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one deployment attempt. Starts `pending`; once a terminal
/// status is set it is never changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub recommendation_id: String,
    pub status: DeploymentStatus,
    pub mode: DeploymentMode,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pull_request_url: Option<String>,
    pub test_pass_rate: Option<f64>,
    pub error_detail: Option<String>,
    pub target_path: Option<PathBuf>,
    /// Where the dry-run output was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_path: Option<PathBuf>,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentResult {
    pub fn pending(recommendation_id: impl Into<String>, mode: DeploymentMode) -> Self {
        Self {
            recommendation_id: recommendation_id.into(),
            status: DeploymentStatus::Pending,
            mode,
            branch_name: None,
            commit_sha: None,
            pull_request_url: None,
            test_pass_rate: None,
            error_detail: None,
            target_path: None,
            staging_path: None,
            correlation_id: crate::telemetry::generate_correlation_id(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A result that never entered the pipeline.
    pub fn terminal(
        recommendation_id: impl Into<String>,
        mode: DeploymentMode,
        status: DeploymentStatus,
        detail: Option<String>,
    ) -> Self {
        let mut result = Self::pending(recommendation_id, mode);
        result.finish(status, detail);
        result
    }

    /// Set the terminal status. Later calls are ignored.
    pub fn finish(&mut self, status: DeploymentStatus, detail: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if detail.is_some() {
            self.error_detail = detail;
        }
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_final() {
        let mut result = DeploymentResult::pending("r1", DeploymentMode::DryRun);
        result.finish(DeploymentStatus::DryRunComplete, None);
        result.finish(DeploymentStatus::RolledBack, Some("late".into()));
        assert_eq!(result.status, DeploymentStatus::DryRunComplete);
        assert!(result.error_detail.is_none());
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::SkippedCircuitOpen).unwrap();
        assert_eq!(json, "\"skipped_circuit_open\"");
        assert_eq!(DeploymentStatus::FailedGit.to_string(), "failed_git");
    }

    #[test]
    fn test_outcome_buckets() {
        assert_eq!(DeploymentStatus::Succeeded.outcome(), Outcome::Succeeded);
        assert_eq!(DeploymentStatus::SkippedExisting.outcome(), Outcome::Skipped);
        assert_eq!(DeploymentStatus::RolledBack.outcome(), Outcome::Failed);
        assert!(DeploymentStatus::SkippedExisting.is_ok());
        assert!(!DeploymentStatus::SkippedCircuitOpen.is_ok());
    }

    #[test]
    fn test_mode_strength() {
        assert!(DeploymentMode::FullPr.strength() > DeploymentMode::LocalCommit.strength());
        assert!(!DeploymentMode::DryRun.mutates_git());
        assert!(DeploymentMode::FullPr.uses_network());
    }
}
