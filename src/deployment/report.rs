use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::progress::write_atomic;
use super::types::{DeploymentMode, DeploymentResult, Outcome};
use crate::safety::CircuitBreakerState;

/// Machine-readable summary of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub hostname: String,
    pub mode: DeploymentMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Set when a safety violation stopped the run
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub circuit_breaker: CircuitBreakerState,
    pub results: Vec<DeploymentResult>,
}

impl BatchReport {
    pub fn new(
        run_id: impl Into<String>,
        mode: DeploymentMode,
        started_at: DateTime<Utc>,
        results: Vec<DeploymentResult>,
        circuit_breaker: CircuitBreakerState,
        abort_reason: Option<String>,
    ) -> Self {
        let count = |outcome: Outcome| results.iter().filter(|r| r.status.outcome() == outcome).count();
        Self {
            run_id: run_id.into(),
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            mode,
            started_at,
            finished_at: Utc::now(),
            total_submitted: results.len(),
            succeeded: count(Outcome::Succeeded),
            failed: count(Outcome::Failed),
            skipped: count(Outcome::Skipped),
            aborted: abort_reason.is_some(),
            abort_reason,
            circuit_breaker,
            results,
        }
    }

    /// Every item deployed in this run. Skipped items do not count.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status.outcome() == Outcome::Succeeded)
    }

    /// 0 when every item deployed, 1 when any item failed or was skipped,
    /// 2 when the run was aborted.
    pub fn exit_code(&self) -> u8 {
        if self.aborted {
            2
        } else if self.all_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    /// One line per result, for terminal output.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .results
            .iter()
            .map(|r| {
                let mut line = format!("{:<24} {}", r.recommendation_id, r.status);
                if let Some(url) = &r.pull_request_url {
                    line.push_str(&format!("  {url}"));
                } else if let Some(branch) = &r.branch_name {
                    line.push_str(&format!("  {branch}"));
                }
                if let Some(detail) = &r.error_detail {
                    line.push_str(&format!("  ({detail})"));
                }
                line
            })
            .collect();
        lines.push(format!(
            "{} submitted: {} succeeded, {} failed, {} skipped",
            self.total_submitted, self.succeeded, self.failed, self.skipped
        ));
        lines
    }
}
