use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::cli::DeployArgs;
use crate::config::DeployerConfig;
use crate::deployment::{
    BatchReport, DeploymentMode, DeploymentOrchestrator, DeploymentResult, DeploymentStatus, Outcome,
};
use crate::recommendations::{LoadOutcome, Recommendation, RecommendationLoader};

/// What `--recommendation` resolved to.
enum Target {
    Single(Recommendation),
    /// The record exists but failed validation
    Rejected(DeploymentResult),
    Batch(LoadOutcome),
}

pub struct DeployCommand {
    args: DeployArgs,
    config: DeployerConfig,
}

impl DeployCommand {
    /// CLI flags override the matching configuration values.
    pub fn new(args: DeployArgs, mut config: DeployerConfig) -> Self {
        config.pipeline.skip_existing |= args.skip_existing;
        config.pipeline.resume |= args.resume;
        if let Some(concurrency) = args.max_concurrency {
            config.pipeline.max_concurrency = concurrency;
        }
        if let Some(max) = args.max_deployments {
            config.pipeline.max_deployments = Some(max);
        }
        if let Some(file) = &args.recommendations_file {
            config.pipeline.recommendations_file = file.clone();
        }
        if let Some(report) = &args.report_output {
            config.pipeline.report_output = Some(report.clone());
        }
        Self { args, config }
    }

    pub async fn execute(&self, cancel: CancellationToken) -> Result<u8> {
        let mode = self.args.mode();
        let target = self.resolve(mode).await?;

        let orchestrator = DeploymentOrchestrator::from_config(&self.config)
            .context("failed to prepare the deployment pipeline")?;
        if mode == DeploymentMode::FullPr && !orchestrator.can_open_pull_requests() {
            bail!("full_pr mode needs a GitHub token (GITHUB_TOKEN) and a GitHub remote or hosting.owner/repo");
        }

        match target {
            Target::Rejected(result) => {
                self.print_result(&result);
                self.write_report(&orchestrator, mode, chrono::Utc::now(), vec![result], None)?;
                Ok(1)
            }
            Target::Single(rec) => {
                println!("🚀 Deploying {} ({mode})", rec.id);
                let started = chrono::Utc::now();
                let (result, fatal) = orchestrator.run(&rec, mode, &cancel).await;
                self.print_result(&result);
                let code = if fatal.is_some() {
                    2
                } else if result.status.outcome() == Outcome::Succeeded {
                    0
                } else {
                    1
                };
                self.write_report(&orchestrator, mode, started, vec![result], fatal)?;
                Ok(code)
            }
            Target::Batch(outcome) => {
                println!(
                    "🚀 Deploying {} recommendation(s) from {} ({mode})",
                    outcome.valid.len(),
                    self.config.pipeline.recommendations_file.display()
                );
                let report = orchestrator
                    .run_batch(
                        outcome.valid,
                        &outcome.rejected,
                        self.config.pipeline.max_deployments,
                        mode,
                        &cancel,
                    )
                    .await;
                println!();
                for line in report.summary_lines() {
                    println!("   {line}");
                }
                if let Some(reason) = &report.abort_reason {
                    println!("🛑 Run aborted: {reason}");
                }
                if let Some(path) = &self.config.pipeline.report_output {
                    report.write_to(path)?;
                    println!("📄 Report written to {}", path.display());
                }
                Ok(report.exit_code())
            }
        }
    }

    async fn resolve(&self, mode: DeploymentMode) -> Result<Target> {
        let loader = RecommendationLoader::new();
        let Some(wanted) = &self.args.recommendation else {
            let outcome = loader.load_file(&self.config.pipeline.recommendations_file).await?;
            return Ok(Target::Batch(outcome));
        };

        // a path to a file holding the single record
        let as_path = Path::new(wanted);
        if as_path.is_file() {
            let mut outcome = loader.load_file(as_path).await?;
            return match (outcome.valid.len(), outcome.rejected.len()) {
                (1, 0) => Ok(Target::Single(outcome.valid.remove(0))),
                (0, 1) => {
                    let rejected = outcome.rejected.remove(0);
                    Ok(Target::Rejected(DeploymentResult::terminal(
                        rejected.report_id(),
                        mode,
                        DeploymentStatus::FailedValidation,
                        Some(rejected.error.to_string()),
                    )))
                }
                (valid, rejected) => bail!(
                    "{} holds {} records; --recommendation expects exactly one",
                    as_path.display(),
                    valid + rejected
                ),
            };
        }

        let outcome = loader.load_file(&self.config.pipeline.recommendations_file).await?;
        if let Some(rec) = outcome.find(wanted) {
            return Ok(Target::Single(rec.clone()));
        }
        if let Some(rejected) = outcome.rejected.iter().find(|r| r.id.as_deref() == Some(wanted.as_str())) {
            return Ok(Target::Rejected(DeploymentResult::terminal(
                wanted.clone(),
                mode,
                DeploymentStatus::FailedValidation,
                Some(rejected.error.to_string()),
            )));
        }
        bail!(
            "recommendation {wanted} not found in {}",
            self.config.pipeline.recommendations_file.display()
        )
    }

    fn print_result(&self, result: &DeploymentResult) {
        let icon = if result.status.is_ok() { "✅" } else { "❌" };
        println!("{icon} {}: {}", result.recommendation_id, result.status);
        if let Some(path) = &result.target_path {
            println!("   📁 Target: {}", path.display());
        }
        if let Some(rate) = result.test_pass_rate {
            println!("   🧪 Pass rate: {:.0}%", rate * 100.0);
        }
        if let Some(branch) = &result.branch_name {
            println!("   🌿 Branch: {branch}");
        }
        if let Some(url) = &result.pull_request_url {
            println!("   🔗 Pull request: {url}");
        }
        if let Some(staging) = &result.staging_path {
            println!("   📦 Staged at: {}", staging.display());
        }
        if let Some(detail) = &result.error_detail {
            println!("   💬 {detail}");
        }
    }

    fn write_report(
        &self,
        orchestrator: &DeploymentOrchestrator,
        mode: DeploymentMode,
        started: chrono::DateTime<chrono::Utc>,
        results: Vec<DeploymentResult>,
        abort_reason: Option<String>,
    ) -> Result<()> {
        let Some(path) = &self.config.pipeline.report_output else {
            return Ok(());
        };
        let report = BatchReport::new(
            crate::telemetry::generate_correlation_id(),
            mode,
            started,
            results,
            orchestrator.safety().breaker().snapshot(),
            abort_reason,
        );
        report.write_to(path)?;
        println!("📄 Report written to {}", path.display());
        Ok(())
    }
}
