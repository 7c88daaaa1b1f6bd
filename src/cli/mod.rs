use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::DeployerConfig;
use crate::deployment::DeploymentMode;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::init_telemetry;

pub mod commands;

use commands::{config::ConfigShowCommand, deploy::DeployCommand, validate::ValidateCommand};

#[derive(Parser)]
#[command(name = "rec-deploy")]
#[command(about = "Deploy structured feature recommendations as tested code changes")]
#[command(long_about = "rec-deploy turns structured feature recommendations into generated source files, \
                       runs generated tests against them and commits the result on a fresh branch, \
                       optionally pushing it and opening a pull request. Start with \
                       'rec-deploy deploy --dry-run' to see what would be produced.")]
pub struct Cli {
    /// Configuration file layered over rec-deploy.toml
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,
    /// Log output format
    #[arg(long, value_enum, global = true, help = "Log format: json or pretty (default from config)")]
    pub log_format: Option<LogFormat>,
    /// Debug-level logging
    #[arg(long, short = 'v', global = true, help = "Enable debug logging")]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy one recommendation, or every recommendation in the input file
    Deploy(DeployArgs),
    /// Deploy every recommendation in the input file in dependency order
    Batch(BatchArgs),
    /// Load the recommendations file and report malformed records
    Validate {
        /// Recommendations file (JSON array or {"recommendations": [...]})
        #[arg(long, help = "Recommendations file to check (default from config)")]
        recommendations_file: Option<PathBuf>,
    },
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show {
        /// Write to this file instead of stdout
        #[arg(long, help = "Write the configuration to a file instead of printing it")]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct DeployArgs {
    /// Deploy only this recommendation (an id, or a file holding one record)
    #[arg(long, help = "Recommendation id in the input file, or a JSON file with a single record")]
    pub recommendation: Option<String>,
    /// Recommendations file (JSON array or {"recommendations": [...]})
    #[arg(long, help = "Recommendations file (default from config)")]
    pub recommendations_file: Option<PathBuf>,
    /// How far a deployment goes
    #[arg(long, value_enum, help = "dry_run, local_commit or full_pr (default: local_commit)")]
    pub mode: Option<DeploymentMode>,
    /// Shorthand for --mode dry_run
    #[arg(long, help = "Stage generated files without touching git")]
    pub dry_run: bool,
    /// Cap on recommendations processed in this run
    #[arg(long, help = "Process at most this many recommendations")]
    pub max_deployments: Option<usize>,
    /// Deployments running at once
    #[arg(long, help = "Run up to this many deployments concurrently")]
    pub max_concurrency: Option<usize>,
    /// Where to write the JSON report
    #[arg(long, help = "Write the machine-readable report to this path")]
    pub report_output: Option<PathBuf>,
    /// Skip recommendations that already have an open or merged pull request
    #[arg(long, help = "Skip recommendations that were already deployed")]
    pub skip_existing: bool,
    /// Skip recommendations the progress file records as done
    #[arg(long, help = "Resume an interrupted batch from the progress file")]
    pub resume: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BatchArgs {
    #[arg(long, help = "Recommendations file (default from config)")]
    pub recommendations_file: Option<PathBuf>,
    #[arg(long, value_enum, help = "dry_run, local_commit or full_pr (default: local_commit)")]
    pub mode: Option<DeploymentMode>,
    #[arg(long, help = "Stage generated files without touching git")]
    pub dry_run: bool,
    #[arg(long, help = "Process at most this many recommendations")]
    pub max_deployments: Option<usize>,
    #[arg(long, help = "Run up to this many deployments concurrently")]
    pub max_concurrency: Option<usize>,
    #[arg(long, help = "Write the machine-readable report to this path")]
    pub report_output: Option<PathBuf>,
    #[arg(long, help = "Skip recommendations that were already deployed")]
    pub skip_existing: bool,
    #[arg(long, help = "Resume an interrupted batch from the progress file")]
    pub resume: bool,
}

impl From<BatchArgs> for DeployArgs {
    fn from(args: BatchArgs) -> Self {
        Self {
            recommendation: None,
            recommendations_file: args.recommendations_file,
            mode: args.mode,
            dry_run: args.dry_run,
            max_deployments: args.max_deployments,
            max_concurrency: args.max_concurrency,
            report_output: args.report_output,
            skip_existing: args.skip_existing,
            resume: args.resume,
        }
    }
}

impl DeployArgs {
    pub fn mode(&self) -> DeploymentMode {
        if self.dry_run {
            DeploymentMode::DryRun
        } else {
            self.mode.unwrap_or(DeploymentMode::LocalCommit)
        }
    }
}

/// Load configuration, install logging and run the chosen command. The
/// returned value is the process exit code; an `Err` means the run could not
/// start and maps to exit code 2.
pub async fn run(cli: Cli) -> Result<u8> {
    if let Err(e) = DeployerConfig::load_env_file() {
        eprintln!("⚠️  Ignoring unreadable .env file: {e}");
    }
    let config = DeployerConfig::load(cli.config.as_deref())?;

    let json = match cli.log_format {
        Some(format) => format == LogFormat::Json,
        None => config.observability.json_logs,
    };
    let level = if cli.verbose {
        "debug"
    } else {
        config.observability.log_level.as_str()
    };
    init_telemetry(json, level)?;

    match cli.command {
        Commands::Deploy(args) => deploy(args, config).await,
        Commands::Batch(args) => deploy(args.into(), config).await,
        Commands::Validate { recommendations_file } => {
            let path = recommendations_file.unwrap_or_else(|| config.pipeline.recommendations_file.clone());
            ValidateCommand::new(path).execute().await
        }
        Commands::Config {
            action: ConfigAction::Show { output },
        } => ConfigShowCommand::new(config, output).execute(),
    }
}

async fn deploy(args: DeployArgs, config: DeployerConfig) -> Result<u8> {
    config.validate()?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();
    DeployCommand::new(args, config).execute(shutdown.token()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dry_run_flag_wins() {
        let cli = Cli::parse_from(["rec-deploy", "deploy", "--mode", "full_pr", "--dry-run"]);
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.mode(), DeploymentMode::DryRun);
    }

    #[test]
    fn test_default_mode_is_local_commit() {
        let cli = Cli::parse_from(["rec-deploy", "--log-format", "json", "deploy", "--recommendation", "r1"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.mode(), DeploymentMode::LocalCommit);
        assert_eq!(args.recommendation.as_deref(), Some("r1"));
    }

    #[test]
    fn test_batch_never_targets_single_item() {
        let cli = Cli::parse_from(["rec-deploy", "batch", "--max-deployments", "5", "--dry-run"]);
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        let args = DeployArgs::from(args);
        assert!(args.recommendation.is_none());
        assert_eq!(args.max_deployments, Some(5));
        assert_eq!(args.mode(), DeploymentMode::DryRun);
    }
}
