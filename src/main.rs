use clap::Parser;
use std::process::ExitCode;

use rec_deploy::cli::{run, Cli};

/// Exit codes: 0 every recommendation deployed (or was already deployed),
/// 1 some failed or were skipped, 2 configuration error or aborted run.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Failed to start the async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::from(2)
        }
    }
}
