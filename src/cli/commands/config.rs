use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::DeployerConfig;

pub struct ConfigShowCommand {
    config: DeployerConfig,
    output: Option<PathBuf>,
}

impl ConfigShowCommand {
    pub fn new(config: DeployerConfig, output: Option<PathBuf>) -> Self {
        Self { config, output }
    }

    /// Secrets are never printed or written.
    pub fn execute(&self) -> Result<u8> {
        if let Some(path) = &self.output {
            self.config
                .save_to_file(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("✅ Configuration written to {}", path.display());
            return Ok(0);
        }

        println!("# Effective rec-deploy configuration");
        print!("{}", self.config.to_toml()?);
        if self.config.hosting.token.is_some() {
            println!("# hosting.token is set");
        }
        if self.config.generation.api_key.is_some() {
            println!("# generation.api_key is set");
        }
        Ok(0)
    }
}
