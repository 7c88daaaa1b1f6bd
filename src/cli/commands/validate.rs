use anyhow::Result;
use std::path::PathBuf;

use crate::recommendations::{plan_waves, RecommendationLoader};

pub struct ValidateCommand {
    path: PathBuf,
}

impl ValidateCommand {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Exit code 0 when every record is deployable, 1 otherwise.
    pub async fn execute(&self) -> Result<u8> {
        println!("🔍 Validating {}", self.path.display());
        let outcome = RecommendationLoader::new().load_file(&self.path).await?;
        let plan = plan_waves(&outcome.valid);

        println!("   ✅ Valid records: {}", outcome.valid.len());
        for rejected in &outcome.rejected {
            println!("   ❌ {}: {}", rejected.report_id(), rejected.error);
        }
        for (rec, pending) in &plan.cyclic {
            println!("   🔁 {}: dependency cycle through {}", rec.id, pending.join(", "));
        }
        if !plan.waves.is_empty() {
            println!();
            println!("📋 Deployment order:");
            for (i, wave) in plan.waves.iter().enumerate() {
                let ids: Vec<&str> = wave.iter().map(|r| r.id.as_str()).collect();
                println!("   {}. {}", i + 1, ids.join(", "));
            }
        }

        if outcome.rejected.is_empty() && plan.cyclic.is_empty() {
            Ok(0)
        } else {
            Ok(1)
        }
    }
}
