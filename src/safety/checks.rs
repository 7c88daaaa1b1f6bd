//! Individual pre- and post-deployment checks. Each returns a
//! [`CheckResult`]; the [`SafetyManager`](super::SafetyManager) decides what a
//! failed check means.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::process::binary_available;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

fn is_excluded(path: &Path, allowed: &HashSet<PathBuf>, state_dirs: &[PathBuf]) -> bool {
    allowed.contains(path) || state_dirs.iter().any(|dir| path.starts_with(dir))
}

fn list(paths: &[&PathBuf]) -> String {
    let shown: Vec<String> = paths.iter().take(5).map(|p| p.display().to_string()).collect();
    if paths.len() > shown.len() {
        format!("{} and {} more", shown.join(", "), paths.len() - shown.len())
    } else {
        shown.join(", ")
    }
}

/// The working tree must be clean apart from files other deployments are
/// writing and the tool's own state directories.
pub fn check_clean(dirty: &[PathBuf], held: &HashSet<PathBuf>, state_dirs: &[PathBuf]) -> CheckResult {
    let unexpected: Vec<&PathBuf> = dirty
        .iter()
        .filter(|p| !is_excluded(p, held, state_dirs))
        .collect();
    if unexpected.is_empty() {
        CheckResult::pass("repository_clean", "working tree is clean")
    } else {
        CheckResult::fail(
            "repository_clean",
            format!("uncommitted changes: {}", list(&unexpected)),
        )
    }
}

pub fn check_disk_space(path: &Path, min_free_bytes: u64) -> CheckResult {
    match fs2::available_space(path) {
        Ok(available) if available >= min_free_bytes => CheckResult::pass(
            "disk_space",
            format!("{:.1} MiB available", available as f64 / 1_048_576.0),
        ),
        Ok(available) => CheckResult::fail(
            "disk_space",
            format!(
                "{:.1} MiB available, {:.1} MiB required",
                available as f64 / 1_048_576.0,
                min_free_bytes as f64 / 1_048_576.0
            ),
        ),
        Err(e) => CheckResult::fail("disk_space", format!("could not determine free space: {e}")),
    }
}

pub fn check_binaries(required: &[String]) -> CheckResult {
    let missing: Vec<&str> = required
        .iter()
        .map(String::as_str)
        .filter(|b| !binary_available(b))
        .collect();
    if missing.is_empty() {
        CheckResult::pass("dependencies", "all required programs found")
    } else {
        CheckResult::fail("dependencies", format!("missing programs: {}", missing.join(", ")))
    }
}

/// After a write, only `expected` paths (plus held and state paths) may have
/// changed compared to before it.
pub fn check_no_side_effects(
    before: &[PathBuf],
    after: &[PathBuf],
    expected: &[PathBuf],
    held: &HashSet<PathBuf>,
    state_dirs: &[PathBuf],
) -> CheckResult {
    let before: HashSet<&PathBuf> = before.iter().collect();
    let expected: HashSet<&PathBuf> = expected.iter().collect();
    let unexpected: Vec<&PathBuf> = after
        .iter()
        .filter(|p| !before.contains(p) && !expected.contains(p))
        .filter(|p| !is_excluded(p, held, state_dirs))
        .collect();
    if unexpected.is_empty() {
        CheckResult::pass("side_effects", "only the deployment's files changed")
    } else {
        CheckResult::fail(
            "side_effects",
            format!("unexpected changes: {}", list(&unexpected)),
        )
    }
}
