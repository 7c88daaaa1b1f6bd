//! Resumable per-recommendation progress, persisted as JSON.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::types::{DeploymentMode, DeploymentResult, DeploymentStatus};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("progress file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub status: DeploymentStatus,
    pub mode: DeploymentMode,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pull_request_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressFile {
    pub entries: BTreeMap<String, ProgressEntry>,
}

impl ProgressFile {
    /// Whether `id` already succeeded in `mode` or a stronger one.
    pub fn completed(&self, id: &str, mode: DeploymentMode) -> bool {
        self.entries.get(id).is_some_and(|entry| {
            matches!(entry.status, DeploymentStatus::Succeeded | DeploymentStatus::DryRunComplete)
                && entry.mode.strength() >= mode.strength()
        })
    }

    /// Whether `id` was already deployed all the way to a pull request.
    pub fn deployed_with_pr(&self, id: &str) -> bool {
        self.completed(id, DeploymentMode::FullPr)
    }
}

/// Reads and updates the progress file. Every update holds an exclusive
/// advisory lock and replaces the file atomically.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> ProgressError {
        ProgressError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn read_unlocked(&self) -> Result<ProgressFile, ProgressError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(ProgressFile::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ProgressError::Malformed {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ProgressFile::default()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    pub fn load(&self) -> Result<ProgressFile, ProgressError> {
        self.read_unlocked()
    }

    /// Merge `results` into the file.
    pub fn record(&self, results: &[DeploymentResult]) -> Result<(), ProgressError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| self.io_err(e))?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write().map_err(|e| self.io_err(e))?;

        let mut progress = self.read_unlocked()?;
        for result in results.iter().filter(|r| r.status.is_terminal()) {
            // a skip records nothing new about the deployment itself
            if result.status == DeploymentStatus::SkippedExisting
                || result.status == DeploymentStatus::SkippedCircuitOpen
            {
                continue;
            }
            // a later failure does not erase an earlier successful deployment
            if !result.status.is_ok() && progress.completed(&result.recommendation_id, DeploymentMode::DryRun) {
                continue;
            }
            progress.entries.insert(
                result.recommendation_id.clone(),
                ProgressEntry {
                    status: result.status,
                    mode: result.mode,
                    branch_name: result.branch_name.clone(),
                    commit_sha: result.commit_sha.clone(),
                    pull_request_url: result.pull_request_url.clone(),
                    updated_at: result.finished_at.unwrap_or_else(Utc::now),
                },
            );
        }
        self.write_atomic(&progress)?;
        debug!(path = %self.path.display(), entries = progress.entries.len(), "Progress saved");
        Ok(())
    }

    fn write_atomic(&self, progress: &ProgressFile) -> Result<(), ProgressError> {
        let json = serde_json::to_vec_pretty(progress).map_err(|source| ProgressError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json).map_err(|e| self.io_err(e))
    }
}

/// Write to a sibling temp file, sync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
