//! Throw-away copy of the destination repository for running generated tests.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::structure::scanner::pattern_matches;

/// Removed from disk when dropped.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    dir: TempDir,
}

impl IsolatedWorkspace {
    /// Copy `source_root` minus `.git` and ignored entries into a new
    /// temporary directory.
    pub fn create(source_root: &Path, ignore_patterns: &[String]) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("rec-deploy-tests-").tempdir()?;
        let mut copied = 0usize;

        let walker = WalkDir::new(source_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                name != ".git" && !ignore_patterns.iter().any(|p| pattern_matches(p, &name))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop while copying"))
            })?;
            let rel = entry.path().strip_prefix(source_root).unwrap_or(entry.path());
            let dest = dir.path().join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else if entry.file_type().is_file() {
                fs::copy(entry.path(), &dest)?;
                copied += 1;
            }
        }

        debug!(
            source = %source_root.display(),
            workspace = %dir.path().display(),
            files = copied,
            "Created isolated test workspace"
        );
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` at `rel`, which must stay inside the workspace.
    pub fn write_file(&self, rel: &Path, content: &str) -> io::Result<PathBuf> {
        let dest = self.dir.path().join(checked_relative(rel)?);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, content)?;
        Ok(dest)
    }
}

/// Reject absolute paths and parent-directory escapes.
pub fn checked_relative(rel: &Path) -> io::Result<&Path> {
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || rel.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path escapes the repository: {}", rel.display()),
        ));
    }
    Ok(rel)
}
