use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::checks::CheckResult;
use crate::testing::checked_relative;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Relative to the repository root
    pub path: PathBuf,
    /// Content hash of the original file; `None` when the file did not exist
    pub sha256: Option<String>,
}

/// Backups of every file a deployment is about to touch, plus the check
/// results recorded around the mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheckpoint {
    pub id: String,
    pub backup_location: PathBuf,
    pub entries: Vec<BackupEntry>,
    pub pre_check_results: Vec<CheckResult>,
    pub post_check_results: Vec<CheckResult>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl SafetyCheckpoint {
    /// Snapshot `paths` (relative to `repo_root`) under `backup_root/id`.
    pub fn create(
        repo_root: &Path,
        backup_root: &Path,
        id: &str,
        paths: &[PathBuf],
        pre_check_results: Vec<CheckResult>,
    ) -> io::Result<Self> {
        let backup_location = backup_root.join(id);
        fs::create_dir_all(&backup_location)?;

        let mut entries = Vec::with_capacity(paths.len());
        for rel in paths {
            let rel = checked_relative(rel)?;
            let source = repo_root.join(rel);
            let sha256 = match fs::read(&source) {
                Ok(bytes) => {
                    let dest = backup_location.join(rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&dest, &bytes)?;
                    Some(sha256_hex(&bytes))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            debug!(path = %rel.display(), existed = sha256.is_some(), "Backed up file");
            entries.push(BackupEntry {
                path: rel.to_path_buf(),
                sha256,
            });
        }

        Ok(Self {
            id: id.to_string(),
            backup_location,
            entries,
            pre_check_results,
            post_check_results: Vec::new(),
        })
    }

    /// Put every backed-up path back the way it was: restore originals,
    /// delete files that did not exist, then verify the restored bytes.
    pub fn restore(&self, repo_root: &Path) -> io::Result<()> {
        for entry in &self.entries {
            let target = repo_root.join(&entry.path);
            match &entry.sha256 {
                Some(_) => {
                    let bytes = fs::read(self.backup_location.join(&entry.path))?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, bytes)?;
                }
                None => {
                    match fs::remove_file(&target) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                    remove_empty_parents(repo_root, &target);
                }
            }
        }
        if self.verify(repo_root)? {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "restored files for checkpoint {} do not match their backups",
                self.id
            )))
        }
    }

    /// Whether the working tree matches the snapshot for every entry.
    pub fn verify(&self, repo_root: &Path) -> io::Result<bool> {
        for entry in &self.entries {
            let current = match fs::read(repo_root.join(&entry.path)) {
                Ok(bytes) => Some(sha256_hex(&bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            if current != entry.sha256 {
                warn!(path = %entry.path.display(), "File differs from checkpoint");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn cleanup(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.backup_location) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Remove directories left empty by deleting `file`, stopping at `root`.
fn remove_empty_parents(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // fails on non-empty directories, which ends the walk
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, TempDir) {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join("src/analytics")).unwrap();
        fs::write(repo.path().join("src/analytics/stats.py"), "def mean(x):\n    pass\n").unwrap();
        (repo, TempDir::new().unwrap())
    }

    #[test]
    fn test_restore_existing_file() {
        let (repo, backups) = setup();
        let path = PathBuf::from("src/analytics/stats.py");
        let checkpoint =
            SafetyCheckpoint::create(repo.path(), backups.path(), "r1", &[path.clone()], vec![]).unwrap();
        assert!(checkpoint.entries[0].sha256.is_some());

        fs::write(repo.path().join(&path), "broken").unwrap();
        assert!(!checkpoint.verify(repo.path()).unwrap());

        checkpoint.restore(repo.path()).unwrap();
        assert_eq!(
            fs::read_to_string(repo.path().join(&path)).unwrap(),
            "def mean(x):\n    pass\n"
        );
    }

    #[test]
    fn test_restore_removes_new_file_and_empty_dirs() {
        let (repo, backups) = setup();
        let path = PathBuf::from("src/ml/models/new_model.py");
        let checkpoint =
            SafetyCheckpoint::create(repo.path(), backups.path(), "r2", &[path.clone()], vec![]).unwrap();
        assert_eq!(checkpoint.entries[0].sha256, None);

        fs::create_dir_all(repo.path().join("src/ml/models")).unwrap();
        fs::write(repo.path().join(&path), "x = 1\n").unwrap();

        checkpoint.restore(repo.path()).unwrap();
        assert!(!repo.path().join(&path).exists());
        assert!(!repo.path().join("src/ml").exists());
        assert!(repo.path().join("src/analytics").exists());
    }

    #[test]
    fn test_cleanup_removes_backups() {
        let (repo, backups) = setup();
        let checkpoint = SafetyCheckpoint::create(
            repo.path(),
            backups.path(),
            "r3",
            &[PathBuf::from("src/analytics/stats.py")],
            vec![],
        )
        .unwrap();
        assert!(checkpoint.backup_location.exists());
        checkpoint.cleanup().unwrap();
        assert!(!checkpoint.backup_location.exists());
        // second cleanup is a no-op
        checkpoint.cleanup().unwrap();
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (repo, backups) = setup();
        let result = SafetyCheckpoint::create(
            repo.path(),
            backups.path(),
            "r4",
            &[PathBuf::from("../outside.py")],
            vec![],
        );
        assert!(result.is_err());
    }
}
