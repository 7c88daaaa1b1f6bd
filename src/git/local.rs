use async_trait::async_trait;
use git2::{
    BranchType, Cred, CredentialType, ErrorClass, ErrorCode, Index, IndexEntry, IndexTime,
    PushOptions, RemoteCallbacks, Repository, Signature, StatusOptions,
};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::{BranchCreation, FileChange, GitOperationError, VersionControl};

/// Fallback identity when the repository has no `user.name`/`user.email`.
const DEFAULT_AUTHOR: (&str, &str) = ("rec-deploy", "rec-deploy@users.noreply.github.com");

/// [`VersionControl`] on top of libgit2. Every call opens the repository on
/// the blocking pool.
#[derive(Debug, Clone)]
pub struct Git2VersionControl {
    root: PathBuf,
    remote: String,
    token: Option<String>,
}

impl Git2VersionControl {
    pub fn new(root: impl Into<PathBuf>, remote: impl Into<String>, token: Option<String>) -> Self {
        Self {
            root: root.into(),
            remote: remote.into(),
            token,
        }
    }

    /// URL of the configured remote, used to infer the hosting repository.
    pub fn remote_url(&self) -> Option<String> {
        let repo = Repository::open(&self.root).ok()?;
        let remote = repo.find_remote(&self.remote).ok()?;
        remote.url().map(str::to_string)
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, GitOperationError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, GitOperationError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&root).map_err(|e| classify(operation, e))?;
            f(&repo)
        })
        .await
        .map_err(|e| GitOperationError::Repository {
            operation,
            message: format!("worker panicked: {e}"),
            retryable: false,
        })?
    }

    fn callbacks(token: Option<String>) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Some(token) = &token {
                    return Cred::userpass_plaintext("x-access-token", token);
                }
            }
            let user = username_from_url.unwrap_or("git");
            if allowed.contains(CredentialType::SSH_KEY) {
                return Cred::ssh_key_from_agent(user).or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_default();
                    Cred::ssh_key(user, None, &Path::new(&home).join(".ssh/id_rsa"), None)
                });
            }
            Cred::default()
        });
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!(
                "remote rejected {refname}: {message}"
            ))),
            None => Ok(()),
        });
        callbacks
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>, GitOperationError> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Signature::now(DEFAULT_AUTHOR.0, DEFAULT_AUTHOR.1).map_err(|e| classify("signature", e)),
    }
}

/// Network, transport and lock failures are worth retrying.
fn classify(operation: &'static str, e: git2::Error) -> GitOperationError {
    let retryable = matches!(e.class(), ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh)
        || e.code() == ErrorCode::Locked;
    GitOperationError::Repository {
        operation,
        message: e.message().to_string(),
        retryable,
    }
}

/// Index path with forward slashes; rejects absolute and escaping paths.
fn index_path(path: &Path) -> Result<Vec<u8>, GitOperationError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => {
                return Err(GitOperationError::Repository {
                    operation: "commit",
                    message: format!("path escapes the repository: {}", path.display()),
                    retryable: false,
                })
            }
        }
    }
    Ok(parts.join("/").into_bytes())
}

#[async_trait]
impl VersionControl for Git2VersionControl {
    async fn head_branch(&self) -> Result<String, GitOperationError> {
        self.blocking("read HEAD", |repo| {
            let head = repo.head().map_err(|e| classify("read HEAD", e))?;
            head.shorthand()
                .map(str::to_string)
                .ok_or_else(|| GitOperationError::BranchNotFound("HEAD".into()))
        })
        .await
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, GitOperationError> {
        let name = name.to_string();
        self.blocking("find branch", move |repo| {
            match repo.find_branch(&name, BranchType::Local) {
                Ok(_) => Ok(true),
                Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
                Err(e) => Err(classify("find branch", e)),
            }
        })
        .await
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<BranchCreation, GitOperationError> {
        let name = name.to_string();
        let base = base.to_string();
        self.blocking("create branch", move |repo| {
            if repo.find_branch(&name, BranchType::Local).is_ok() {
                debug!(branch = %name, "Branch already exists");
                return Ok(BranchCreation::AlreadyExists);
            }
            let base_commit = repo
                .revparse_single(&base)
                .and_then(|obj| obj.peel_to_commit())
                .map_err(|e| match e.code() {
                    ErrorCode::NotFound => GitOperationError::BranchNotFound(base.clone()),
                    _ => classify("create branch", e),
                })?;
            repo.branch(&name, &base_commit, false)
                .map_err(|e| classify("create branch", e))?;
            info!(branch = %name, base = %base, "Created branch");
            Ok(BranchCreation::Created)
        })
        .await
    }

    async fn commit_files(
        &self,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> Result<String, GitOperationError> {
        let branch = branch.to_string();
        let files = files.to_vec();
        let message = message.to_string();
        self.blocking("commit", move |repo| {
            let refname = format!("refs/heads/{branch}");
            let parent = repo
                .find_reference(&refname)
                .and_then(|r| r.peel_to_commit())
                .map_err(|e| match e.code() {
                    ErrorCode::NotFound => GitOperationError::BranchNotFound(branch.clone()),
                    _ => classify("commit", e),
                })?;
            let parent_tree = parent.tree().map_err(|e| classify("commit", e))?;

            // build the tree in memory from the branch tip; the working tree
            // and HEAD are never touched
            let mut index = Index::new().map_err(|e| classify("commit", e))?;
            index.read_tree(&parent_tree).map_err(|e| classify("commit", e))?;
            for file in &files {
                let path = index_path(&file.path)?;
                let blob = repo
                    .blob(file.content.as_bytes())
                    .map_err(|e| classify("commit", e))?;
                let entry = IndexEntry {
                    ctime: IndexTime::new(0, 0),
                    mtime: IndexTime::new(0, 0),
                    dev: 0,
                    ino: 0,
                    mode: 0o100644,
                    uid: 0,
                    gid: 0,
                    file_size: file.content.len() as u32,
                    id: blob,
                    flags: (path.len().min(0xfff)) as u16,
                    flags_extended: 0,
                    path,
                };
                index.add(&entry).map_err(|e| classify("commit", e))?;
            }

            let tree_id = index.write_tree_to(repo).map_err(|e| classify("commit", e))?;
            if tree_id == parent_tree.id() {
                debug!(branch = %branch, "Files already committed; nothing to do");
                return Ok(parent.id().to_string());
            }
            let tree = repo.find_tree(tree_id).map_err(|e| classify("commit", e))?;
            let sig = signature(repo)?;
            let oid = repo
                .commit(Some(&refname), &sig, &sig, &message, &tree, &[&parent])
                .map_err(|e| classify("commit", e))?;
            info!(branch = %branch, commit = %oid, files = files.len(), "Committed files");
            Ok(oid.to_string())
        })
        .await
    }

    async fn push(&self, branch: &str) -> Result<(), GitOperationError> {
        let branch = branch.to_string();
        let remote_name = self.remote.clone();
        let token = self.token.clone();
        self.blocking("push", move |repo| {
            let mut remote = repo
                .find_remote(&remote_name)
                .map_err(|e| classify("push", e))?;
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            let mut options = PushOptions::new();
            options.remote_callbacks(Self::callbacks(token));
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| classify("push", e))?;
            info!(branch = %branch, remote = %remote_name, "Pushed branch");
            Ok(())
        })
        .await
    }

    async fn delete_branch(&self, name: &str) -> Result<bool, GitOperationError> {
        let name = name.to_string();
        self.blocking("delete branch", move |repo| {
            let mut branch = match repo.find_branch(&name, BranchType::Local) {
                Ok(branch) => branch,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
                Err(e) => return Err(classify("delete branch", e)),
            };
            branch.delete().map_err(|e| classify("delete branch", e))?;
            info!(branch = %name, "Deleted branch");
            Ok(true)
        })
        .await
    }

    async fn delete_remote_branch(&self, name: &str) -> Result<(), GitOperationError> {
        let name = name.to_string();
        let remote_name = self.remote.clone();
        let token = self.token.clone();
        self.blocking("delete remote branch", move |repo| {
            let mut remote = repo
                .find_remote(&remote_name)
                .map_err(|e| classify("delete remote branch", e))?;
            let refspec = format!(":refs/heads/{name}");
            let mut options = PushOptions::new();
            options.remote_callbacks(Self::callbacks(token));
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| classify("delete remote branch", e))?;
            info!(branch = %name, remote = %remote_name, "Deleted remote branch");
            Ok(())
        })
        .await
    }

    async fn dirty_paths(&self) -> Result<Vec<PathBuf>, GitOperationError> {
        self.blocking("status", |repo| {
            let mut options = StatusOptions::new();
            options
                .include_untracked(true)
                .recurse_untracked_dirs(true)
                .include_ignored(false);
            let statuses = repo
                .statuses(Some(&mut options))
                .map_err(|e| classify("status", e))?;
            Ok(statuses
                .iter()
                .filter_map(|entry| entry.path().map(PathBuf::from))
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_repo() -> (TempDir, Git2VersionControl) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        let vcs = Git2VersionControl::new(temp_dir.path(), "origin", None);
        (temp_dir, vcs)
    }

    fn change(path: &str, content: &str) -> FileChange {
        FileChange {
            path: PathBuf::from(path),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_create_branch_is_idempotent() {
        let (_dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        assert_eq!(
            vcs.create_branch("feature/x-1-abc", &base).await.unwrap(),
            BranchCreation::Created
        );
        assert_eq!(
            vcs.create_branch("feature/x-1-abc", &base).await.unwrap(),
            BranchCreation::AlreadyExists
        );
        assert!(vcs.branch_exists("feature/x-1-abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_without_touching_working_tree() {
        let (dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        vcs.create_branch("feature/fg", &base).await.unwrap();

        let sha = vcs
            .commit_files("feature/fg", &[change("src/analytics/fg.py", "x = 1\n")], "feat: fg")
            .await
            .unwrap();

        assert!(!dir.path().join("src/analytics/fg.py").exists());
        assert!(vcs.dirty_paths().await.unwrap().is_empty());
        assert_eq!(vcs.head_branch().await.unwrap(), base);

        let repo = Repository::open(dir.path()).unwrap();
        let commit = repo.find_commit(git2::Oid::from_str(&sha).unwrap()).unwrap();
        assert_eq!(commit.message(), Some("feat: fg"));
        let entry = commit.tree().unwrap().get_path(Path::new("src/analytics/fg.py")).unwrap();
        let blob = repo.find_blob(entry.id()).unwrap();
        assert_eq!(blob.content(), b"x = 1\n");
        // the base file is still in the tree
        assert!(commit.tree().unwrap().get_path(Path::new("README.md")).is_ok());
    }

    #[tokio::test]
    async fn test_repeated_commit_is_noop() {
        let (_dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        vcs.create_branch("feature/fg", &base).await.unwrap();
        let files = [change("fg.py", "x = 1\n")];
        let first = vcs.commit_files("feature/fg", &files, "feat").await.unwrap();
        let second = vcs.commit_files("feature/fg", &files, "feat").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_commit_to_missing_branch() {
        let (_dir, vcs) = create_test_repo();
        let err = vcs
            .commit_files("nope", &[change("a.py", "")], "msg")
            .await
            .unwrap_err();
        assert_eq!(err, GitOperationError::BranchNotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_commit_rejects_escaping_paths() {
        let (_dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        vcs.create_branch("feature/fg", &base).await.unwrap();
        let err = vcs
            .commit_files("feature/fg", &[change("../evil.py", "")], "msg")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_branch() {
        let (_dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        vcs.create_branch("feature/gone", &base).await.unwrap();
        assert!(vcs.delete_branch("feature/gone").await.unwrap());
        assert!(!vcs.delete_branch("feature/gone").await.unwrap());
        assert!(!vcs.branch_exists("feature/gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_dirty_paths_reports_untracked() {
        let (dir, vcs) = create_test_repo();
        fs::write(dir.path().join("scratch.txt"), "tmp").unwrap();
        assert_eq!(vcs.dirty_paths().await.unwrap(), vec![PathBuf::from("scratch.txt")]);
    }

    #[tokio::test]
    async fn test_push_without_remote_fails() {
        let (_dir, vcs) = create_test_repo();
        let base = vcs.head_branch().await.unwrap();
        let err = vcs.push(&base).await.unwrap_err();
        assert!(matches!(err, GitOperationError::Repository { operation: "push", .. }));
    }

    #[tokio::test]
    async fn test_push_to_local_bare_remote() {
        let (dir, vcs) = create_test_repo();
        let remote_dir = TempDir::new().unwrap();
        Repository::init_bare(remote_dir.path()).unwrap();
        Repository::open(dir.path())
            .unwrap()
            .remote("origin", remote_dir.path().to_str().unwrap())
            .unwrap();

        let base = vcs.head_branch().await.unwrap();
        vcs.create_branch("feature/pushed", &base).await.unwrap();
        vcs.push("feature/pushed").await.unwrap();
        // pushing the same tip again is a no-op
        vcs.push("feature/pushed").await.unwrap();

        let remote = Repository::open_bare(remote_dir.path()).unwrap();
        assert!(remote.find_reference("refs/heads/feature/pushed").is_ok());

        vcs.delete_remote_branch("feature/pushed").await.unwrap();
        assert!(remote.find_reference("refs/heads/feature/pushed").is_err());
    }
}
