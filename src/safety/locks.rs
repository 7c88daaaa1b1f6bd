use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DeploymentError;

type LockKey = (PathBuf, PathBuf);

#[derive(Debug, Default)]
struct Inner {
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashSet<LockKey>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-file locks keyed by repository and relative path. Deployments that
/// touch different files never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    inner: Arc<Inner>,
}

/// Held while a deployment mutates its target file. Released on drop.
#[derive(Debug)]
pub struct PathLockGuard {
    key: LockKey,
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.key.1
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        guard(&self.inner.held).remove(&self.key);
        // this guard still owns one reference until its fields drop
        self.inner.prune(&self.key, 2);
    }
}

impl Inner {
    /// Forget the lock for `key` once only `refs` references remain. Callers
    /// clone under the same map lock, so a waiter always keeps it alive.
    fn prune(&self, key: &LockKey, refs: usize) {
        let mut locks = guard(&self.locks);
        if locks
            .get(key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= refs)
        {
            locks.remove(key);
        }
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `path` inside `repo`.
    pub async fn acquire(
        &self,
        repo: &Path,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathLockGuard, DeploymentError> {
        let key = (repo.to_path_buf(), path.to_path_buf());
        let mutex = guard(&self.inner.locks)
            .entry(key.clone())
            .or_default()
            .clone();

        let owned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            owned = mutex.lock_owned() => Some(owned),
        };
        let Some(owned) = owned else {
            self.inner.prune(&key, 1);
            return Err(DeploymentError::Cancelled);
        };
        debug!(path = %path.display(), "Acquired path lock");
        guard(&self.inner.held).insert(key.clone());
        Ok(PathLockGuard {
            key,
            inner: self.inner.clone(),
            _guard: owned,
        })
    }

    /// Paths inside `repo` currently held by some deployment.
    pub fn held_paths(&self, repo: &Path) -> HashSet<PathBuf> {
        guard(&self.inner.held)
            .iter()
            .filter(|(r, _)| r == repo)
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        guard(&self.inner.locks).len()
    }
}
