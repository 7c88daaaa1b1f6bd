//! Safety manager
//!
//! Pre-checks before any mutation, content-hashed backups, post-checks,
//! rollback, the batch circuit breaker and per-path locks.

pub mod checkpoint;
pub mod checks;
pub mod circuit_breaker;
pub mod locks;
pub mod manager;

pub use checkpoint::{BackupEntry, SafetyCheckpoint};
pub use checks::CheckResult;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use locks::{PathLockGuard, PathLocks};
pub use manager::{RollbackScope, SafetyManager, SafetySettings};
