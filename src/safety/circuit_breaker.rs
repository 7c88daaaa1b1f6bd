use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::DeploymentError;

/// Snapshot of the breaker, as written to the batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_failure_count: u32,
    pub is_open: bool,
    pub threshold: u32,
    /// Why the breaker opened, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Batch-scoped breaker. Opens after `threshold` consecutive item failures
/// and stays open until [`CircuitBreaker::reset`].
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: Mutex::new(CircuitBreakerState {
                consecutive_failure_count: 0,
                is_open: false,
                threshold: threshold.max(1),
                reason: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        // the state is plain data; a panic elsewhere cannot leave it torn
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open
    }

    /// Gate for every mutating git or network call.
    pub fn ensure_closed(&self) -> Result<(), DeploymentError> {
        if self.is_open() {
            Err(DeploymentError::CircuitBreakerOpen)
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if !state.is_open {
            state.consecutive_failure_count = 0;
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.consecutive_failure_count += 1;
        if !state.is_open && state.consecutive_failure_count >= state.threshold {
            state.is_open = true;
            state.reason = Some(format!(
                "{} consecutive failures",
                state.consecutive_failure_count
            ));
            warn!(
                failures = state.consecutive_failure_count,
                threshold = state.threshold,
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    /// Open immediately, regardless of the failure count.
    pub fn trip(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if !state.is_open {
            let reason = reason.into();
            warn!(reason = %reason, "Circuit breaker tripped");
            state.is_open = true;
            state.reason = Some(reason);
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.consecutive_failure_count = 0;
        state.is_open = false;
        state.reason = None;
        info!("Circuit breaker reset");
    }
}
