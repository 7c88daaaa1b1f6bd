//! Vendor-agnostic generation capabilities
//!
//! The orchestrator only sees these traits; concrete backends live in
//! [`super::backends`] and are chosen from configuration.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::{with_deadline, Interrupted};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("prompt of {size} chars exceeds the {limit} char bound")]
    PromptTooLarge { size: usize, limit: usize },
    #[error("generation request timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation backend error: {0}")]
    Backend(String),
    #[error("generation backend returned an empty response")]
    EmptyResponse,
}

impl CapabilityError {
    /// Worth another attempt with the same prompt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout(_) | CapabilityError::Backend(_) | CapabilityError::EmptyResponse
        )
    }
}

impl From<Interrupted> for CapabilityError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::TimedOut(limit) => CapabilityError::Timeout(limit),
            Interrupted::Cancelled => CapabilityError::Cancelled,
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl GenerationRequest {
    pub fn size(&self) -> usize {
        self.system.chars().count() + self.prompt.chars().count()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate_code(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate_tests(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError>;
}

/// Prompt bound, per-call timeout and request rate shared by every call a
/// backend makes.
#[derive(Debug, Clone)]
pub struct CallLimits {
    pub max_prompt_chars: usize,
    pub timeout: Duration,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl CallLimits {
    pub fn new(max_prompt_chars: usize, timeout: Duration, requests_per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            max_prompt_chars,
            timeout,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }

    /// Run `call` after checking the prompt bound and waiting for a rate
    /// slot. Only the call itself counts toward the timeout.
    pub async fn guard<F, T>(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        let size = request.size();
        if size > self.max_prompt_chars {
            return Err(CapabilityError::PromptTooLarge {
                size,
                limit: self.max_prompt_chars,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CapabilityError::Cancelled),
            _ = self.limiter.until_ready() => {}
        }
        debug!(prompt_chars = size, timeout = ?self.timeout, "Issuing generation call");

        with_deadline(cancel, self.timeout, call).await?
    }
}
