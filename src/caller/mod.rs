//! Abstract model-call primitive.
//!
//! The engine talks to every upstream — hosted aggregator, direct provider,
//! local runtime — through the single [`ModelCaller`] trait. Implementations
//! must be stateless (or internally synchronized) and safe for concurrent use;
//! stages fan calls out in parallel.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::query::ModelId;

pub mod breaker;
pub mod openrouter;

pub use breaker::{CircuitBreaker, CircuitState};
pub use openrouter::OpenRouterCaller;

/// A two-role prompt: system framing plus the user payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Successful call output.
#[derive(Debug, Clone)]
pub struct CallOutput {
    /// The model's full text response.
    pub text: String,
    /// Upstream-reported or measured latency.
    pub latency_ms: u64,
}

/// A failed model call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("upstream client error: HTTP {status}")]
    Upstream4xx { status: u16 },

    #[error("upstream server error: HTTP {status}")]
    Upstream5xx { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("circuit open for {model}")]
    CircuitOpen { model: ModelId },
}

/// The single operation the engine needs from an upstream.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Send `prompt` to `model`, observing `timeout`. The caller should abort
    /// transport work at the deadline; the engine enforces it regardless.
    async fn call(
        &self,
        model: &str,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<CallOutput, CallError>;
}
