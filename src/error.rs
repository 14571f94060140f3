//! Error taxonomy for the deliberation engine.
//!
//! Two layers: [`ErrorKind`] classifies a single model call (recorded inside
//! stage results and transcripts), while [`CouncilError`] covers the fatal
//! conditions that abort a deliberation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caller::CallError;

/// Classification of a failed model call, as persisted in stage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The call exceeded its per-call deadline.
    ModelTimeout,
    /// Upstream returned HTTP 429.
    RateLimited,
    /// Upstream returned another 4xx status.
    Upstream4xx,
    /// Upstream returned a 5xx status.
    Upstream5xx,
    /// Connection or transport failure.
    Network,
    /// The response body could not be parsed into what the stage required.
    MalformedResponse,
    /// The gateway circuit for this model was open.
    CircuitOpen,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelTimeout => write!(f, "model_timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Upstream4xx => write!(f, "upstream_4xx"),
            Self::Upstream5xx => write!(f, "upstream_5xx"),
            Self::Network => write!(f, "network"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

impl From<&CallError> for ErrorKind {
    fn from(err: &CallError) -> Self {
        match err {
            CallError::Timeout { .. } => Self::ModelTimeout,
            CallError::RateLimited { .. } => Self::RateLimited,
            CallError::Upstream4xx { .. } => Self::Upstream4xx,
            CallError::Upstream5xx { .. } => Self::Upstream5xx,
            CallError::Network(_) => Self::Network,
            CallError::MalformedResponse(_) => Self::MalformedResponse,
            CallError::CircuitOpen { .. } => Self::CircuitOpen,
        }
    }
}

/// Fatal deliberation errors.
#[derive(Debug, Error)]
pub enum CouncilError {
    /// Rejected before Stage 1 ran.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Fewer than two council models produced a Stage 1 response.
    #[error("insufficient responders: {got} of {want} required")]
    InsufficientResponders { got: usize, want: usize },

    /// Chairman synthesis failed even after the retry.
    #[error("synthesis failed: {kind}")]
    SynthesisFailed { kind: ErrorKind },

    /// The deliberation was cancelled from outside.
    #[error("deliberation cancelled")]
    Cancelled,
}

impl CouncilError {
    /// Short machine-readable kind, used in error events and envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::InsufficientResponders { .. } => "insufficient_responders",
            Self::SynthesisFailed { .. } => "synthesis_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A failed deliberation, carrying what partial state exists on disk.
#[derive(Debug)]
pub struct DeliberationFailure {
    pub error: CouncilError,
    pub request_id: String,
    pub partial_transcript_path: Option<PathBuf>,
}

impl std::fmt::Display for DeliberationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request {} failed: {}", self.request_id, self.error)
    }
}

impl std::error::Error for DeliberationFailure {}

/// Errors from the transcript writer. Never fatal to the deliberation.
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("transcript io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcript serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
