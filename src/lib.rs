//! LLM Council — a multi-model deliberation engine.
//!
//! A council of models answers a query in three stages:
//!
//! 1. **Respond** — every council model answers independently, in parallel.
//! 2. **Peer rank** — each model reviews the anonymized responses and
//!    returns a JSON ranking with rubric scores, aggregated into Borda
//!    standings with self-votes excluded.
//! 3. **Synthesize** — a chairman model writes the final answer (and, in
//!    verify mode, a PASS/FAIL/UNCLEAR verdict backed by an
//!    agreement-derived confidence).
//!
//! Every deliberation leaves a complete transcript on disk and streams
//! lifecycle events over an in-process bus.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use llm_council::{CouncilConfig, EventBus, OpenRouterCaller, Orchestrator, Query};
//!
//! let caller = Arc::new(OpenRouterCaller::openrouter(api_key));
//! let config = CouncilConfig::new(models, "anthropic/claude-opus-4-5");
//! let orchestrator = Orchestrator::new(caller, config, EventBus::new().shared());
//! let result = orchestrator.deliberate(Query::new("Should we ship this?")).await?;
//! println!("{}", result.final_response);
//! ```

pub mod aggregate;
pub mod caller;
pub mod config;
pub mod confidence;
pub mod error;
pub mod events;
pub mod labels;
pub mod orchestrator;
pub mod parse;
pub mod query;
pub mod runner;
pub mod stages;
pub mod transcript;

pub use aggregate::AggregateEntry;
pub use caller::{CallError, CallOutput, CircuitBreaker, ModelCaller, OpenRouterCaller, Prompt};
pub use config::{ConfidenceWeights, CouncilConfig, StageTimeouts};
pub use confidence::ConfidenceBreakdown;
pub use error::{CouncilError, DeliberationFailure, ErrorKind, TranscriptError};
pub use events::{CouncilEvent, EventBus, SharedEventBus};
pub use labels::LabelMap;
pub use orchestrator::{
    CouncilPhase, DeliberationDetails, Orchestrator, ResultEnvelope, DEFAULT_TRANSCRIPT_ROOT,
};
pub use parse::{Ranking, RubricScores};
pub use query::{DeliberationMode, ModelId, Query, VerdictType};
pub use runner::{StageCall, StageResult, StageRunner};
pub use stages::normalize::NormalizedResponse;
pub use stages::synthesize::{RawVerdict, Synthesis, Verdict};
pub use transcript::TranscriptWriter;
