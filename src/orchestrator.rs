//! The deliberation state machine.
//!
//! One orchestrator serves many requests; each `deliberate` call owns its
//! request's state end to end and moves it linearly through the phases:
//!
//! ```text
//! Accepted → Stage1 → [Normalizing] → Stage2 → Aggregating
//!          → Stage3 → Scoring → Writing → Done
//! ```
//!
//! `Failed` is reachable from every non-terminal phase. Each boundary emits
//! an event on the bus, and transcript files are written as the phases
//! produce them. Transcript write failures are logged and reported as
//! `council.error` with a `transcript_write` subkind but never fail the
//! deliberation itself.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{self, AggregateEntry};
use crate::caller::ModelCaller;
use crate::config::CouncilConfig;
use crate::confidence::{self, ConfidenceBreakdown};
use crate::error::{CouncilError, DeliberationFailure, TranscriptError};
use crate::events::{CouncilEvent, SharedEventBus};
use crate::labels::LabelMap;
use crate::parse::{Ranking, RubricScores};
use crate::query::{DeliberationMode, ModelId, Query, VerdictType};
use crate::runner::{StageResult, StageRunner};
use crate::stages::normalize::{self, NormalizedResponse};
use crate::stages::synthesize::{self, Synthesis, Verdict};
use crate::stages::{rank, respond};
use crate::transcript::{
    RequestRecord, Stage1Record, Stage2Record, Stage3Record, TranscriptWriter,
};

/// Default transcript root, relative to the working directory.
pub const DEFAULT_TRANSCRIPT_ROOT: &str = ".council/logs";

/// Phase of one deliberation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilPhase {
    Accepted,
    Stage1,
    Normalizing,
    Stage2,
    Aggregating,
    Stage3,
    Scoring,
    Writing,
    Done,
    Failed,
}

impl CouncilPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [CouncilPhase] {
        match self {
            Self::Accepted => &[Self::Stage1, Self::Failed],
            Self::Stage1 => &[Self::Normalizing, Self::Stage2, Self::Failed],
            Self::Normalizing => &[Self::Stage2, Self::Failed],
            Self::Stage2 => &[Self::Aggregating, Self::Failed],
            Self::Aggregating => &[Self::Stage3, Self::Failed],
            Self::Stage3 => &[Self::Scoring, Self::Failed],
            Self::Scoring => &[Self::Writing, Self::Failed],
            Self::Writing => &[Self::Done, Self::Failed],
            Self::Done | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for CouncilPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Stage1 => "stage1",
            Self::Normalizing => "normalizing",
            Self::Stage2 => "stage2",
            Self::Aggregating => "aggregating",
            Self::Stage3 => "stage3",
            Self::Scoring => "scoring",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate row in the stable `result.json` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub model: ModelId,
    pub borda_points: u32,
    pub mean_rubric: RubricScores,
    pub reviewer_count: usize,
}

impl From<&AggregateEntry> for AggregateSummary {
    fn from(entry: &AggregateEntry) -> Self {
        Self {
            model: entry.model.clone(),
            borda_points: entry.borda_points,
            mean_rubric: entry.mean_rubric,
            reviewer_count: entry.reviewer_count,
        }
    }
}

/// Full stage data attached to the returned envelope on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationDetails {
    pub stage1: Vec<StageResult<String>>,
    pub normalized: Option<Vec<NormalizedResponse>>,
    pub rankings: Vec<StageResult<Ranking>>,
    pub confidence: ConfidenceBreakdown,
    pub transcript_dir: Option<PathBuf>,
}

/// The user-facing result envelope; also the `result.json` schema (minus
/// `details`, which never reaches disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub request_id: String,
    pub mode: DeliberationMode,
    pub final_response: String,
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub council_models: Vec<ModelId>,
    pub chairman: ModelId,
    pub stage1_count: usize,
    pub stage2_count: usize,
    pub aggregate: Vec<AggregateSummary>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<DeliberationDetails>,
}

impl ResultEnvelope {
    /// Verify-mode exit code: 0 pass, 1 fail, 2 unclear; non-verdict runs
    /// exit 0.
    pub fn exit_code(&self) -> i32 {
        self.verdict.map_or(0, Verdict::exit_code)
    }
}

/// Top-level deliberation driver.
pub struct Orchestrator {
    caller: Arc<dyn ModelCaller>,
    config: CouncilConfig,
    bus: SharedEventBus,
    transcript_root: PathBuf,
}

impl Orchestrator {
    pub fn new(caller: Arc<dyn ModelCaller>, config: CouncilConfig, bus: SharedEventBus) -> Self {
        Self {
            caller,
            config,
            bus,
            transcript_root: PathBuf::from(DEFAULT_TRANSCRIPT_ROOT),
        }
    }

    /// Write transcripts under `root` instead of the default.
    pub fn with_transcript_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.transcript_root = root.into();
        self
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    /// Run one deliberation to completion.
    pub async fn deliberate(&self, query: Query) -> Result<ResultEnvelope, DeliberationFailure> {
        self.deliberate_with_cancel(query, CancellationToken::new())
            .await
    }

    /// Run one deliberation under an external cancellation token.
    ///
    /// The whole request is bounded by the sum of the stage timeouts plus
    /// five seconds of grace; hitting that ceiling cancels every in-flight
    /// call and fails the request.
    pub async fn deliberate_with_cancel(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ResultEnvelope, DeliberationFailure> {
        let request_id = short_request_id();
        let started_at = Utc::now();
        let ceiling = self.config.per_stage_timeout_ms.request_ceiling();

        let run = self.run_request(request_id.clone(), started_at, query, cancel.clone());
        match tokio::time::timeout(ceiling, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                let error = CouncilError::Cancelled;
                self.publish_error(&request_id, &error);
                Err(DeliberationFailure {
                    error,
                    request_id,
                    partial_transcript_path: None,
                })
            }
        }
    }

    async fn run_request(
        &self,
        request_id: String,
        started_at: DateTime<Utc>,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ResultEnvelope, DeliberationFailure> {
        let mut phase = CouncilPhase::Accepted;

        if let Err(error) = self.config.validate().and_then(|()| query.validate()) {
            self.publish_error(&request_id, &error);
            return Err(DeliberationFailure {
                error,
                request_id,
                partial_transcript_path: None,
            });
        }

        info!(request_id, mode = %query.mode, council = self.config.council_models.len(), "deliberation accepted");
        self.bus.publish(CouncilEvent::DeliberationStart {
            request_id: request_id.clone(),
            mode: query.mode,
            council: self.config.council_models.clone(),
            timestamp: Utc::now(),
        });

        let writer = match TranscriptWriter::create(&self.transcript_root, started_at, &request_id)
            .await
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                self.transcript_warning(&request_id, &e);
                None
            }
        };

        let fail = |error: CouncilError, writer: &Option<TranscriptWriter>| {
            self.publish_error(&request_id, &error);
            DeliberationFailure {
                error,
                request_id: request_id.clone(),
                partial_transcript_path: writer.as_ref().map(|w| w.dir().to_path_buf()),
            }
        };

        // request.json carries everything needed to replay the request.
        let labels = LabelMap::assign(&self.config.council_models);
        if let Some(w) = &writer {
            let record = RequestRecord {
                request_id: request_id.clone(),
                query: query.clone(),
                config: self.config.clone(),
                label_map: labels.clone(),
                started_at,
            };
            if let Err(e) = w.write_request(&record).await {
                self.transcript_warning(&request_id, &e);
            }
        }

        // ── Stage 1: independent responses ─────────────────────────────
        advance(&mut phase, CouncilPhase::Stage1, &request_id);
        let runner = StageRunner::new(self.caller.clone(), cancel);

        let stage1_results = match respond::run(&runner, &self.config, &query).await {
            Ok(results) => results,
            Err(error) => {
                advance(&mut phase, CouncilPhase::Failed, &request_id);
                return Err(fail(error, &writer));
            }
        };
        let ok = stage1_results.iter().filter(|r| r.is_ok()).count();
        self.bus.publish(CouncilEvent::Stage1Complete {
            request_id: request_id.clone(),
            ok,
            failed: stage1_results.len() - ok,
            timestamp: Utc::now(),
        });

        if let Err(error) = respond::check_quorum(&stage1_results) {
            if let Some(w) = &writer {
                let record = Stage1Record {
                    results: stage1_results,
                    normalized: None,
                };
                if let Err(e) = w.write_stage1(&record).await {
                    self.transcript_warning(&request_id, &e);
                }
            }
            advance(&mut phase, CouncilPhase::Failed, &request_id);
            return Err(fail(error, &writer));
        }
        let survivors = respond::survivors(&stage1_results);

        // ── Optional normalization pass ────────────────────────────────
        let normalized = if self.config.style_normalization {
            advance(&mut phase, CouncilPhase::Normalizing, &request_id);
            match normalize::run(&runner, &self.config, &survivors).await {
                Ok(normalized) => normalized,
                Err(error) => {
                    advance(&mut phase, CouncilPhase::Failed, &request_id);
                    return Err(fail(error, &writer));
                }
            }
        } else {
            normalize::passthrough(&survivors)
        };

        if let Some(w) = &writer {
            let record = Stage1Record {
                results: stage1_results.clone(),
                normalized: self.config.style_normalization.then(|| normalized.clone()),
            };
            if let Err(e) = w.write_stage1(&record).await {
                self.transcript_warning(&request_id, &e);
            }
        }

        // ── Stage 2: anonymized peer ranking ───────────────────────────
        advance(&mut phase, CouncilPhase::Stage2, &request_id);
        let stage2 = match rank::run(
            &runner,
            &self.config,
            &query,
            &labels,
            &normalized,
            &self.bus,
            &request_id,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                advance(&mut phase, CouncilPhase::Failed, &request_id);
                return Err(fail(error, &writer));
            }
        };
        let rankings = stage2.valid_rankings();
        self.bus.publish(CouncilEvent::Stage2Complete {
            request_id: request_id.clone(),
            valid_rankings: rankings.len(),
            timestamp: Utc::now(),
        });

        // ── Aggregation ────────────────────────────────────────────────
        advance(&mut phase, CouncilPhase::Aggregating, &request_id);
        let responder_ids: Vec<ModelId> = survivors.iter().map(|(m, _)| m.clone()).collect();
        let aggregate_table = aggregate::aggregate(
            &rankings,
            &labels,
            &responder_ids,
            self.config.exclude_self_votes,
        );

        if let Some(w) = &writer {
            let record = Stage2Record {
                results: stage2.results.clone(),
                aggregate: aggregate_table.clone(),
                retried: stage2.retried.clone(),
            };
            if let Err(e) = w.write_stage2(&record).await {
                self.transcript_warning(&request_id, &e);
            }
        }

        // ── Stage 3: chairman synthesis ────────────────────────────────
        advance(&mut phase, CouncilPhase::Stage3, &request_id);
        let stage3_result =
            match synthesize::run(&runner, &self.config, &query, &survivors, &aggregate_table)
                .await
            {
                Ok(result) => result,
                Err(error) => {
                    advance(&mut phase, CouncilPhase::Failed, &request_id);
                    return Err(fail(error, &writer));
                }
            };
        self.bus.publish(CouncilEvent::Stage3Complete {
            request_id: request_id.clone(),
            chairman: self.config.chairman_model.clone(),
            timestamp: Utc::now(),
        });

        // ── Confidence scoring and verdict mapping ─────────────────────
        advance(&mut phase, CouncilPhase::Scoring, &request_id);
        let breakdown =
            confidence::score(&rankings, &aggregate_table, &self.config.confidence_weights);
        let text = stage3_result.value.clone().unwrap_or_default();

        let (verdict, reported_confidence, raw_verdict) = match query.verdict_type {
            VerdictType::Binary => {
                let raw = synthesize::extract_verdict(&text);
                let (verdict, confidence) = confidence::map_verdict(
                    raw,
                    breakdown.confidence,
                    query.confidence_threshold,
                );
                (Some(verdict), confidence, raw)
            }
            VerdictType::None => (None, breakdown.confidence, None),
        };

        let synthesis = Synthesis {
            chairman: self.config.chairman_model.clone(),
            text: text.clone(),
            verdict,
            confidence: Some(reported_confidence),
            extracted_verdict_raw: raw_verdict,
        };

        if let Some(w) = &writer {
            let record = Stage3Record {
                result: stage3_result.clone(),
                synthesis: synthesis.clone(),
            };
            if let Err(e) = w.write_stage3(&record).await {
                self.transcript_warning(&request_id, &e);
            }
        }

        // ── Result envelope ────────────────────────────────────────────
        advance(&mut phase, CouncilPhase::Writing, &request_id);
        let mut envelope = ResultEnvelope {
            request_id: request_id.clone(),
            mode: query.mode,
            final_response: text,
            verdict,
            confidence: Some(reported_confidence),
            council_models: self.config.council_models.clone(),
            chairman: self.config.chairman_model.clone(),
            stage1_count: survivors.len(),
            stage2_count: rankings.len(),
            aggregate: aggregate_table.iter().map(AggregateSummary::from).collect(),
            started_at,
            ended_at: Utc::now(),
            details: None,
        };

        if let Some(w) = &writer {
            if let Err(e) = w.write_result(&envelope).await {
                self.transcript_warning(&request_id, &e);
            }
        }

        let transcript_dir = writer.as_ref().map(|w| w.dir().to_path_buf());
        self.bus.publish(CouncilEvent::Complete {
            request_id: request_id.clone(),
            transcript_dir: transcript_dir
                .as_ref()
                .map(|p| p.display().to_string()),
            timestamp: Utc::now(),
        });
        advance(&mut phase, CouncilPhase::Done, &request_id);
        info!(request_id, confidence = reported_confidence, "deliberation complete");

        if query.include_details {
            envelope.details = Some(DeliberationDetails {
                stage1: stage1_results,
                normalized: self.config.style_normalization.then_some(normalized),
                rankings: stage2.results,
                confidence: breakdown,
                transcript_dir,
            });
        }

        Ok(envelope)
    }

    fn publish_error(&self, request_id: &str, error: &CouncilError) {
        warn!(request_id, error = %error, "deliberation failed");
        self.bus.publish(CouncilEvent::Error {
            request_id: request_id.to_string(),
            kind: error.kind().to_string(),
            detail: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn transcript_warning(&self, request_id: &str, error: &TranscriptError) {
        warn!(request_id, error = %error, "transcript write failed");
        self.bus.publish(CouncilEvent::Error {
            request_id: request_id.to_string(),
            kind: "transcript_write".to_string(),
            detail: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Move to the next phase, tracing the transition.
fn advance(phase: &mut CouncilPhase, to: CouncilPhase, request_id: &str) {
    debug_assert!(
        phase.valid_transitions().contains(&to),
        "invalid transition {} -> {}",
        phase,
        to
    );
    debug!(request_id, from = %phase, to = %to, "phase transition");
    *phase = to;
}

fn short_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Convenience for binary deliberations driven from a CLI: the §6 exit code.
pub fn exit_code_for(outcome: &Result<ResultEnvelope, DeliberationFailure>) -> i32 {
    match outcome {
        Ok(envelope) => envelope.exit_code(),
        Err(_) => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(CouncilPhase::Accepted
            .valid_transitions()
            .contains(&CouncilPhase::Stage1));
        assert!(CouncilPhase::Stage1
            .valid_transitions()
            .contains(&CouncilPhase::Normalizing));
        assert!(CouncilPhase::Stage1
            .valid_transitions()
            .contains(&CouncilPhase::Stage2));
        assert!(!CouncilPhase::Stage2
            .valid_transitions()
            .contains(&CouncilPhase::Stage1));
        assert!(CouncilPhase::Done.valid_transitions().is_empty());
        assert!(CouncilPhase::Failed.valid_transitions().is_empty());
    }

    #[test]
    fn test_every_active_phase_can_fail() {
        for phase in [
            CouncilPhase::Accepted,
            CouncilPhase::Stage1,
            CouncilPhase::Normalizing,
            CouncilPhase::Stage2,
            CouncilPhase::Aggregating,
            CouncilPhase::Stage3,
            CouncilPhase::Scoring,
            CouncilPhase::Writing,
        ] {
            assert!(phase.valid_transitions().contains(&CouncilPhase::Failed));
            assert!(!phase.is_terminal());
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CouncilPhase::Stage1.to_string(), "stage1");
        assert_eq!(CouncilPhase::Normalizing.to_string(), "normalizing");
        assert_eq!(CouncilPhase::Failed.to_string(), "failed");
    }

    #[test]
    fn test_short_request_id_shape() {
        let id = short_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_exit_code_for_error_is_3() {
        let failure: Result<ResultEnvelope, DeliberationFailure> = Err(DeliberationFailure {
            error: CouncilError::Cancelled,
            request_id: "r".to_string(),
            partial_transcript_path: None,
        });
        assert_eq!(exit_code_for(&failure), 3);
    }
}
