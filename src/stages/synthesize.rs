//! Stage 3 — chairman synthesis.
//!
//! The chairman sees the original query, every surviving Stage 1 response
//! with model attribution restored, and the aggregate standings, then
//! produces the final answer. In binary-verdict mode it must close with a
//! `FINAL_VERDICT:` line, which is extracted by scanning from the end of the
//! output. A failed chairman call is retried once after a short backoff;
//! failing again is fatal.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregate::AggregateEntry;
use crate::caller::Prompt;
use crate::config::CouncilConfig;
use crate::error::{CouncilError, ErrorKind};
use crate::query::{DeliberationMode, ModelId, Query, VerdictType};
use crate::runner::{StageCall, StageResult, StageRunner};

/// Backoff before the single chairman retry.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const SYNTHESIS_SYSTEM: &str = "You are the chairman of a council of models. \
You weigh the council's responses and their peer-review standings, then \
deliver the final answer under your own authority.";

/// The verdict line the chairman is instructed to emit verbatim.
static VERDICT_LINE: OnceLock<Regex> = OnceLock::new();

fn verdict_line() -> &'static Regex {
    VERDICT_LINE.get_or_init(|| {
        Regex::new(r"^FINAL_VERDICT:\s*(APPROVED|REJECTED)\s*$").expect("static verdict pattern")
    })
}

/// The chairman's literal APPROVED/REJECTED marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawVerdict {
    Approved,
    Rejected,
}

impl std::fmt::Display for RawVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// The engine's final classification in binary-verdict mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Unclear,
}

impl Verdict {
    /// Exit code for verify-mode drivers: 0 pass, 1 fail, 2 unclear.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Unclear => 2,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Unclear => write!(f, "unclear"),
        }
    }
}

/// The parsed product of Stage 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub chairman: ModelId,
    pub text: String,
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub extracted_verdict_raw: Option<RawVerdict>,
}

/// Render the aggregate standings as a fixed-format table.
fn render_standings(aggregate: &[AggregateEntry]) -> String {
    if aggregate.iter().all(|e| e.reviewer_count == 0) {
        return "No valid peer rankings were produced; weigh the responses on \
                their own merits.\n"
            .to_string();
    }

    let mut out = String::from(
        "model | borda | accuracy | relevance | completeness | conciseness | clarity | reviewers\n",
    );
    for entry in aggregate {
        out.push_str(&format!(
            "{} | {} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} | {}\n",
            entry.model,
            entry.borda_points,
            entry.mean_rubric.accuracy,
            entry.mean_rubric.relevance,
            entry.mean_rubric.completeness,
            entry.mean_rubric.conciseness,
            entry.mean_rubric.clarity,
            entry.reviewer_count,
        ));
    }
    out
}

fn mode_directive(mode: DeliberationMode) -> &'static str {
    match mode {
        DeliberationMode::Consensus => {
            "Produce the single best synthesized answer to the question, \
             drawing on the strongest parts of the council's responses."
        }
        DeliberationMode::Debate => {
            "Structure your answer as three sections: Points of agreement, \
             Key disagreements, and Recommended resolution."
        }
    }
}

/// Build the deterministic chairman prompt.
pub fn synthesis_prompt(
    query: &Query,
    responses: &[(ModelId, String)],
    aggregate: &[AggregateEntry],
) -> Prompt {
    let mut responses_block = String::new();
    for (model, text) in responses {
        responses_block.push_str(&format!("### Response from {model}\n\n{text}\n\n"));
    }

    let mut user = format!(
        "## Question\n\n{question}\n\n## Council responses\n\n{responses}\
         ## Peer review standings\n\n{standings}\n## Task\n\n{directive}",
        question = query.prompt,
        responses = responses_block,
        standings = render_standings(aggregate),
        directive = mode_directive(query.mode),
    );

    if query.verdict_type == VerdictType::Binary {
        user.push_str(
            "\n\nOn the last line, output exactly: `FINAL_VERDICT: APPROVED` \
             or `FINAL_VERDICT: REJECTED`.",
        );
    }

    Prompt::new(SYNTHESIS_SYSTEM, user)
}

/// Scan from the end of the chairman's output for the verdict line.
pub fn extract_verdict(text: &str) -> Option<RawVerdict> {
    for line in text.lines().rev() {
        if let Some(captures) = verdict_line().captures(line) {
            return match &captures[1] {
                "APPROVED" => Some(RawVerdict::Approved),
                _ => Some(RawVerdict::Rejected),
            };
        }
    }
    None
}

/// Run the chairman, retrying once on failure.
pub async fn run(
    runner: &StageRunner,
    config: &CouncilConfig,
    query: &Query,
    responses: &[(ModelId, String)],
    aggregate: &[AggregateEntry],
) -> Result<StageResult<String>, CouncilError> {
    let prompt = synthesis_prompt(query, responses, aggregate);
    let deadline = config.per_stage_timeout_ms.stage3() / 2;
    let chairman = config.chairman_model.clone();

    let first = runner
        .call_one(StageCall::direct(chairman.clone(), prompt.clone()), deadline)
        .await;
    if first.is_ok() {
        info!(chairman = %chairman, "stage3 complete");
        return Ok(first);
    }

    let first_error = first.error.unwrap_or(ErrorKind::Network);
    warn!(chairman = %chairman, error = %first_error, "chairman failed, retrying");
    tokio::time::sleep(RETRY_BACKOFF).await;

    let retry = runner
        .call_one(StageCall::direct(chairman.clone(), prompt), deadline)
        .await;
    if retry.is_ok() {
        info!(chairman = %chairman, "stage3 complete after retry");
        return Ok(StageResult {
            latency_ms: first.latency_ms + retry.latency_ms,
            started_at: first.started_at,
            ..retry
        });
    }

    let kind = retry.error.unwrap_or(first_error);
    Err(CouncilError::SynthesisFailed { kind })
}
