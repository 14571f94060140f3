//! Optional style normalization between Stage 1 and Stage 2.
//!
//! When enabled, each surviving response is rewritten by the normalizer
//! model into a neutral register so reviewers judge content, not voice. A
//! failed rewrite falls back to the raw text; this pass can degrade but
//! never fail the deliberation. Normalized text feeds Stage 2 only — the
//! chairman always sees the raw responses.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::caller::Prompt;
use crate::config::CouncilConfig;
use crate::error::CouncilError;
use crate::query::ModelId;
use crate::runner::{StageCall, StageRunner};

const SYSTEM_PROMPT: &str = "You rewrite text into a neutral, impersonal style. \
Remove first-person preambles, filler, and stylistic flourishes. \
Preserve every claim, caveat, and piece of reasoning exactly. \
Output only the rewritten text.";

/// A Stage 1 response with its (possibly rewritten) review-facing text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub model: ModelId,
    /// The original Stage 1 text.
    pub raw: String,
    /// Text shown to reviewers: the rewrite, or `raw` on fallback.
    pub text: String,
    /// Whether the rewrite succeeded.
    pub normalized: bool,
}

/// Prompt asking the normalizer to rewrite one response.
pub fn normalize_prompt(text: &str) -> Prompt {
    Prompt::new(SYSTEM_PROMPT, text.to_string())
}

/// Rewrite every surviving response through the normalizer model.
pub async fn run(
    runner: &StageRunner,
    config: &CouncilConfig,
    responses: &[(ModelId, String)],
) -> Result<Vec<NormalizedResponse>, CouncilError> {
    let Some(normalizer) = config.normalizer_model.as_deref() else {
        return Ok(passthrough(responses));
    };

    let calls: Vec<StageCall> = responses
        .iter()
        .map(|(model, text)| StageCall {
            target: normalizer.to_string(),
            attributed_to: model.clone(),
            prompt: normalize_prompt(text),
        })
        .collect();

    let results = runner
        .run(calls, config.per_stage_timeout_ms.stage1())
        .await?;

    let normalized = responses
        .iter()
        .zip(results)
        .map(|((model, raw), result)| match result.value {
            Some(text) if !text.trim().is_empty() => NormalizedResponse {
                model: model.clone(),
                raw: raw.clone(),
                text,
                normalized: true,
            },
            _ => {
                warn!(model = %model, "normalization failed, falling back to raw text");
                NormalizedResponse {
                    model: model.clone(),
                    raw: raw.clone(),
                    text: raw.clone(),
                    normalized: false,
                }
            }
        })
        .collect();

    Ok(normalized)
}

/// Identity pass used when normalization is disabled.
pub fn passthrough(responses: &[(ModelId, String)]) -> Vec<NormalizedResponse> {
    responses
        .iter()
        .map(|(model, text)| NormalizedResponse {
            model: model.clone(),
            raw: text.clone(),
            text: text.clone(),
            normalized: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{CallError, CallOutput, ModelCaller};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FlakyNormalizer;

    #[async_trait]
    impl ModelCaller for FlakyNormalizer {
        async fn call(
            &self,
            _model: &str,
            prompt: &Prompt,
            _timeout: Duration,
        ) -> Result<CallOutput, CallError> {
            if prompt.user.contains("fail-me") {
                Err(CallError::Upstream5xx { status: 502 })
            } else {
                Ok(CallOutput {
                    text: format!("neutral: {}", prompt.user),
                    latency_ms: 1,
                })
            }
        }
    }

    fn config() -> CouncilConfig {
        let mut config = CouncilConfig::new(vec!["m1".into(), "m2".into()], "mc");
        config.normalizer_model = Some("mn".into());
        config.style_normalization = true;
        config
    }

    #[tokio::test]
    async fn test_rewrite_and_fallback() {
        let runner = StageRunner::new(Arc::new(FlakyNormalizer), CancellationToken::new());
        let responses = vec![
            ("m1".to_string(), "long winded answer".to_string()),
            ("m2".to_string(), "fail-me please".to_string()),
        ];

        let normalized = run(&runner, &config(), &responses).await.unwrap();

        assert_eq!(normalized[0].model, "m1");
        assert!(normalized[0].normalized);
        assert_eq!(normalized[0].text, "neutral: long winded answer");
        assert_eq!(normalized[0].raw, "long winded answer");

        assert_eq!(normalized[1].model, "m2");
        assert!(!normalized[1].normalized);
        assert_eq!(normalized[1].text, "fail-me please");
    }

    #[tokio::test]
    async fn test_no_normalizer_is_passthrough() {
        let runner = StageRunner::new(Arc::new(FlakyNormalizer), CancellationToken::new());
        let mut config = config();
        config.normalizer_model = None;
        config.style_normalization = false;

        let responses = vec![("m1".to_string(), "as-is".to_string())];
        let normalized = run(&runner, &config, &responses).await.unwrap();
        assert!(!normalized[0].normalized);
        assert_eq!(normalized[0].text, "as-is");
    }

    #[test]
    fn test_passthrough_keeps_order() {
        let responses = vec![
            ("m2".to_string(), "b".to_string()),
            ("m1".to_string(), "a".to_string()),
        ];
        let normalized = passthrough(&responses);
        assert_eq!(normalized[0].model, "m2");
        assert_eq!(normalized[1].model, "m1");
    }
}
