//! Stage 1 — independent responses.
//!
//! Every council model answers the query in parallel, with no knowledge of
//! its peers. The stage succeeds when at least [`MIN_RESPONDERS`] models
//! answer; failed models are recorded in the transcript and dropped from
//! every later stage.

use tracing::{info, warn};

use crate::caller::Prompt;
use crate::config::CouncilConfig;
use crate::error::CouncilError;
use crate::query::{ModelId, Query};
use crate::runner::{StageCall, StageResult, StageRunner};

/// Minimum successful responses for the deliberation to continue.
pub const MIN_RESPONDERS: usize = 2;

const SYSTEM_PROMPT: &str = "You are one member of an expert council. \
Answer the user's question directly, accurately, and completely. \
Do not speculate about other council members or their answers.";

/// The plain Stage 1 prompt for one council model.
pub fn response_prompt(query: &Query) -> Prompt {
    Prompt::new(SYSTEM_PROMPT, query.prompt.clone())
}

/// Fan the query out to the whole council.
pub async fn run(
    runner: &StageRunner,
    config: &CouncilConfig,
    query: &Query,
) -> Result<Vec<StageResult<String>>, CouncilError> {
    let calls: Vec<StageCall> = config
        .council_models
        .iter()
        .map(|model| StageCall::direct(model.clone(), response_prompt(query)))
        .collect();

    let results = runner
        .run(calls, config.per_stage_timeout_ms.stage1())
        .await?;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    if ok < results.len() {
        warn!(
            ok,
            failed = results.len() - ok,
            "stage1 finished with failed responders"
        );
    } else {
        info!(ok, "stage1 complete");
    }

    Ok(results)
}

/// Check the degradation policy: fewer than two responders is fatal.
pub fn check_quorum(results: &[StageResult<String>]) -> Result<(), CouncilError> {
    let got = results.iter().filter(|r| r.is_ok()).count();
    if got < MIN_RESPONDERS {
        return Err(CouncilError::InsufficientResponders {
            got,
            want: MIN_RESPONDERS,
        });
    }
    Ok(())
}

/// The `(model, text)` pairs that survived Stage 1, in council order.
pub fn survivors(results: &[StageResult<String>]) -> Vec<(ModelId, String)> {
    results
        .iter()
        .filter_map(|r| {
            r.value
                .as_ref()
                .map(|text| (r.model.clone(), text.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Utc;

    fn ok(model: &str, text: &str) -> StageResult<String> {
        let now = Utc::now();
        StageResult::ok(model.to_string(), text.to_string(), 1, now, now)
    }

    fn err(model: &str) -> StageResult<String> {
        let now = Utc::now();
        StageResult::err(model.to_string(), ErrorKind::ModelTimeout, 1, now, now)
    }

    #[test]
    fn test_prompt_contains_query() {
        let prompt = response_prompt(&Query::new("What is 2+2?"));
        assert_eq!(prompt.user, "What is 2+2?");
        assert!(prompt.system.contains("council"));
    }

    #[test]
    fn test_quorum_ok_with_two() {
        let results = vec![ok("m1", "a"), err("m2"), ok("m3", "c")];
        assert!(check_quorum(&results).is_ok());
    }

    #[test]
    fn test_quorum_fails_with_one() {
        let results = vec![ok("m1", "a"), err("m2"), err("m3")];
        let err = check_quorum(&results).unwrap_err();
        assert!(matches!(
            err,
            CouncilError::InsufficientResponders { got: 1, want: 2 }
        ));
    }

    #[test]
    fn test_survivors_preserve_council_order() {
        let results = vec![ok("m1", "a"), err("m2"), ok("m3", "c")];
        let survivors = survivors(&results);
        assert_eq!(
            survivors,
            vec![
                ("m1".to_string(), "a".to_string()),
                ("m3".to_string(), "c".to_string())
            ]
        );
    }
}
