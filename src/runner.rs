//! Generic concurrent stage fan-out.
//!
//! A stage hands the runner a list of calls; the runner launches them all
//! concurrently, applies the per-call deadline, and returns results in the
//! order the calls were given regardless of completion order. Individual
//! failures never cancel peers; cancelling the request drops every in-flight
//! call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::caller::{ModelCaller, Prompt};
use crate::error::{CouncilError, ErrorKind};
use crate::query::ModelId;

/// Outcome of one call within a stage. Exactly one of `value`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult<T> {
    /// The council model this result is attributed to.
    pub model: ModelId,
    pub value: Option<T>,
    pub error: Option<ErrorKind>,
    pub latency_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl<T> StageResult<T> {
    pub fn ok(
        model: ModelId,
        value: T,
        latency_ms: u64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model,
            value: Some(value),
            error: None,
            latency_ms,
            started_at,
            ended_at,
        }
    }

    pub fn err(
        model: ModelId,
        error: ErrorKind,
        latency_ms: u64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model,
            value: None,
            error: Some(error),
            latency_ms,
            started_at,
            ended_at,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }

    /// Map the success value, keeping attribution and timing.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageResult<U> {
        StageResult {
            model: self.model,
            value: self.value.map(f),
            error: self.error,
            latency_ms: self.latency_ms,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// One call a stage wants made.
#[derive(Debug, Clone)]
pub struct StageCall {
    /// Model actually dispatched to.
    pub target: ModelId,
    /// Council model the result is recorded under. Differs from `target`
    /// only during style normalization.
    pub attributed_to: ModelId,
    pub prompt: Prompt,
}

impl StageCall {
    /// A call recorded under the model it targets.
    pub fn direct(target: ModelId, prompt: Prompt) -> Self {
        Self {
            attributed_to: target.clone(),
            target,
            prompt,
        }
    }
}

/// Concurrent fan-out executor shared by all stages of one request.
pub struct StageRunner {
    caller: Arc<dyn ModelCaller>,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(caller: Arc<dyn ModelCaller>, cancel: CancellationToken) -> Self {
        Self { caller, cancel }
    }

    /// Run every call concurrently and return results in input order.
    ///
    /// Each call gets a deadline of half the stage timeout, which leaves the
    /// stage budget to wait for slower peers after an early timeout and keeps
    /// the whole fan-out inside `stage_timeout` plus grace.
    pub async fn run(
        &self,
        calls: Vec<StageCall>,
        stage_timeout: Duration,
    ) -> Result<Vec<StageResult<String>>, CouncilError> {
        let per_call = stage_timeout / 2;
        let futures: Vec<_> = calls
            .into_iter()
            .map(|call| self.call_one(call, per_call))
            .collect();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CouncilError::Cancelled),
            results = join_all(futures) => Ok(results),
        }
    }

    /// Run a single call with the given deadline.
    pub async fn call_one(&self, call: StageCall, deadline: Duration) -> StageResult<String> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let outcome =
            tokio::time::timeout(deadline, self.caller.call(&call.target, &call.prompt, deadline))
                .await;

        let latency_ms = clock.elapsed().as_millis() as u64;
        let ended_at = Utc::now();

        match outcome {
            Ok(Ok(output)) => {
                debug!(model = %call.target, latency_ms, "call ok");
                StageResult::ok(call.attributed_to, output.text, latency_ms, started_at, ended_at)
            }
            Ok(Err(err)) => {
                let kind = ErrorKind::from(&err);
                debug!(model = %call.target, %kind, "call failed");
                StageResult::err(call.attributed_to, kind, latency_ms, started_at, ended_at)
            }
            Err(_) => {
                debug!(model = %call.target, deadline_ms = deadline.as_millis() as u64, "call deadline hit");
                StageResult::err(
                    call.attributed_to,
                    ErrorKind::ModelTimeout,
                    latency_ms,
                    started_at,
                    ended_at,
                )
            }
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{CallError, CallOutput};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Caller that serves canned outcomes per model, optionally after a delay.
    struct CannedCaller {
        outcomes: HashMap<ModelId, Result<String, CallError>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ModelCaller for CannedCaller {
        async fn call(
            &self,
            model: &str,
            _prompt: &Prompt,
            _timeout: Duration,
        ) -> Result<CallOutput, CallError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.outcomes.get(model) {
                Some(Ok(text)) => Ok(CallOutput {
                    text: text.clone(),
                    latency_ms: 1,
                }),
                Some(Err(err)) => Err(err.clone()),
                None => Err(CallError::Network("unknown model".to_string())),
            }
        }
    }

    fn runner(outcomes: Vec<(&str, Result<String, CallError>)>) -> StageRunner {
        let caller = CannedCaller {
            outcomes: outcomes
                .into_iter()
                .map(|(m, o)| (m.to_string(), o))
                .collect(),
            delay: None,
        };
        StageRunner::new(Arc::new(caller), CancellationToken::new())
    }

    fn calls(models: &[&str]) -> Vec<StageCall> {
        models
            .iter()
            .map(|m| StageCall::direct(m.to_string(), Prompt::new("s", "u")))
            .collect()
    }

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let runner = runner(vec![
            ("m1", Ok("a".to_string())),
            ("m2", Err(CallError::Upstream5xx { status: 500 })),
            ("m3", Ok("c".to_string())),
        ]);

        let results = runner
            .run(calls(&["m1", "m2", "m3"]), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].model, "m1");
        assert_eq!(results[0].value.as_deref(), Some("a"));
        assert_eq!(results[1].model, "m2");
        assert_eq!(results[1].error, Some(ErrorKind::Upstream5xx));
        assert_eq!(results[2].model, "m3");
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_peers() {
        let runner = runner(vec![
            ("m1", Err(CallError::Network("down".to_string()))),
            ("m2", Ok("fine".to_string())),
        ]);
        let results = runner
            .run(calls(&["m1", "m2"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!results[0].is_ok());
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let caller = CannedCaller {
            outcomes: [("m1".to_string(), Ok("late".to_string()))]
                .into_iter()
                .collect(),
            delay: Some(Duration::from_millis(200)),
        };
        let runner = StageRunner::new(Arc::new(caller), CancellationToken::new());

        // Stage timeout 100ms → per-call deadline 50ms.
        let results = runner
            .run(calls(&["m1"]), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(results[0].error, Some(ErrorKind::ModelTimeout));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_stage() {
        let caller = CannedCaller {
            outcomes: [("m1".to_string(), Ok("x".to_string()))]
                .into_iter()
                .collect(),
            delay: Some(Duration::from_secs(30)),
        };
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(Arc::new(caller), cancel.clone());

        let handle = tokio::spawn(async move {
            runner.run(calls(&["m1"]), Duration::from_secs(120)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Err(CouncilError::Cancelled)));
    }

    #[tokio::test]
    async fn test_attribution_differs_from_target() {
        let runner = runner(vec![("normalizer", Ok("clean".to_string()))]);
        let call = StageCall {
            target: "normalizer".to_string(),
            attributed_to: "m1".to_string(),
            prompt: Prompt::new("s", "u"),
        };
        let results = runner.run(vec![call], Duration::from_secs(5)).await.unwrap();
        assert_eq!(results[0].model, "m1");
        assert_eq!(results[0].value.as_deref(), Some("clean"));
    }

    #[test]
    fn test_stage_result_map() {
        let now = Utc::now();
        let result = StageResult::ok("m1".to_string(), "7".to_string(), 3, now, now);
        let mapped = result.map(|s| s.parse::<i32>().unwrap());
        assert_eq!(mapped.value, Some(7));
        assert_eq!(mapped.model, "m1");
    }
}
