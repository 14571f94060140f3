//! OpenAI-compatible HTTP gateway caller.
//!
//! One [`OpenRouterCaller`] serves every model id the config names; routing
//! between upstreams is the gateway's concern. Works against OpenRouter or
//! any endpoint speaking the chat-completions protocol.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::breaker::CircuitBreaker;
use super::{CallError, CallOutput, ModelCaller, Prompt};

/// Default public OpenRouter chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// HTTP [`ModelCaller`] with a per-model circuit breaker.
pub struct OpenRouterCaller {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    breaker: Mutex<CircuitBreaker>,
}

impl OpenRouterCaller {
    /// Create a caller against `endpoint` authenticating with `api_key`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            breaker: Mutex::new(CircuitBreaker::default()),
        }
    }

    /// Caller against the public OpenRouter endpoint.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new(DEFAULT_ENDPOINT, api_key)
    }

    /// Replace the default circuit breaker.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Mutex::new(breaker);
        self
    }

    fn check_circuit(&self, model: &str) -> Result<(), CallError> {
        let breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        if breaker.allow(model) {
            Ok(())
        } else {
            Err(CallError::CircuitOpen {
                model: model.to_string(),
            })
        }
    }

    fn record(&self, model: &str, outcome: &Result<CallOutput, CallError>) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(_) => breaker.record_success(model),
            // Only service failures move the circuit.
            Err(CallError::Upstream4xx { .. }) | Err(CallError::MalformedResponse(_)) => {}
            Err(_) => {
                breaker.record_failure(model);
                if !breaker.allow(model) {
                    warn!(model, failures = breaker.failure_count(model), "circuit opened");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        model: &str,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<CallOutput, CallError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    CallError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(CallError::RateLimited { retry_after_ms });
        }
        if status.is_client_error() {
            return Err(CallError::Upstream4xx {
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            return Err(CallError::Upstream5xx {
                status: status.as_u16(),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::MalformedResponse(e.to_string()))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                CallError::MalformedResponse("missing choices[0].message.content".to_string())
            })?
            .to_string();

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model, latency_ms, "gateway call ok");

        Ok(CallOutput { text, latency_ms })
    }
}

#[async_trait]
impl ModelCaller for OpenRouterCaller {
    async fn call(
        &self,
        model: &str,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<CallOutput, CallError> {
        self.check_circuit(model)?;
        let outcome = self.dispatch(model, prompt, timeout).await;
        self.record(model, &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_circuit_refuses_fast() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(9999));
        breaker.record_failure("m1");
        let caller =
            OpenRouterCaller::new("http://127.0.0.1:1", "test-key").with_breaker(breaker);

        let err = caller
            .call("m1", &Prompt::new("s", "u"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        // Nothing listens on port 1; the connect fails immediately.
        let caller = OpenRouterCaller::new("http://127.0.0.1:1", "test-key");
        let err = caller
            .call("m1", &Prompt::new("s", "u"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Network(_) | CallError::Timeout { .. }
        ));
        // The failure moved the circuit.
        assert_eq!(
            caller
                .breaker
                .lock()
                .unwrap()
                .failure_count("m1"),
            1
        );
    }
}
