//! Per-model circuit breaker for the gateway caller.
//!
//! Tracks consecutive failures per model id. When failures reach the
//! threshold the circuit *opens* and calls are refused fast. After a cooldown
//! the circuit is *half-open*: one probe call is allowed, and a success
//! closes the circuit while a failure reopens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Circuit state for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy — calls allowed.
    Closed,
    /// Tripped — calls refused until cooldown expires.
    Open,
    /// Cooldown expired — one probe call allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Consecutive-failure circuit breaker keyed by model id.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, Instant>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open becomes HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    /// Record a success — resets the circuit to Closed.
    pub fn record_success(&mut self, model: &str) {
        self.consecutive_failures.remove(model);
        self.last_failure.remove(model);
    }

    /// Record a failure — may trip the circuit to Open.
    pub fn record_failure(&mut self, model: &str) {
        *self
            .consecutive_failures
            .entry(model.to_string())
            .or_insert(0) += 1;
        self.last_failure.insert(model.to_string(), Instant::now());
    }

    /// Current circuit state for `model`.
    pub fn state(&self, model: &str) -> CircuitState {
        let failures = self
            .consecutive_failures
            .get(model)
            .copied()
            .unwrap_or(0);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure.get(model) {
            Some(last) if last.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
            None => CircuitState::Closed,
        }
    }

    /// Whether a call to `model` should proceed (Closed or HalfOpen).
    pub fn allow(&self, model: &str) -> bool {
        !matches!(self.state(model), CircuitState::Open)
    }

    /// Consecutive failures recorded for `model`.
    pub fn failure_count(&self, model: &str) -> u32 {
        self.consecutive_failures.get(model).copied().unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
