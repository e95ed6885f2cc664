//! Retry and circuit-breaker wrapper for vector store calls.
//!
//! Every store operation runs through [`ResilienceLayer::execute`]: transient failures
//! (transport errors, timeouts, 5xx) are retried up to 3 times with exponential backoff;
//! a per-endpoint breaker opens after 5 consecutive failures, stays open for the
//! cooldown, then half-opens and admits a single probe. Calls made while the breaker is
//! open fail fast with [`VectorStoreError::Unavailable`].

use super::types::VectorStoreError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_RETRIES: usize = 3;
const OPEN_AFTER_FAILURES: u32 = 5;

pub(crate) struct ResilienceLayer {
    backoff_base: Duration,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

enum Admission {
    Allowed,
    Probe,
    Rejected,
}

impl ResilienceLayer {
    pub(crate) fn new() -> Self {
        Self::with_timing(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Timing-injectable constructor used by tests to compress backoff and cooldown.
    pub(crate) fn with_timing(backoff_base: Duration, cooldown: Duration) -> Self {
        Self {
            backoff_base,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `call` under the retry policy and the breaker for `endpoint`.
    pub(crate) async fn execute<T, F, Fut>(
        &self,
        endpoint: &str,
        mut call: F,
    ) -> Result<T, VectorStoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, VectorStoreError>>,
    {
        match self.admit(endpoint) {
            Admission::Rejected => {
                return Err(VectorStoreError::Unavailable(format!(
                    "circuit breaker open for '{endpoint}'"
                )));
            }
            Admission::Probe => {
                // Half-open: a single attempt decides whether the breaker closes.
                return match call().await {
                    Ok(value) => {
                        self.record_success(endpoint);
                        Ok(value)
                    }
                    Err(error) => {
                        self.record_failure(endpoint);
                        Err(error)
                    }
                };
            }
            Admission::Allowed => {}
        }

        let mut last: Option<VectorStoreError> = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = self.backoff_base * (1 << (attempt - 1));
                tracing::debug!(
                    endpoint,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying vector store call"
                );
                tokio::time::sleep(backoff).await;
            }
            match call().await {
                Ok(value) => {
                    self.record_success(endpoint);
                    return Ok(value);
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(endpoint, attempt, error = %error, "Vector store call failed");
                    last = Some(error);
                }
                Err(error) => {
                    // Non-transient outcomes do not trip the breaker.
                    return Err(error);
                }
            }
        }

        self.record_failure(endpoint);
        Err(match last {
            Some(VectorStoreError::Unavailable(detail)) => VectorStoreError::Unavailable(detail),
            Some(error) => VectorStoreError::Unavailable(error.to_string()),
            None => VectorStoreError::Unavailable("vector store call failed".into()),
        })
    }

    fn admit(&self, endpoint: &str) -> Admission {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers.entry(endpoint.to_string()).or_default();
        let Some(opened_at) = state.opened_at else {
            return Admission::Allowed;
        };
        if opened_at.elapsed() < self.cooldown {
            return Admission::Rejected;
        }
        if state.probing {
            // Another task already holds the half-open probe.
            return Admission::Rejected;
        }
        state.probing = true;
        Admission::Probe
    }

    fn record_success(&self, endpoint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers.entry(endpoint.to_string()).or_default();
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probing = false;
    }

    fn record_failure(&self, endpoint: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers.entry(endpoint.to_string()).or_default();
        state.probing = false;
        if state.opened_at.is_some() {
            // Failed half-open probe; restart the cooldown.
            state.opened_at = Some(Instant::now());
            return;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= OPEN_AFTER_FAILURES {
            tracing::warn!(endpoint, "Circuit breaker opened");
            state.opened_at = Some(Instant::now());
        }
    }
}
