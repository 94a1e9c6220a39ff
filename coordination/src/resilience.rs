//! Resilience: transient-error retry and provider health
//!
//! ```text
//! call ──► Ok ─────────────────────────────► return
//!   └───► Err(transient) ─ sleep(backoff) ─► call again (up to max_attempts)
//!   └───► Err(other) ──────────────────────► return immediately
//! ```
//!
//! The retry budget here is independent of the pipeline's refinement budget:
//! it only covers the same request failing for infrastructure reasons.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::ProviderError;

/// Exponential backoff policy for transient provider errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Longest one retried call can take when every attempt runs into
    /// `call_timeout`.
    pub fn worst_case(&self, call_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waits: Duration = (1..attempts).map(|retry| self.delay_for(retry)).sum();
        call_timeout * attempts + waits
    }

    /// Delay honoring a provider-supplied Retry-After when it is longer.
    pub fn delay_after(&self, retry: u32, err: &ProviderError) -> Duration {
        let backoff = self.delay_for(retry);
        match err.retry_after() {
            Some(hint) if hint > backoff => hint.min(Duration::from_millis(self.max_delay_ms)),
            _ => backoff,
        }
    }
}

/// Run `op`, retrying transient [`ProviderError`]s per `policy`.
///
/// Non-transient errors are returned at once. After the last attempt the
/// final transient error is returned.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    health: Option<&ProviderHealth>,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if let Some(h) = health {
                    h.record_success();
                }
                return Ok(value);
            }
            Err(e) => {
                if let Some(h) = health {
                    h.record_failure(&e.to_string());
                }
                if !e.is_transient() || attempt >= attempts {
                    return Err(e);
                }
                let backoff = policy.delay_after(attempt, &e);
                warn!(
                    call = label,
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient provider error; retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// How usable the provider currently looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unavailable,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Point-in-time provider health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub level: HealthLevel,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_change: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Failure rate as a fraction (0.0–1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

/// Consecutive-failure tracking for one provider.
///
/// One failure marks the provider degraded, three in a row unavailable;
/// three consecutive successes restore it to healthy.
#[derive(Debug)]
pub struct ProviderHealth {
    inner: Mutex<HealthSnapshot>,
}

impl ProviderHealth {
    pub fn new(provider: &str) -> Self {
        Self {
            inner: Mutex::new(HealthSnapshot {
                provider: provider.to_string(),
                level: HealthLevel::Healthy,
                consecutive_successes: 0,
                consecutive_failures: 0,
                total_calls: 0,
                total_failures: 0,
                last_error: None,
                last_change: Utc::now(),
            }),
        }
    }

    pub fn record_success(&self) {
        let Ok(mut h) = self.inner.lock() else {
            return;
        };
        h.total_calls += 1;
        h.consecutive_successes += 1;
        h.consecutive_failures = 0;

        if h.level != HealthLevel::Healthy && h.consecutive_successes >= 3 {
            h.level = HealthLevel::Healthy;
            h.last_change = Utc::now();
            h.last_error = None;
            info!(provider = %h.provider, "Provider recovered");
        }
    }

    pub fn record_failure(&self, error: &str) {
        let Ok(mut h) = self.inner.lock() else {
            return;
        };
        h.total_calls += 1;
        h.total_failures += 1;
        h.consecutive_failures += 1;
        h.consecutive_successes = 0;
        h.last_error = Some(error.to_string());

        let level = if h.consecutive_failures >= 3 {
            HealthLevel::Unavailable
        } else {
            HealthLevel::Degraded
        };
        if level != h.level {
            h.level = level;
            h.last_change = Utc::now();
            warn!(
                provider = %h.provider,
                level = %level,
                consecutive_failures = h.consecutive_failures,
                error,
                "Provider health changed"
            );
        }
    }

    pub fn level(&self) -> HealthLevel {
        self.inner
            .lock()
            .map(|h| h.level)
            .unwrap_or(HealthLevel::Unavailable)
    }

    pub fn snapshot(&self) -> Option<HealthSnapshot> {
        self.inner.lock().ok().map(|h| h.clone())
    }
}
