//! Health state machine.
//!
//! ```text
//!            failure (streak < N)            failure (streak >= N)
//! Healthy ----------------------> Degraded ------------------------> Unhealthy
//!    ^                               |  ^                                |
//!    |            success            |  |            success             |
//!    +-------------------------------+  +--------------------------------+
//! ```
//!
//! Failures move a backend down one step at a time until the streak reaches
//! the threshold; each success moves it one step back towards Healthy and
//! clears the streak. Unhealthy backends keep being probed.

use std::time::Duration;

use crate::registry::{Backend, HealthStatus};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// One probe measurement. Consumed immediately by [`apply_sample`].
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub at: chrono::DateTime<chrono::Utc>,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
    /// Why the probe failed, for logging.
    pub detail: Option<String>,
}

impl HealthSample {
    pub fn success(latency: Duration) -> Self {
        Self {
            at: chrono::Utc::now(),
            outcome: ProbeOutcome::Success,
            latency,
            detail: None,
        }
    }

    pub fn failure(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            at: chrono::Utc::now(),
            outcome: ProbeOutcome::Failure,
            latency,
            detail: Some(detail.into()),
        }
    }
}

/// Transition table.
///
/// `failure_streak` is the streak *after* counting this outcome (0 on success).
pub fn next_status(
    current: HealthStatus,
    outcome: ProbeOutcome,
    failure_streak: u32,
    threshold: u32,
) -> HealthStatus {
    match (outcome, current) {
        (ProbeOutcome::Success, HealthStatus::Unhealthy) => HealthStatus::Degraded,
        (ProbeOutcome::Success, _) => HealthStatus::Healthy,
        (ProbeOutcome::Failure, _) if failure_streak >= threshold => HealthStatus::Unhealthy,
        (ProbeOutcome::Failure, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
        (ProbeOutcome::Failure, _) => HealthStatus::Degraded,
    }
}

/// Fold a sample into the backend's health, streak, and latency.
///
/// Returns the new status.
pub fn apply_sample(
    backend: &Backend,
    sample: &HealthSample,
    threshold: u32,
    latency_alpha: f64,
) -> HealthStatus {
    let current = backend.health();
    let streak = match sample.outcome {
        ProbeOutcome::Success => {
            backend.record_latency(sample.latency.as_secs_f64() * 1000.0, latency_alpha);
            0
        }
        ProbeOutcome::Failure => backend.failure_streak().saturating_add(1),
    };

    let next = next_status(current, sample.outcome, streak, threshold);
    backend.store_health(next, streak);

    if next != current {
        match next {
            HealthStatus::Healthy => tracing::info!(
                backend = %backend.id(),
                from = current.as_str(),
                "backend HEALTHY: probe succeeded",
            ),
            HealthStatus::Degraded if current == HealthStatus::Unhealthy => tracing::info!(
                backend = %backend.id(),
                "backend recovering: probe succeeded, now degraded",
            ),
            HealthStatus::Degraded => tracing::warn!(
                backend = %backend.id(),
                failure_streak = streak,
                detail = ?sample.detail,
                "backend DEGRADED: probe failed",
            ),
            HealthStatus::Unhealthy => tracing::warn!(
                backend = %backend.id(),
                failure_streak = streak,
                detail = ?sample.detail,
                "backend UNHEALTHY: {} consecutive probe failures",
                streak,
            ),
        }
    }

    next
}
