//! Retry-with-exclusion failover loop.
//!
//! An explicit bounded loop:
//! - Select a backend excluding every backend already tried for this request
//! - Run the attempt with an in-flight guard held for its whole duration
//! - On a retryable failure (nothing has reached the caller yet) exclude the
//!   backend and go again, up to `max_attempts`
//! - Non-retryable failures and selection failures end the request at once
//! - Once the request deadline has passed no further backend is selected

use std::future::Future;

use super::context::RequestContext;
use crate::error::{Error, Result};
use crate::registry::InFlightGuard;
use crate::router::Selector;

/// Record of a single failed attempt for logging and the attempts header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub backend: String,
    /// Upstream status, `None` for transport failures.
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.backend, self.message)
    }
}

/// How an attempt failed.
#[derive(Debug)]
pub enum AttemptError {
    /// Failed before any byte reached the caller; another backend may be tried.
    Retryable(Error),
    /// Must be reported to the caller as is.
    Fatal(Error),
}

/// Whether an upstream HTTP status should send the request to another backend.
///
/// Server errors, throttling, timeouts, and credential rejections are
/// specific to one backend. Other client errors would fail everywhere.
pub fn is_retryable(status_code: u16) -> bool {
    matches!(status_code, 401 | 403 | 408 | 429 | 500 | 502 | 503 | 504)
}

/// Format attempt records into the `x-infergate-attempts` header value.
///
/// Format: `"gpu-a:503, gpu-b:transport"`, one entry per failed attempt.
/// Returns `None` when no attempt failed.
pub fn format_attempts_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    Some(
        attempts
            .iter()
            .map(|a| match a.status {
                Some(status) => format!("{}:{}", a.backend, status),
                None => format!("{}:transport", a.backend),
            })
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Route a request with failover across backends.
///
/// `send` receives the in-flight guard of the chosen backend. Dropping the
/// guard (on failure, or when a successful response has been fully relayed)
/// releases the in-flight slot, so counters balance on every path.
pub async fn route_with_failover<T, F, Fut>(
    selector: &Selector,
    ctx: &mut RequestContext,
    max_attempts: u32,
    mut send: F,
) -> Result<T>
where
    F: FnMut(InFlightGuard) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    // Unknown models fail before any attempt is made.
    if selector.registry().list(&ctx.model).is_empty() {
        return Err(Error::UnknownModel {
            model: ctx.model.clone(),
        });
    }

    let mut last_error: Option<Error> = None;
    let mut lost_rate_limit_race = false;

    while ctx.attempts < max_attempts {
        if tokio::time::Instant::now() >= ctx.deadline {
            tracing::warn!(
                request_id = %ctx.id,
                attempts = ctx.attempts,
                "Request deadline exceeded, not trying another backend"
            );
            break;
        }

        let backend = match selector.select(&ctx.model, &ctx.excluded) {
            Ok(backend) => backend,
            Err(Error::NoBackendAvailable { model, .. }) => {
                if ctx.failures.is_empty() && lost_rate_limit_race {
                    return Err(Error::RateLimited { model });
                }
                return Err(Error::NoBackendAvailable {
                    model,
                    last_failure: ctx.failures.last().map(ToString::to_string),
                });
            }
            Err(e) => return Err(e),
        };

        if !backend.try_acquire_token() {
            // Another request took the last token between selection and now.
            tracing::debug!(backend = %backend.id(), "rate limit token lost, reselecting");
            lost_rate_limit_race = true;
            ctx.excluded.insert(backend.id().to_string());
            continue;
        }

        ctx.attempts += 1;
        ctx.chosen = Some(backend.clone());
        tracing::debug!(
            request_id = %ctx.id,
            backend = %backend.id(),
            attempt = ctx.attempts,
            in_flight = backend.in_flight(),
            "Selected backend"
        );

        match send(backend.begin_request()).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Retryable(err)) => {
                backend.record_error();
                let status = match &err {
                    Error::UpstreamStatus { status, .. } => Some(*status),
                    _ => None,
                };
                tracing::warn!(
                    request_id = %ctx.id,
                    backend = %backend.id(),
                    attempt = ctx.attempts,
                    max_attempts,
                    error = %err,
                    "Attempt failed, trying another backend"
                );
                ctx.failures.push(AttemptRecord {
                    backend: backend.id().to_string(),
                    status,
                    message: err.to_string(),
                });
                ctx.excluded.insert(backend.id().to_string());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::NoBackendAvailable {
        model: ctx.model.clone(),
        last_failure: None,
    }))
}
