//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use tokio::time::Instant;
use uuid::Uuid;

use super::context::RequestContext;
use super::retry::{format_attempts_header, is_retryable, route_with_failover, AttemptError};
use super::server::AppState;
use super::stream::relay_stream;
use super::types::{rewrite_model, ChatCompletionRequest, ModelEntry, ModelList};
use crate::error::Error;
use crate::registry::{Backend, HealthStatus, InFlightGuard};

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-infergate-request-id";
/// Response header: id of the backend that served (or last failed) the request.
pub const BACKEND_HEADER: &str = "x-infergate-backend";
/// Response header: failed attempts before the final one, e.g. `"gpu-a:503"`.
pub const ATTEMPTS_HEADER: &str = "x-infergate-attempts";
/// Response header: present with value "true" on streaming responses.
pub const STREAMING_HEADER: &str = "x-infergate-streaming";

/// Inbound headers never forwarded upstream.
///
/// Hop-by-hop headers belong to the caller's connection; credentials and
/// framing headers are set per backend.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "content-length",
    "content-type",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request values every attempt needs.
struct AttemptParams {
    model: String,
    stream: bool,
    deadline: Instant,
    idle_timeout: std::time::Duration,
}

/// Copy the inbound headers that may travel to a backend.
///
/// Headers listed in the inbound `Connection` header are hop-by-hop too.
pub(crate) fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let connection_tokens: Vec<String> = inbound
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut forwarded = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if SKIPPED_HEADERS.contains(&name_str)
            || connection_tokens.iter().any(|t| t == name_str)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Attach infergate metadata headers to a response.
fn attach_headers(response: &mut Response, ctx: &RequestContext) {
    let succeeded = response.status().is_success();
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&ctx.id.to_string()) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    if let Some(value) = ctx.chosen_id().and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(HeaderName::from_static(BACKEND_HEADER), value);
    }

    if let Some(value) =
        format_attempts_header(&ctx.failures).and_then(|v| HeaderValue::from_str(&v).ok())
    {
        headers.insert(HeaderName::from_static(ATTEMPTS_HEADER), value);
    }

    if ctx.stream && succeeded {
        headers.insert(
            HeaderName::from_static(STREAMING_HEADER),
            HeaderValue::from_static("true"),
        );
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match ChatCompletionRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => {
            let mut response = e.into_response();
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            return response;
        }
    };

    let stream = request.is_streaming();
    let budget = if stream {
        state.config.streaming.total_timeout()
    } else {
        state.config.routing.request_timeout()
    };
    let mut ctx = RequestContext::new(request.model, stream, budget);

    tracing::info!(
        request_id = %ctx.id,
        model = %ctx.model,
        stream,
        "Received chat completion request"
    );

    let params = AttemptParams {
        model: ctx.model.clone(),
        stream,
        deadline: ctx.deadline,
        idle_timeout: state.config.streaming.idle_timeout(),
    };
    let forwarded = forwardable_headers(&headers);

    let result = route_with_failover(
        &state.selector,
        &mut ctx,
        state.config.routing.max_attempts,
        |guard| send_attempt(&state, &params, &body, &forwarded, guard),
    )
    .await;

    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(
                request_id = %ctx.id,
                model = %ctx.model,
                attempts = ctx.attempts,
                error = %e,
                "Request failed"
            );
            e.into_response()
        }
    };
    attach_headers(&mut response, &ctx);

    if state.config.logging.log_requests {
        tracing::info!(
            target: "infergate::requests",
            request_id = %ctx.id,
            model = %ctx.model,
            backend = ctx.chosen_id().unwrap_or("-"),
            streaming = ctx.stream,
            attempts = ctx.attempts,
            failed_attempts = ctx.failures.len(),
            latency_ms = ctx.started.elapsed().as_millis() as u64,
            status = response.status().as_u16(),
            "Request completed"
        );
    }

    response
}

/// One attempt against the backend held by `guard`.
///
/// Everything up to the first response byte is retryable; once this returns
/// `Ok`, the response belongs to the caller.
async fn send_attempt(
    state: &AppState,
    params: &AttemptParams,
    body: &Bytes,
    forwarded: &HeaderMap,
    guard: InFlightGuard,
) -> Result<Response, AttemptError> {
    let backend = Arc::clone(guard.backend());

    let payload = match backend.local_model_name(&params.model) {
        Some(local) => rewrite_model(body, local).map_err(AttemptError::Fatal)?,
        None => body.clone(),
    };

    let mut upstream_request = state
        .http_client
        .post(backend.endpoint("chat/completions"))
        .headers(forwarded.clone())
        .header(header::CONTENT_TYPE, "application/json")
        .body(payload);

    if let Some(api_key) = backend.api_key() {
        upstream_request = upstream_request.bearer_auth(api_key.expose_secret());
    }

    let upstream = match tokio::time::timeout_at(params.deadline, upstream_request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(AttemptError::Retryable(transport(&backend, e))),
        Err(_) => {
            return Err(AttemptError::Retryable(transport(
                &backend,
                "request timed out",
            )))
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        let error_body = tokio::time::timeout_at(params.deadline, upstream.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        tracing::warn!(
            status = %status,
            backend = %backend.id(),
            body = %error_body,
            "Backend returned error"
        );
        let err = Error::UpstreamStatus {
            backend: backend.id().to_string(),
            status: status.as_u16(),
            body: error_body,
        };
        return Err(if is_retryable(status.as_u16()) {
            AttemptError::Retryable(err)
        } else {
            AttemptError::Fatal(err)
        });
    }

    if params.stream {
        stream_response(params, &backend, upstream, guard).await
    } else {
        buffered_response(params, &backend, upstream).await
    }
}

fn transport(backend: &Backend, message: impl std::fmt::Display) -> Error {
    Error::BackendTransport {
        backend: backend.id().to_string(),
        message: message.to_string(),
    }
}

/// Read a non-streaming response fully, then hand it to the caller.
///
/// A body that fails to arrive is still retryable since nothing was sent yet.
async fn buffered_response(
    params: &AttemptParams,
    backend: &Backend,
    upstream: reqwest::Response,
) -> Result<Response, AttemptError> {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let bytes = match tokio::time::timeout_at(params.deadline, upstream.bytes()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            return Err(AttemptError::Retryable(transport(
                backend,
                format!("failed to read response body: {}", e),
            )))
        }
        Err(_) => {
            return Err(AttemptError::Retryable(transport(
                backend,
                "timed out reading response body",
            )))
        }
    };

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| AttemptError::Fatal(Error::Internal(e.to_string())))
}

/// Wait for the first chunk of a stream, then commit the response and relay
/// the rest.
async fn stream_response(
    params: &AttemptParams,
    backend: &Backend,
    upstream: reqwest::Response,
    guard: InFlightGuard,
) -> Result<Response, AttemptError> {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));

    let mut chunks = Box::pin(upstream.bytes_stream());
    let first_deadline = (Instant::now() + params.idle_timeout).min(params.deadline);
    let first = match tokio::time::timeout_at(first_deadline, chunks.next()).await {
        Ok(Some(Ok(chunk))) => Some(chunk),
        Ok(None) => None,
        Ok(Some(Err(e))) => {
            return Err(AttemptError::Retryable(transport(
                backend,
                format!("stream failed before first chunk: {}", e),
            )))
        }
        Err(_) => {
            return Err(AttemptError::Retryable(transport(
                backend,
                "no data before stream timeout",
            )))
        }
    };

    let relay = relay_stream(
        backend.id().to_string(),
        first,
        chunks,
        params.idle_timeout,
        params.deadline,
        guard,
    );

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(relay))
        .map_err(|e| AttemptError::Fatal(Error::Internal(e.to_string())))
}

/// Handle GET /v1/models - list available models across all backends
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let data = snapshot
        .models()
        .into_iter()
        .map(|(model, backend)| ModelEntry {
            id: model.to_string(),
            object: "model".to_string(),
            owned_by: backend.to_string(),
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Handle GET /health
///
/// `ok` when every backend is Healthy, `unhealthy` (HTTP 503) when none can
/// take traffic, `degraded` otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let backends = snapshot.backends();

    let serving = backends
        .iter()
        .filter(|b| b.health().accepts_traffic())
        .count();
    let all_healthy = backends
        .iter()
        .all(|b| b.health() == HealthStatus::Healthy);

    let (status_code, status) = if serving == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if all_healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::OK, "degraded")
    };

    let details: Vec<serde_json::Value> = backends
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id(),
                "state": b.health().as_str(),
                "failure_streak": b.failure_streak(),
            })
        })
        .collect();

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "service": "infergate",
            "backends": details,
            "time": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Handle GET /stats - per-backend load and health counters
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let backends: Vec<serde_json::Value> = snapshot
        .backends()
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id(),
                "url": b.url(),
                "key": b.api_key().map(|k| k.masked()),
                "models": b.models(),
                "health": b.health().as_str(),
                "in_flight": b.in_flight(),
                "total_requests": b.total_requests(),
                "total_errors": b.total_errors(),
                "latency_ms": b.latency_ms(),
                "rate_limit": b.config().rate_limit,
                "available_tokens": b.available_tokens(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "backends": backends.len(),
        "stats": backends,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
