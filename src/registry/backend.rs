//! A single upstream backend: static metadata plus atomically updated load and health state.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use super::rate_limit::RateLimiter;
use crate::config::{ApiKey, BackendConfig};

/// Sentinel stored in the latency cell before the first sample.
const NO_LATENCY_SAMPLE: u64 = u64::MAX;

/// Availability of a backend as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Probes succeed; receives traffic.
    Healthy,
    /// Recent probe failures; still receives traffic.
    Degraded,
    /// Failure streak reached the threshold; excluded until a probe succeeds.
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Whether the selector may route requests to a backend in this state.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    fn to_u8(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// An upstream inference server.
///
/// Static fields never change after construction; a reload that alters them
/// builds a new `Backend`. Dynamic fields are plain atomics so the request
/// path never takes a lock.
pub struct Backend {
    config: BackendConfig,
    /// Advertised models: `models` followed by any extra `model_map` keys.
    models: Vec<String>,
    rate_limiter: Option<RateLimiter>,
    health: AtomicU8,
    failure_streak: AtomicU32,
    in_flight: AtomicUsize,
    /// f64 milliseconds stored as bits, `NO_LATENCY_SAMPLE` until the first probe.
    latency_ms: AtomicU64,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.config.id)
            .field("url", &self.config.url)
            .field("health", &self.health())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Backend {
    /// Build a backend in the Healthy state with zeroed counters.
    pub fn new(config: BackendConfig) -> Self {
        let mut models = config.models.clone();
        for public in config.model_map.keys() {
            if !models.contains(public) {
                models.push(public.clone());
            }
        }
        let rate_limiter = config.rate_limit.map(RateLimiter::per_minute);

        Self {
            config,
            models,
            rate_limiter,
            health: AtomicU8::new(HealthStatus::Healthy.to_u8()),
            failure_streak: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(NO_LATENCY_SAMPLE),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        self.config.api_key.as_ref()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Name to send upstream when it differs from the public model name.
    pub fn local_model_name(&self, model: &str) -> Option<&str> {
        self.config
            .model_map
            .get(model)
            .map(String::as_str)
            .filter(|local| *local != model)
    }

    /// Join the backend base URL with an API path.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak.load(Ordering::Acquire)
    }

    /// Publish a new health state. Only the backend's probe task calls this.
    pub(crate) fn store_health(&self, status: HealthStatus, failure_streak: u32) {
        self.failure_streak.store(failure_streak, Ordering::Release);
        self.health.store(status.to_u8(), Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Rolling latency estimate in milliseconds, `None` before the first sample.
    pub fn latency_ms(&self) -> Option<f64> {
        match self.latency_ms.load(Ordering::Acquire) {
            NO_LATENCY_SAMPLE => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Fold a latency sample into the exponential moving average.
    pub(crate) fn record_latency(&self, sample_ms: f64, alpha: f64) {
        let _ = self
            .latency_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if bits == NO_LATENCY_SAMPLE {
                    sample_ms
                } else {
                    let current = f64::from_bits(bits);
                    alpha * sample_ms + (1.0 - alpha) * current
                };
                Some(next.to_bits())
            });
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the rate limiter would currently admit a request.
    pub fn has_capacity(&self) -> bool {
        self.rate_limiter
            .as_ref()
            .map_or(true, |limiter| limiter.available_tokens() >= 1.0)
    }

    /// Take one rate-limit token. Always succeeds for unlimited backends.
    pub fn try_acquire_token(&self) -> bool {
        self.rate_limiter
            .as_ref()
            .map_or(true, |limiter| limiter.try_acquire())
    }

    /// Whole tokens left in the rate limiter, `None` for unlimited backends.
    pub fn available_tokens(&self) -> Option<u32> {
        self.rate_limiter
            .as_ref()
            .map(|limiter| limiter.available_tokens().floor() as u32)
    }

    /// Count a new in-flight request. The count drops when the guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            backend: Arc::clone(self),
        }
    }
}

/// RAII in-flight marker.
///
/// Travels with the response body for streams, so the counter is released on
/// completion, failure, or client disconnect alike.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl InFlightGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
