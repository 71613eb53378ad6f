//! Background health tracking.
//!
//! One probe task per backend runs on a fixed interval, independent of
//! request traffic. Results are folded into the backend's atomic health
//! fields through the explicit state machine in [`state`].

mod state;

pub use state::{apply_sample, next_status, HealthSample, ProbeOutcome};

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use reqwest::{header, Client};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HealthConfig;
use crate::registry::{Backend, Registry};

/// Probe a backend once.
///
/// Issues `GET {url}{probe_path}` with the backend credential, bounded by
/// the probe timeout. Any 2xx response counts as success.
pub async fn probe(client: &Client, backend: &Backend, config: &HealthConfig) -> HealthSample {
    let mut request = client.get(backend.endpoint(&config.probe_path));
    if let Some(api_key) = backend.api_key() {
        request = request.header(
            header::AUTHORIZATION,
            format!("Bearer {}", api_key.expose_secret()),
        );
    }

    let start = Instant::now();
    let result = tokio::time::timeout(config.timeout(), request.send()).await;
    let latency = start.elapsed();

    match result {
        Ok(Ok(response)) if response.status().is_success() => HealthSample::success(latency),
        Ok(Ok(response)) => {
            HealthSample::failure(latency, format!("probe returned {}", response.status()))
        }
        Ok(Err(e)) => HealthSample::failure(latency, e.to_string()),
        Err(_) => HealthSample::failure(
            latency,
            format!("probe timed out after {}s", config.timeout_secs),
        ),
    }
}

async fn probe_loop(client: Client, backend: Arc<Backend>, config: HealthConfig) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let sample = probe(&client, &backend, &config).await;
        tracing::trace!(
            backend = %backend.id(),
            outcome = ?sample.outcome,
            latency_ms = sample.latency.as_millis() as u64,
            "probe completed"
        );
        apply_sample(
            &backend,
            &sample,
            config.failure_threshold,
            config.latency_alpha,
        );
    }
}

struct ProbeTask {
    backend: Arc<Backend>,
    handle: JoinHandle<()>,
}

/// Owner of the per-backend probe tasks.
pub struct HealthTracker {
    registry: Arc<Registry>,
    client: Client,
    config: HealthConfig,
    tasks: DashMap<String, ProbeTask>,
}

impl HealthTracker {
    pub fn new(registry: Arc<Registry>, client: Client, config: HealthConfig) -> Self {
        Self {
            registry,
            client,
            config,
            tasks: DashMap::new(),
        }
    }

    /// Reconcile probe tasks with the registry's current snapshot.
    ///
    /// Spawns a task for every backend without one and aborts tasks whose
    /// backend was removed or replaced by a reload. Must be called from
    /// within a Tokio runtime.
    pub fn sync(&self) {
        let snapshot = self.registry.snapshot();

        self.tasks.retain(|id, task| {
            let current = snapshot
                .get(id)
                .is_some_and(|b| Arc::ptr_eq(b, &task.backend));
            if !current {
                tracing::debug!(backend = %id, "stopping health probe");
                task.handle.abort();
            }
            current
        });

        for backend in snapshot.backends() {
            if self.tasks.contains_key(backend.id()) {
                continue;
            }
            tracing::debug!(
                backend = %backend.id(),
                interval_secs = self.config.interval_secs,
                "starting health probe"
            );
            let handle = tokio::spawn(probe_loop(
                self.client.clone(),
                Arc::clone(backend),
                self.config.clone(),
            ));
            self.tasks.insert(
                backend.id().to_string(),
                ProbeTask {
                    backend: Arc::clone(backend),
                    handle,
                },
            );
        }
    }

    /// Number of running probe tasks.
    pub fn tracked(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every probe task.
    pub fn shutdown(&self) {
        for task in self.tasks.iter() {
            task.handle.abort();
        }
        self.tasks.clear();
    }
}

impl Drop for HealthTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::registry::HealthStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_config(id: &str, url: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            url: url.to_string(),
            api_key: Some("probe-key".into()),
            models: vec!["llama".to_string()],
            model_map: BTreeMap::new(),
            rate_limit: None,
        }
    }

    fn health_config(threshold: u32) -> HealthConfig {
        HealthConfig {
            interval_secs: 1,
            timeout_secs: 1,
            failure_threshold: threshold,
            ..HealthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_success_sends_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer probe-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = Backend::new(backend_config("a", &format!("{}/v1", server.uri())));
        let sample = probe(&Client::new(), &backend, &health_config(3)).await;
        assert_eq!(sample.outcome, ProbeOutcome::Success);
        assert!(sample.detail.is_none());
    }

    #[tokio::test]
    async fn test_probe_error_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = Backend::new(backend_config("a", &format!("{}/v1", server.uri())));
        let sample = probe(&Client::new(), &backend, &health_config(3)).await;
        assert_eq!(sample.outcome, ProbeOutcome::Failure);
        assert!(sample.detail.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_probe_timeout_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let backend = Backend::new(backend_config("a", &format!("{}/v1", server.uri())));
        let sample = probe(&Client::new(), &backend, &health_config(3)).await;
        assert_eq!(sample.outcome, ProbeOutcome::Failure);
        assert!(sample.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tracker_marks_failing_backend_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = Arc::new(
            Registry::new(vec![backend_config("a", &format!("{}/v1", server.uri()))]).unwrap(),
        );
        let tracker = HealthTracker::new(registry.clone(), Client::new(), health_config(1));
        tracker.sync();
        assert_eq!(tracker.tracked(), 1);

        // First tick fires immediately.
        let backend = registry.get("a").unwrap();
        for _ in 0..50 {
            if backend.health() == HealthStatus::Unhealthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend.health(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_tracker_follows_reload() {
        let registry = Arc::new(
            Registry::new(vec![
                backend_config("a", "http://127.0.0.1:9/v1"),
                backend_config("b", "http://127.0.0.1:9/v1"),
            ])
            .unwrap(),
        );
        let tracker = HealthTracker::new(registry.clone(), Client::new(), health_config(3));
        tracker.sync();
        assert_eq!(tracker.tracked(), 2);

        registry
            .reload(vec![
                backend_config("b", "http://127.0.0.1:9/v1"),
                backend_config("c", "http://127.0.0.1:9/v1"),
                backend_config("d", "http://127.0.0.1:9/v1"),
            ])
            .unwrap();
        tracker.sync();
        assert_eq!(tracker.tracked(), 3);
        assert!(!tracker.tasks.contains_key("a"));

        tracker.shutdown();
        assert_eq!(tracker.tracked(), 0);
    }
}
