//! Backend registry.
//!
//! The registry publishes an immutable [`Snapshot`] of the backend set.
//! Readers clone the snapshot `Arc` and work from it; `reload` builds a
//! complete new snapshot and swaps the pointer, so no reader ever observes
//! a partially updated set. Backends removed by a reload stay alive for as
//! long as an in-flight request still holds them.

mod backend;
pub mod rate_limit;

pub use backend::{Backend, HealthStatus, InFlightGuard};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{validate_backends, BackendConfig};
use crate::error::{Error, Result};

/// Immutable view of the backend set.
#[derive(Debug, Default)]
pub struct Snapshot {
    backends: Vec<Arc<Backend>>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        let index = backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id().to_string(), i))
            .collect();
        Self { backends, index }
    }

    /// All backends in configuration order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Backends advertising `model`, in configuration order.
    pub fn list(&self, model: &str) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.supports(model))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Backend>> {
        self.index.get(id).map(|&i| &self.backends[i])
    }

    /// Every advertised model id, deduplicated, in first-seen order.
    pub fn models(&self) -> Vec<(&str, &str)> {
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();
        for backend in &self.backends {
            for model in backend.models() {
                if seen.insert(model.as_str()) {
                    models.push((model.as_str(), backend.id()));
                }
            }
        }
        models
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Concurrent holder of the current [`Snapshot`].
///
/// The lock guards only the pointer clone or swap; it is never held across
/// network I/O.
#[derive(Debug)]
pub struct Registry {
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    /// Build a registry from configuration. Ids must be unique.
    pub fn new(configs: Vec<BackendConfig>) -> Result<Self> {
        validate_backends(&configs)?;
        let backends = configs
            .into_iter()
            .map(|c| Arc::new(Backend::new(c)))
            .collect();
        Ok(Self {
            current: RwLock::new(Arc::new(Snapshot::new(backends))),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Backends advertising `model` in the current snapshot.
    pub fn list(&self, model: &str) -> Vec<Arc<Backend>> {
        self.snapshot().list(model)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Backend>> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::BackendNotFound(id.to_string()))
    }

    /// Replace the backend set atomically.
    ///
    /// Backends whose configuration is unchanged keep their existing state
    /// (health, latency, counters). Returns the published snapshot.
    pub fn reload(&self, configs: Vec<BackendConfig>) -> Result<Arc<Snapshot>> {
        validate_backends(&configs)?;

        let previous = self.snapshot();
        let mut kept = 0usize;
        let backends: Vec<Arc<Backend>> = configs
            .into_iter()
            .map(|config| match previous.get(&config.id) {
                Some(existing) if *existing.config() == config => {
                    kept += 1;
                    Arc::clone(existing)
                }
                _ => Arc::new(Backend::new(config)),
            })
            .collect();

        let next = Arc::new(Snapshot::new(backends));
        let removed = previous
            .backends()
            .iter()
            .filter(|b| next.get(b.id()).is_none())
            .count();

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&next);

        tracing::info!(
            backends = next.len(),
            kept,
            removed,
            "Registry reloaded"
        );

        Ok(next)
    }
}
