//! Backend selection logic.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::registry::{Backend, Registry};

/// Load-aware backend selector.
#[derive(Debug, Clone)]
pub struct Selector {
    registry: Arc<Registry>,
}

impl Selector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Select a backend for `model`, skipping ids in `exclude`.
    ///
    /// Candidates must advertise the model, be Healthy or Degraded, and have
    /// rate-limit capacity. Among them the fewest in-flight requests wins,
    /// then the lowest rolling latency, then a uniform random pick.
    pub fn select(&self, model: &str, exclude: &HashSet<String>) -> Result<Arc<Backend>> {
        let advertised = self.registry.list(model);
        if advertised.is_empty() {
            return Err(Error::UnknownModel {
                model: model.to_string(),
            });
        }
        select_from(&advertised, model, exclude, &mut rand::thread_rng())
    }
}

/// Selection policy over an explicit candidate list.
pub fn select_from<R: Rng + ?Sized>(
    advertised: &[Arc<Backend>],
    model: &str,
    exclude: &HashSet<String>,
    rng: &mut R,
) -> Result<Arc<Backend>> {
    let eligible: Vec<&Arc<Backend>> = advertised
        .iter()
        .filter(|b| b.health().accepts_traffic() && !exclude.contains(b.id()))
        .collect();

    if eligible.is_empty() {
        return Err(Error::NoBackendAvailable {
            model: model.to_string(),
            last_failure: None,
        });
    }

    let with_capacity: Vec<&Arc<Backend>> =
        eligible.into_iter().filter(|b| b.has_capacity()).collect();

    if with_capacity.is_empty() {
        return Err(Error::RateLimited {
            model: model.to_string(),
        });
    }

    let min_in_flight = with_capacity
        .iter()
        .map(|b| b.in_flight())
        .min()
        .unwrap_or_default();
    let least_loaded: Vec<&Arc<Backend>> = with_capacity
        .into_iter()
        .filter(|b| b.in_flight() == min_in_flight)
        .collect();

    // Backends without a latency sample yet compare as fastest.
    let latency = |b: &Arc<Backend>| b.latency_ms().unwrap_or(0.0);
    let min_latency = least_loaded
        .iter()
        .map(|b| latency(b))
        .fold(f64::INFINITY, f64::min);
    let fastest: Vec<&Arc<Backend>> = least_loaded
        .into_iter()
        .filter(|b| latency(b) <= min_latency)
        .collect();

    fastest
        .choose(rng)
        .map(|b| Arc::clone(b))
        .ok_or_else(|| Error::Internal("selection produced no candidate".to_string()))
}
