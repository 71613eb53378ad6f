//! Router module for backend selection.
//!
//! Chooses one backend per attempt based on:
//! - Model availability
//! - Health (Healthy or Degraded only)
//! - Rate-limit capacity
//! - Load (in-flight requests), then latency, then random

mod selector;

pub use selector::{select_from, Selector};
