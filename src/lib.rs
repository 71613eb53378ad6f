//! infergate - Load-balancing proxy for OpenAI-compatible inference backends
//!
//! This library provides the core functionality for the infergate proxy:
//! configuration, the backend registry, health tracking, backend selection,
//! and the streaming HTTP proxy itself.

pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
