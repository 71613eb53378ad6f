//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts
//! requests and forwards them to the selected backends.

mod context;
mod handlers;
pub mod retry;
mod server;
pub mod stream;
pub mod types;

pub use context::RequestContext;
pub use handlers::{ATTEMPTS_HEADER, BACKEND_HEADER, REQUEST_ID_HEADER, STREAMING_HEADER};
pub use server::{build_http_client, create_router, reload_from_file, run_server, AppState};
pub use stream::{error_marker, relay_stream};
pub use types::{ChatCompletionRequest, ModelEntry, ModelList};
