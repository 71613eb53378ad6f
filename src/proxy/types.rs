//! OpenAI-compatible request and response types.
//!
//! The proxy only needs `model` and `stream` from a completion request; all
//! other fields ride along untouched in `extra` so the body reaches the
//! backend as the caller sent it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Chat completion request (OpenAI-compatible), as far as routing cares.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    /// Parse the routing fields from a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| Error::BadRequest(format!("invalid JSON request: {}", e)))?;
        if request.model.is_empty() {
            return Err(Error::BadRequest("'model' must not be empty".to_string()));
        }
        Ok(request)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Return `body` with its top-level `model` field replaced by `local_model`.
///
/// Every other field is preserved.
pub fn rewrite_model(body: &[u8], local_model: &str) -> Result<Bytes> {
    let mut value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("invalid JSON request: {}", e)))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::BadRequest("request body must be a JSON object".to_string()))?;
    object.insert(
        "model".to_string(),
        serde_json::Value::String(local_model.to_string()),
    );
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| Error::Internal(format!("failed to encode request: {}", e)))
}

/// Response of `GET /v1/models`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

/// One entry of the model list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}
