//! Per-request routing state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use super::retry::AttemptRecord;
use crate::registry::Backend;

/// State of one inbound request across its routing attempts.
///
/// Owned by the handler invocation; dropped when the response completes or
/// fails terminally.
#[derive(Debug)]
pub struct RequestContext {
    pub id: Uuid,
    pub model: String,
    pub stream: bool,
    /// Backend of the current (or last) attempt.
    pub chosen: Option<Arc<Backend>>,
    /// Attempts that reached a backend.
    pub attempts: u32,
    /// Backends already tried for this request.
    pub excluded: HashSet<String>,
    /// Failed attempts, oldest first.
    pub failures: Vec<AttemptRecord>,
    pub started: Instant,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(model: impl Into<String>, stream: bool, budget: std::time::Duration) -> Self {
        let started = Instant::now();
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            stream,
            chosen: None,
            attempts: 0,
            excluded: HashSet::new(),
            failures: Vec::new(),
            started,
            deadline: started + budget,
        }
    }

    pub fn chosen_id(&self) -> Option<&str> {
        self.chosen.as_deref().map(Backend::id)
    }
}
