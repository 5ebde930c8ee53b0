//! Shared state for the HTTP server.

use std::sync::Arc;

use agentum_core::{AgentumContext, TaskRunner};

/// Application state handed to every handler through axum's `State`
/// extractor. Cloning is cheap: both fields are `Arc`-backed.
#[derive(Clone)]
pub struct SharedState {
    /// The core runtime context (store, filesystem, lifecycle, registries).
    pub ctx: Arc<AgentumContext>,
    /// Facade for launching and cancelling supervised runs.
    pub runner: TaskRunner,
}

impl SharedState {
    pub fn new(ctx: Arc<AgentumContext>) -> Self {
        Self {
            runner: TaskRunner::new(Arc::clone(&ctx)),
            ctx,
        }
    }
}
