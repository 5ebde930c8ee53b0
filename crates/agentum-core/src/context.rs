//! AgentumContext - the single injected runtime context.
//!
//! Holds everything the HTTP surface and the task runner share: the metadata
//! store, the session filesystem, the auth service, and the registries of
//! live hubs and supervisors. There are no global singletons; every consumer
//! receives (a clone of) this context explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::config::AppConfig;
use crate::fs_layout::SessionFs;
use crate::hub::EventHub;
use crate::lifecycle::SessionLifecycle;
use crate::store::MetadataStore;

/// Shared state for one service process.
///
/// All fields sit behind `Arc`, so cloning the context clones pointers, not
/// data. The hub and supervisor registries are guarded by plain mutexes; the
/// critical sections never await.
pub struct AgentumContext {
    pub config: AppConfig,
    pub store: Arc<MetadataStore>,
    pub fs: SessionFs,
    pub lifecycle: SessionLifecycle,
    pub auth: Arc<AuthService>,
    /// Live hubs by session id. Only the task runner inserts; the runner's
    /// completion handler removes.
    hubs: Mutex<HashMap<String, Arc<EventHub>>>,
    /// Cancel tokens for live supervisors, consulted by cancel requests.
    supervisors: Mutex<HashMap<String, CancellationToken>>,
}

/// Builder for [`AgentumContext`].
pub struct AgentumContextBuilder {
    config: AppConfig,
    store: Arc<MetadataStore>,
    auth: Arc<AuthService>,
    fs: Option<SessionFs>,
}

impl AgentumContextBuilder {
    pub fn new(config: AppConfig, store: Arc<MetadataStore>, auth: Arc<AuthService>) -> Self {
        Self {
            config,
            store,
            auth,
            fs: None,
        }
    }

    /// Override the session filesystem (tests point it at a tempdir).
    pub fn fs(mut self, fs: SessionFs) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn build(self) -> Arc<AgentumContext> {
        let fs = self.fs.unwrap_or_else(|| {
            SessionFs::new(
                self.config.paths.sessions_root.clone(),
                self.config.paths.skills_dir.clone(),
            )
        });
        Arc::new(AgentumContext {
            lifecycle: SessionLifecycle::new(Arc::clone(&self.store), fs.clone()),
            config: self.config,
            store: self.store,
            fs,
            auth: self.auth,
            hubs: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
        })
    }
}

impl AgentumContext {
    pub fn builder(
        config: AppConfig,
        store: Arc<MetadataStore>,
        auth: Arc<AuthService>,
    ) -> AgentumContextBuilder {
        AgentumContextBuilder::new(config, store, auth)
    }

    /// The live hub for a session, if a run is in progress.
    pub fn hub(&self, session_id: &str) -> Option<Arc<EventHub>> {
        self.hubs.lock().ok()?.get(session_id).cloned()
    }

    /// Register the hub for a starting run. Returns false when one already
    /// exists (only one supervisor may run per session).
    pub fn register_run(
        &self,
        session_id: &str,
        hub: Arc<EventHub>,
        cancel: CancellationToken,
    ) -> bool {
        let Ok(mut hubs) = self.hubs.lock() else {
            return false;
        };
        if hubs.contains_key(session_id) {
            return false;
        }
        hubs.insert(session_id.to_string(), hub);
        drop(hubs);
        if let Ok(mut supervisors) = self.supervisors.lock() {
            supervisors.insert(session_id.to_string(), cancel);
        }
        true
    }

    /// Drop the registries' entries once a run finished.
    pub fn unregister_run(&self, session_id: &str) {
        if let Ok(mut hubs) = self.hubs.lock() {
            hubs.remove(session_id);
        }
        if let Ok(mut supervisors) = self.supervisors.lock() {
            supervisors.remove(session_id);
        }
    }

    /// Forward a cancel intent to the live supervisor. Returns whether one
    /// was running. Idempotent.
    pub fn signal_cancel(&self, session_id: &str) -> bool {
        match self.supervisors.lock() {
            Ok(supervisors) => match supervisors.get(session_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Number of runs currently in flight.
    pub fn running_count(&self) -> usize {
        self.supervisors.lock().map(|s| s.len()).unwrap_or(0)
    }
}
