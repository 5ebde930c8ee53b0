//! Task runner facade.
//!
//! The single entry point for starting a run on a session, shared by the
//! HTTP surface and any CLI driver: resolve configuration, build the
//! permission engine and sandbox launcher, open the hub, start the
//! persistence writer, and hand off to the supervisor.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{Supervisor, SupervisorDeps};
use crate::context::AgentumContext;
use crate::hub::{EventHub, HubError};
use crate::lifecycle::LifecycleError;
use crate::permissions::{PermissionEngine, Profile};
use crate::sandbox::{SandboxLauncher, SecurityConfig};
use crate::session::{ExecutionParams, Session};
use crate::store::StoreError;
use crate::writer;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("too many concurrent sessions")]
    Capacity,

    #[error("a run is already in progress for this session")]
    AlreadyRunning,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fs(#[from] crate::fs_layout::FsError),
}

/// Per-request overrides over the configured agent defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    pub session_id: String,
    pub cancel: CancellationToken,
}

/// Facade over the context for launching supervised runs.
#[derive(Clone)]
pub struct TaskRunner {
    ctx: Arc<AgentumContext>,
}

impl TaskRunner {
    pub fn new(ctx: Arc<AgentumContext>) -> Self {
        Self { ctx }
    }

    /// Start the agent for `session`. Returns once the supervisor task is
    /// launched; progress flows through the session's event stream.
    pub async fn start(
        &self,
        session: &Session,
        task: String,
        resume_id: Option<String>,
        overrides: RunOverrides,
    ) -> Result<RunHandle, RunnerError> {
        let ctx = &self.ctx;
        let config = &ctx.config;

        if ctx.running_count() >= config.runtime.max_concurrent_sessions {
            return Err(RunnerError::Capacity);
        }

        let workspace = ctx.fs.workspace_dir(&session.id)?;
        let params = ExecutionParams {
            session_id: session.id.clone(),
            task,
            model: overrides
                .model
                .or_else(|| session.model.clone())
                .unwrap_or_else(|| config.agent.model.clone()),
            max_turns: overrides.max_turns.unwrap_or(config.agent.max_turns),
            timeout_seconds: overrides
                .timeout_seconds
                .unwrap_or(config.agent.timeout_seconds),
            workspace: workspace.clone(),
            resume_id,
        };

        // Profile and sandbox documents are re-read per run so edits take
        // effect without a restart.
        let profile = match Profile::load(&config.permissions_file()) {
            Ok(profile) => profile,
            Err(e) => {
                // A missing or broken profile denies everything.
                log::warn!("permission profile unavailable ({e}); using deny-all defaults");
                Profile::default()
            }
        };
        let permissions = Arc::new(PermissionEngine::new(&profile, &workspace));

        let security = SecurityConfig::load(&config.security_file()).unwrap_or_else(|e| {
            log::warn!("security config unreadable ({e}); using defaults");
            SecurityConfig::default()
        });
        let sandbox = SandboxLauncher::new(security, config.paths.skills_dir.clone());

        let (hub, persist_rx) = EventHub::open(
            &session.id,
            Arc::clone(&ctx.store),
            config.runtime.subscriber_buffer,
        )
        .await?;

        let cancel = CancellationToken::new();
        if !ctx.register_run(&session.id, Arc::clone(&hub), cancel.clone()) {
            return Err(RunnerError::AlreadyRunning);
        }

        writer::spawn(
            Arc::clone(&ctx.store),
            Arc::clone(&hub),
            persist_rx,
            cancel.clone(),
        );

        let deps = SupervisorDeps {
            store: Arc::clone(&ctx.store),
            fs: ctx.fs.clone(),
            hub,
            permissions,
            sandbox,
            agent_command: config.agent.command.clone(),
            grace_period: Duration::from_secs(config.agent.grace_period_seconds),
            max_line_length: config.agent.max_line_length,
        };

        let supervisor = Supervisor::new(params, deps, cancel.clone());
        let session_id = session.id.clone();
        let ctx_for_cleanup = Arc::clone(ctx);
        tokio::spawn(async move {
            let status = supervisor.run().await;
            log::info!("session {session_id} finished with status {status}");
            ctx_for_cleanup.unregister_run(&session_id);
        });

        Ok(RunHandle {
            session_id: session.id.clone(),
            cancel,
        })
    }

    /// Record cancel intent and signal the live supervisor, if any. The
    /// status flips to `cancelled` once the supervisor reaps its child.
    pub async fn cancel(&self, session_id: &str, user_id: &str) -> Result<bool, RunnerError> {
        self.ctx.lifecycle.cancel(session_id, user_id).await?;
        Ok(self.ctx.signal_cancel(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthService;
    use crate::config::AppConfig;
    use crate::events::EventKind;
    use crate::fs_layout::SessionFs;
    use crate::session::SessionStatus;
    use crate::store::MetadataStore;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: Arc<AgentumContext>,
        runner: TaskRunner,
        user_id: String,
    }

    /// Context wired to a scripted stub agent with sandboxing off.
    async fn harness(agent_script: &str, max_concurrent: usize) -> Harness {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.config_dir = dir.path().join("config");
        config.paths.skills_dir = dir.path().join("skills");
        config.agent.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            agent_script.to_string(),
        ];
        config.agent.grace_period_seconds = 1;
        config.runtime.max_concurrent_sessions = max_concurrent;

        // Sandboxing off for stub agents; permissive profile.
        std::fs::create_dir_all(&config.paths.config_dir).unwrap();
        std::fs::write(config.security_file(), "enabled: false\n").unwrap();
        std::fs::write(
            config.permissions_file(),
            "allow:\n  - \"Bash(*)\"\n  - \"Write(*)\"\n",
        )
        .unwrap();

        let store = Arc::new(MetadataStore::open_in_memory().await.unwrap());
        let user = store.get_or_create_user(None).await.unwrap();
        let auth = Arc::new(AuthService::with_secret(b"secret".to_vec()));
        let fs = SessionFs::new(dir.path().join("sessions"), dir.path().join("skills"));
        let ctx = AgentumContext::builder(config, store, auth).fs(fs).build();

        Harness {
            _dir: dir,
            runner: TaskRunner::new(Arc::clone(&ctx)),
            ctx,
            user_id: user.id,
        }
    }

    const COMPLETE_SCRIPT: &str = concat!(
        r#"echo '{"type":"agent_start","session_id":"conv-1"}'; "#,
        r#"echo '{"type":"agent_complete","status":"complete","num_turns":1,"duration_ms":5}'"#,
    );

    async fn wait_terminal(ctx: &AgentumContext, session_id: &str) -> SessionStatus {
        for _ in 0..100 {
            let session = ctx
                .store
                .get_session_unchecked(session_id)
                .await
                .unwrap()
                .unwrap();
            if session.status.is_terminal() {
                return session.status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session never reached a terminal state");
    }

    #[tokio::test]
    async fn start_runs_agent_to_completion() {
        let h = harness(COMPLETE_SCRIPT, 4).await;
        let session = h
            .ctx
            .lifecycle
            .create(&h.user_id, "say hi", None)
            .await
            .unwrap();

        let handle = h
            .runner
            .start(&session, session.task.clone(), None, RunOverrides::default())
            .await
            .unwrap();
        assert_eq!(handle.session_id, session.id);
        assert!(h.ctx.hub(&session.id).is_some());

        let status = wait_terminal(&h.ctx, &session.id).await;
        assert_eq!(status, SessionStatus::Complete);

        // Registries are cleaned up after the run.
        for _ in 0..100 {
            if h.ctx.hub(&session.id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(h.ctx.hub(&session.id).is_none());
        assert_eq!(h.ctx.running_count(), 0);

        // Persisted stream ends with the agent's terminal event.
        let events = h.ctx.store.list_events(&session.id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().kind(), EventKind::AgentComplete);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_excess_runs() {
        let h = harness(
            r#"echo '{"type":"agent_start","session_id":"c"}'; exec sleep 30"#,
            1,
        )
        .await;
        let first = h.ctx.lifecycle.create(&h.user_id, "one", None).await.unwrap();
        let second = h.ctx.lifecycle.create(&h.user_id, "two", None).await.unwrap();

        h.runner
            .start(&first, "one".to_string(), None, RunOverrides::default())
            .await
            .unwrap();
        let err = h
            .runner
            .start(&second, "two".to_string(), None, RunOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Capacity));

        h.runner.cancel(&first.id, &h.user_id).await.unwrap();
        wait_terminal(&h.ctx, &first.id).await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let h = harness(
            r#"echo '{"type":"agent_start","session_id":"c"}'; exec sleep 30"#,
            4,
        )
        .await;
        let session = h.ctx.lifecycle.create(&h.user_id, "t", None).await.unwrap();

        h.runner
            .start(&session, "t".to_string(), None, RunOverrides::default())
            .await
            .unwrap();
        let err = h
            .runner
            .start(&session, "t".to_string(), None, RunOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyRunning));

        h.runner.cancel(&session.id, &h.user_id).await.unwrap();
        wait_terminal(&h.ctx, &session.id).await;
    }

    #[tokio::test]
    async fn cancel_ends_run_with_cancelled_status() {
        let h = harness(
            r#"echo '{"type":"agent_start","session_id":"conv-2"}'; exec sleep 30"#,
            4,
        )
        .await;
        let session = h.ctx.lifecycle.create(&h.user_id, "t", None).await.unwrap();
        h.runner
            .start(&session, "t".to_string(), None, RunOverrides::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let signalled = h.runner.cancel(&session.id, &h.user_id).await.unwrap();
        assert!(signalled);

        let status = wait_terminal(&h.ctx, &session.id).await;
        assert_eq!(status, SessionStatus::Cancelled);

        let session = h
            .ctx
            .store
            .get_session_unchecked(&session.id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.cancel_requested);
        assert_eq!(session.resume_id.as_deref(), Some("conv-2"));
    }

    #[tokio::test]
    async fn overrides_take_precedence_over_config() {
        let h = harness(COMPLETE_SCRIPT, 4).await;
        let session = h.ctx.lifecycle.create(&h.user_id, "t", None).await.unwrap();

        let overrides = RunOverrides {
            model: Some("override-model".to_string()),
            max_turns: Some(3),
            timeout_seconds: Some(120),
        };
        h.runner
            .start(&session, "t".to_string(), None, overrides)
            .await
            .unwrap();

        wait_terminal(&h.ctx, &session.id).await;
        let fresh = h
            .ctx
            .store
            .get_session_unchecked(&session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.model.as_deref(), Some("override-model"));
    }
}
