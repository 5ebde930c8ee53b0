//! Per-session agent execution supervisor.
//!
//! Owns the sandboxed child process for one run: spawns it, adapts its
//! structured stdout stream into hub events, enforces the wall-clock timeout,
//! reaps it on cancel, and guarantees the session always reaches a terminal
//! state with a terminal event on the stream.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBody, TokenUsage, LINE_OVERFLOW_ERROR};
use crate::fs_layout::{FsError, SessionFs};
use crate::hub::EventHub;
use crate::permissions::PermissionEngine;
use crate::sandbox::{SandboxError, SandboxLauncher};
use crate::session::{ExecutionParams, SessionStatus};
use crate::store::{MetadataStore, SessionUpdate, StoreError};

/// Environment variable carrying the execution parameters into the child.
pub const AGENT_PARAMS_ENV: &str = "AGENTUM_AGENT_PARAMS";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Shared collaborators handed to a supervisor.
pub struct SupervisorDeps {
    pub store: Arc<MetadataStore>,
    pub fs: SessionFs,
    pub hub: Arc<EventHub>,
    pub permissions: Arc<PermissionEngine>,
    pub sandbox: SandboxLauncher,
    pub agent_command: Vec<String>,
    pub grace_period: Duration,
    pub max_line_length: usize,
}

/// Parameters serialized into [`AGENT_PARAMS_ENV`] for the child.
#[derive(Serialize)]
struct ChildParams<'a> {
    session_id: &'a str,
    task: &'a str,
    model: &'a str,
    max_turns: u32,
    timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_id: Option<&'a str>,
}

/// Metrics captured from the child's `agent_complete` record.
#[derive(Default)]
struct RunMetrics {
    num_turns: u32,
    duration_ms: u64,
    total_cost_usd: Option<f64>,
    status: Option<String>,
    model: Option<String>,
    usage: Option<TokenUsage>,
}

/// How the run ended, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Cancelled,
    TimedOut,
    Interrupted,
    Completed,
    Crashed,
}

/// Supervises exactly one agent child process.
pub struct Supervisor {
    params: ExecutionParams,
    deps: SupervisorDeps,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(params: ExecutionParams, deps: SupervisorDeps, cancel: CancellationToken) -> Self {
        Self {
            params,
            deps,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the agent to completion. Always emits a terminal event and leaves
    /// the session row in a terminal state.
    pub async fn run(self) -> SessionStatus {
        let session_id = self.params.session_id.clone();
        let store = Arc::clone(&self.deps.store);
        let hub = Arc::clone(&self.deps.hub);
        match self.run_inner().await {
            Ok(status) => status,
            Err(e) => {
                log::error!("supervisor for session {session_id} failed: {e}");
                hub.publish(EventBody::Error {
                    message: e.to_string(),
                    error_type: "internal".to_string(),
                })
                .await;
                let update = SessionUpdate {
                    status: Some(SessionStatus::Failed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(update_err) = store.update_session(&session_id, update).await {
                    log::error!("failed to mark session {session_id} failed: {update_err}");
                }
                SessionStatus::Failed
            }
        }
    }

    async fn run_inner(self) -> Result<SessionStatus, SupervisorError> {
        let Supervisor {
            params,
            deps,
            cancel,
        } = self;
        let session_id = params.session_id.clone();
        let started = Instant::now();

        deps.store
            .update_session(
                &session_id,
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    model: Some(params.model.clone()),
                    ..Default::default()
                },
            )
            .await?;

        deps.fs.install_skills_symlink(&session_id)?;

        // Announce the run on the stream before the child produces anything.
        deps.hub
            .publish(EventBody::UserMessage {
                text: params.task.clone(),
            })
            .await;
        let (allow_rules, deny_rules) = deps.permissions.rule_counts();
        deps.hub
            .publish(EventBody::ProfileSwitch {
                profile_name: deps.permissions.profile_name().to_string(),
                tools: deps.permissions.enabled_tools(),
                allow_rules,
                deny_rules,
            })
            .await;

        let mut child = match Self::spawn_child(&params, &deps).await {
            Ok(child) => child,
            Err(SupervisorError::Sandbox(e)) => {
                // Fail-closed: no unsandboxed fallback.
                log::error!("session {session_id}: {e}");
                return Self::finish(
                    &deps,
                    &session_id,
                    SessionStatus::Failed,
                    Some(EventBody::Error {
                        message: e.to_string(),
                        error_type: "sandbox_unavailable".to_string(),
                    }),
                    RunMetrics::default(),
                    started,
                )
                .await;
            }
            Err(e) => {
                log::error!("session {session_id}: spawn failed: {e}");
                return Self::finish(
                    &deps,
                    &session_id,
                    SessionStatus::Failed,
                    Some(EventBody::Error {
                        message: e.to_string(),
                        error_type: "spawn_failed".to_string(),
                    }),
                    RunMetrics::default(),
                    started,
                )
                .await;
            }
        };

        let stdout = child.stdout.take();
        let mut frames = stdout.map(|out| {
            FramedRead::new(out, LinesCodec::new_with_max_length(deps.max_line_length))
        });

        // Mirror stderr into the service log.
        if let Some(stderr) = child.stderr.take() {
            let sid = session_id.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    log::debug!("[{sid} stderr] {line}");
                }
            });
        }

        let mut raw_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(deps.fs.log_file(&session_id)?)
            .await
            .ok();

        let deadline = started + Duration::from_secs(params.timeout_seconds);
        let far_future = || Instant::now() + Duration::from_secs(86_400);
        let mut kill_at = far_future();

        let mut seen_resume_id = false;
        let mut resumable = params.resume_id.is_some();
        let mut metrics = RunMetrics::default();
        let mut completed = false;
        let mut child_errored = false;
        let mut cancelled = false;
        let mut timed_out = false;
        let mut interrupted = false;
        let mut signalled = false;

        loop {
            let frame = async {
                match frames.as_mut() {
                    Some(frames) => frames.next().await,
                    None => None,
                }
            };
            tokio::select! {
                maybe_line = frame => match maybe_line {
                    Some(Ok(line)) => {
                        if let Some(log_file) = raw_log.as_mut() {
                            let _ = log_file.write_all(line.as_bytes()).await;
                            let _ = log_file.write_all(b"\n").await;
                        }
                        let Some(record) = crate::agent::AgentRecord::parse_line(&line) else {
                            continue;
                        };

                        if !seen_resume_id {
                            if let Some(resume_id) = record.resume_id() {
                                seen_resume_id = true;
                                resumable = true;
                                if let Err(e) =
                                    deps.store.set_resume_id(&session_id, resume_id).await
                                {
                                    log::warn!(
                                        "failed to persist resume_id for {session_id}: {e}"
                                    );
                                }
                            }
                        }

                        if let Some(tool_call) = record.tool_call_fingerprint() {
                            let decision = deps.permissions.evaluate(&tool_call);
                            if !decision.allowed {
                                deps.hub
                                    .publish(EventBody::HookTriggered {
                                        hook_type: "pre_tool_use".to_string(),
                                        tool_call: tool_call.clone(),
                                        decision: "deny".to_string(),
                                    })
                                    .await;
                                if decision.interrupt && !signalled {
                                    log::warn!(
                                        "session {session_id}: repeated denial of {tool_call}, interrupting"
                                    );
                                    interrupted = true;
                                    signalled = true;
                                    Self::signal_term(&child);
                                    kill_at = Instant::now() + deps.grace_period;
                                }
                            } else if deps.permissions.needs_confirmation(&tool_call) {
                                deps.hub
                                    .publish(EventBody::HookTriggered {
                                        hook_type: "pre_tool_use".to_string(),
                                        tool_call,
                                        decision: "confirm".to_string(),
                                    })
                                    .await;
                            }
                        }

                        match &record {
                            crate::agent::AgentRecord::AgentComplete {
                                status,
                                num_turns,
                                duration_ms,
                                total_cost_usd,
                                usage,
                                model,
                            } => {
                                completed = true;
                                metrics = RunMetrics {
                                    num_turns: *num_turns,
                                    duration_ms: *duration_ms,
                                    total_cost_usd: *total_cost_usd,
                                    status: Some(status.clone()),
                                    model: model.clone(),
                                    usage: usage.clone(),
                                };
                            }
                            crate::agent::AgentRecord::MetricsUpdate { turns, .. } => {
                                metrics.num_turns = metrics.num_turns.max(*turns);
                            }
                            crate::agent::AgentRecord::Error { error_type, .. }
                                if error_type != LINE_OVERFLOW_ERROR =>
                            {
                                child_errored = true;
                            }
                            _ => {}
                        }

                        // A terminal record from the child closes the hub; the
                        // reaper below finishes the session row.
                        deps.hub.publish(record.into_event_body()).await;
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        log::warn!(
                            "session {session_id}: stdout line exceeded {} bytes, truncated",
                            deps.max_line_length
                        );
                        // Subscribers and the persisted history must see the
                        // truncation; this error_type does not close the
                        // stream.
                        deps.hub
                            .publish(EventBody::Error {
                                message: format!(
                                    "agent stdout line exceeded {} bytes and was dropped",
                                    deps.max_line_length
                                ),
                                error_type: LINE_OVERFLOW_ERROR.to_string(),
                            })
                            .await;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        log::warn!("session {session_id}: stdout read error: {e}");
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !signalled => {
                    cancelled = true;
                    signalled = true;
                    Self::signal_term(&child);
                    kill_at = Instant::now() + deps.grace_period;
                }
                _ = tokio::time::sleep_until(deadline), if !signalled => {
                    timed_out = true;
                    signalled = true;
                    Self::signal_term(&child);
                    kill_at = Instant::now() + deps.grace_period;
                }
                _ = tokio::time::sleep_until(kill_at) => {
                    log::warn!("session {session_id}: grace period expired, killing child");
                    let _ = child.start_kill();
                    kill_at = far_future();
                }
            }
        }

        // Stdout closed; reap the child, forcing the issue if it lingers.
        let exit_status = match tokio::time::timeout(deps.grace_period, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                log::warn!("session {session_id}: wait failed: {e}");
                None
            }
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        // Cancellation may have landed while we were draining stdout.
        if cancel.is_cancelled() && !completed {
            cancelled = true;
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if timed_out {
            RunOutcome::TimedOut
        } else if interrupted {
            RunOutcome::Interrupted
        } else if completed {
            RunOutcome::Completed
        } else {
            RunOutcome::Crashed
        };

        let exit_code = exit_status.and_then(|s| s.code());
        let (status, terminal) = match outcome {
            RunOutcome::Cancelled => (
                SessionStatus::Cancelled,
                Some(EventBody::Cancelled {
                    message: "task was cancelled".to_string(),
                    resumable,
                }),
            ),
            RunOutcome::TimedOut => (
                SessionStatus::Failed,
                Some(EventBody::Error {
                    message: format!(
                        "agent exceeded wall-clock timeout of {}s",
                        params.timeout_seconds
                    ),
                    error_type: "timeout".to_string(),
                }),
            ),
            RunOutcome::Interrupted => (
                SessionStatus::Failed,
                Some(EventBody::Error {
                    message: "run aborted after repeated permission denials".to_string(),
                    error_type: "permission_interrupt".to_string(),
                }),
            ),
            RunOutcome::Completed => {
                let agent_status = metrics.status.as_deref().unwrap_or("complete");
                let status = if agent_status.eq_ignore_ascii_case("complete")
                    || agent_status.eq_ignore_ascii_case("completed")
                {
                    SessionStatus::Complete
                } else {
                    SessionStatus::Failed
                };
                // The child's agent_complete already closed the stream.
                (status, None)
            }
            RunOutcome::Crashed => {
                // A child-reported error record already closed the stream;
                // only a silent crash needs a synthesized terminal event.
                let terminal = if child_errored {
                    None
                } else {
                    Some(EventBody::Error {
                        message: match exit_code {
                            Some(code) => {
                                format!("agent exited with code {code} before completing")
                            }
                            None => "agent terminated by signal before completing".to_string(),
                        },
                        error_type: "child_crash".to_string(),
                    })
                };
                (SessionStatus::Failed, terminal)
            }
        };

        Self::finish(&deps, &session_id, status, terminal, metrics, started).await
    }

    async fn spawn_child(
        params: &ExecutionParams,
        deps: &SupervisorDeps,
    ) -> Result<Child, SupervisorError> {
        let child_params = ChildParams {
            session_id: &params.session_id,
            task: &params.task,
            model: &params.model,
            max_turns: params.max_turns,
            timeout_seconds: params.timeout_seconds,
            resume_id: params.resume_id.as_deref(),
        };
        let params_json = serde_json::to_string(&child_params)
            .map_err(|e| SupervisorError::Spawn(std::io::Error::other(e)))?;

        let session_dir = deps.fs.session_dir(&params.session_id)?;
        let env = [(AGENT_PARAMS_ENV.to_string(), params_json.clone())];
        let argv = deps.sandbox.wrap(&session_dir, &deps.agent_command, &env)?;

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::Spawn(std::io::Error::other("empty agent command")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !deps.sandbox.config().enabled {
            // Unsandboxed development mode: the parent supplies what bwrap
            // would have set up.
            cmd.current_dir(&params.workspace)
                .env(AGENT_PARAMS_ENV, params_json);
        }

        Ok(cmd.spawn()?)
    }

    /// Emit the terminal event (when the child did not), update the session
    /// row, and tidy the workspace. Never leaves the session non-terminal.
    async fn finish(
        deps: &SupervisorDeps,
        session_id: &str,
        status: SessionStatus,
        terminal: Option<EventBody>,
        metrics: RunMetrics,
        started: Instant,
    ) -> Result<SessionStatus, SupervisorError> {
        if let Some(body) = terminal {
            deps.hub.publish(body).await;
        }

        let duration_ms = if metrics.duration_ms > 0 {
            metrics.duration_ms
        } else {
            started.elapsed().as_millis() as u64
        };

        let session = deps
            .store
            .update_session(
                session_id,
                SessionUpdate {
                    status: Some(status),
                    model: metrics.model,
                    add_num_turns: Some(metrics.num_turns),
                    add_duration_ms: Some(duration_ms),
                    add_cost_usd: metrics.total_cost_usd,
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if let Err(e) = deps.fs.remove_skills_symlink(session_id) {
            log::warn!("failed to remove skills symlink for {session_id}: {e}");
        }

        // Token usage accumulates across resumed runs: carry the prior
        // mirror's counters forward before adding this run's usage.
        let mut info = crate::session::SessionInfo::from_session(&session);
        match deps.fs.read_info(session_id) {
            Ok(Some(prior)) => info.cumulative_usage = prior.cumulative_usage,
            Ok(None) => {}
            Err(e) => {
                log::warn!("failed to read prior session_info.json for {session_id}: {e}")
            }
        }
        if let Some(usage) = metrics.usage {
            info.cumulative_usage.add(&usage);
        }
        if let Err(e) = deps.fs.write_info(session_id, &info) {
            log::warn!("failed to write session_info.json for {session_id}: {e}");
        }

        Ok(status)
    }

    fn signal_term(child: &Child) {
        if let Some(pid) = child.id() {
            // Graceful stop first; the kill deadline enforces SIGKILL later.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
}
