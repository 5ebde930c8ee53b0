//! Session lifecycle management: two-phase creation, resumption, cancel
//! intent, status transitions, and startup reconciliation.
//!
//! A session exists in the metadata store iff its directory exists on disk.
//! Creation is two-phase: the directory is built first, the row second, and
//! a row failure rolls the directory back so neither survives alone.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::fs_layout::{generate_session_id, FsError, SessionFs};
use crate::session::{Session, SessionInfo, SessionStatus};
use crate::store::{MetadataStore, SessionUpdate, StoreError};

/// Prefix injected ahead of the task text when continuing a cancelled run.
const RESUME_CONTEXT: &str = "The previous run of this session was cancelled before it \
finished. Inspect the workspace for partial results and any in-progress todo list, then \
continue from where it stopped.";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session not found")]
    NotFound,

    #[error("illegal status transition from {from} to {to}")]
    Transition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session is not resumable: {0}")]
    NotResumable(String),

    #[error("session creation failed: {0}")]
    Create(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Everything the runner needs to continue an existing session.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub session: Session,
    /// Task text, with the resume-context block prepended when the prior run
    /// was cancelled.
    pub task: String,
    pub resume_id: Option<String>,
}

/// Create/resume/cancel/list over the dual stores.
#[derive(Clone)]
pub struct SessionLifecycle {
    store: Arc<MetadataStore>,
    fs: SessionFs,
}

impl SessionLifecycle {
    pub fn new(store: Arc<MetadataStore>, fs: SessionFs) -> Self {
        Self { store, fs }
    }

    pub fn fs(&self) -> &SessionFs {
        &self.fs
    }

    /// Two-phase session creation. On any store failure the directory is
    /// rolled back so the row-iff-directory invariant holds.
    pub async fn create(
        &self,
        user_id: &str,
        task: &str,
        model: Option<&str>,
    ) -> Result<Session, LifecycleError> {
        if task.trim().is_empty() {
            return Err(LifecycleError::Validation("task must not be empty".to_string()));
        }

        let id = generate_session_id();
        self.create_with_id(&id, user_id, task, model).await
    }

    pub(crate) async fn create_with_id(
        &self,
        id: &str,
        user_id: &str,
        task: &str,
        model: Option<&str>,
    ) -> Result<Session, LifecycleError> {
        // Refuse to adopt an existing directory: rollback below must only
        // ever delete state this call created.
        if self.fs.session_dir(id)?.exists() {
            return Err(LifecycleError::Create(format!("session {id} already exists")));
        }
        self.fs.create(id)?;
        let working_dir = self.fs.workspace_dir(id)?.display().to_string();

        let session = match self
            .store
            .create_session(id, user_id, task, model, &working_dir)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                if let Err(cleanup) = self.fs.destroy(id) {
                    log::warn!("failed to roll back session directory {id}: {cleanup}");
                }
                return Err(LifecycleError::Create(e.to_string()));
            }
        };

        if let Err(e) = self.fs.write_info(id, &SessionInfo::from_session(&session)) {
            log::warn!("failed to write session_info.json for {id}: {e}");
        }

        log::info!("created session {id} for user {user_id}");
        Ok(session)
    }

    /// Prepare an existing session for another run. The session must exist,
    /// be owned by `user_id`, and not be currently running.
    pub async fn resume(
        &self,
        session_id: &str,
        user_id: &str,
        new_task: &str,
    ) -> Result<ResumePlan, LifecycleError> {
        let session = self
            .store
            .get_session(session_id, user_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if session.status == SessionStatus::Running {
            return Err(LifecycleError::NotResumable(
                "a run is already in progress".to_string(),
            ));
        }

        let task = if new_task.trim().is_empty() {
            session.task.clone()
        } else {
            new_task.to_string()
        };
        if task.trim().is_empty() {
            return Err(LifecycleError::Validation("task must not be empty".to_string()));
        }

        let task = if session.status == SessionStatus::Cancelled {
            format!("{RESUME_CONTEXT}\n\n{task}")
        } else {
            task
        };

        // Re-arm the row for the new run: the supervisor moves it to
        // `running`, and a stale cancel intent must not kill the fresh run.
        self.store
            .update_session(
                session_id,
                SessionUpdate {
                    cancel_requested: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        Ok(ResumePlan {
            resume_id: session.resume_id.clone(),
            task,
            session,
        })
    }

    /// Record cancel intent. Returns the session so the caller can signal a
    /// live supervisor. Idempotent for running sessions; a 409-style error
    /// for sessions already in a terminal state.
    pub async fn cancel(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Session, LifecycleError> {
        let session = self
            .store
            .get_session(session_id, user_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if session.status.is_terminal() {
            return Err(LifecycleError::Transition {
                from: session.status,
                to: SessionStatus::Cancelled,
            });
        }

        self.store.set_cancel_requested(session_id).await?;
        log::info!("cancel requested for session {session_id}");
        Ok(session)
    }

    /// Validated status transition, stamping `completed_at` on terminal
    /// states.
    pub async fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
    ) -> Result<Session, LifecycleError> {
        let session = self
            .store
            .get_session_unchecked(session_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if !session.status.can_transition_to(to) {
            return Err(LifecycleError::Transition {
                from: session.status,
                to,
            });
        }

        let update = SessionUpdate {
            status: Some(to),
            completed_at: to.is_terminal().then(Utc::now),
            ..Default::default()
        };
        Ok(self.store.update_session(session_id, update).await?)
    }

    /// Startup reconciliation: no supervisor survives a restart, so every
    /// `running` row is moved to the status its persisted events imply, or
    /// `failed` when the stream never reached a terminal event.
    pub async fn cleanup_stale_sessions(&self) -> Result<u32, LifecycleError> {
        let stale = self
            .store
            .sessions_with_status(SessionStatus::Running)
            .await?;
        let mut cleaned = 0;
        for session in stale {
            let status = self
                .store
                .latest_terminal_status(&session.id)
                .await
                .unwrap_or(None)
                .unwrap_or(SessionStatus::Failed);
            let update = SessionUpdate {
                status: Some(status),
                completed_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(e) = self.store.update_session(&session.id, update).await {
                log::error!("failed to reconcile stale session {}: {e}", session.id);
                continue;
            }
            log::warn!(
                "reconciled stale session {}: running -> {status}",
                session.id
            );
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBody, EventRecord};
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MetadataStore>,
        lifecycle: SessionLifecycle,
        user_id: String,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let fs = SessionFs::new(dir.path().join("sessions"), dir.path().join("skills"));
        let store = Arc::new(MetadataStore::open_in_memory().await.unwrap());
        let user = store.get_or_create_user(None).await.unwrap();
        Harness {
            _dir: dir,
            lifecycle: SessionLifecycle::new(Arc::clone(&store), fs),
            store,
            user_id: user.id,
        }
    }

    mod create {
        use super::*;

        #[tokio::test]
        async fn builds_row_and_directory_together() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "do things", None).await.unwrap();

            assert_eq!(session.status, SessionStatus::Pending);
            let dir = h.lifecycle.fs().session_dir(&session.id).unwrap();
            assert!(dir.is_dir());
            assert!(dir.join("workspace").is_dir());
            assert!(dir.join("session_info.json").is_file());
            assert!(session.working_dir.ends_with("workspace"));
        }

        #[tokio::test]
        async fn store_failure_rolls_back_directory() {
            let h = harness().await;
            // Unknown user violates the foreign key, failing phase two.
            let err = h
                .lifecycle
                .create("no-such-user", "task", None)
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::Create(_)));

            // Neither row nor directory survives.
            let sessions = std::fs::read_dir(h.lifecycle.fs().sessions_root())
                .map(|rd| rd.count())
                .unwrap_or(0);
            assert_eq!(sessions, 0);
        }

        #[tokio::test]
        async fn duplicate_id_leaves_existing_session_untouched() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();

            let err = h
                .lifecycle
                .create_with_id(&session.id, &h.user_id, "task", None)
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::Create(_)));

            // The failed attempt must not have rolled back the existing
            // session's directory or row.
            assert!(h.lifecycle.fs().session_dir(&session.id).unwrap().is_dir());
            assert!(h
                .store
                .get_session_unchecked(&session.id)
                .await
                .unwrap()
                .is_some());
        }

        #[tokio::test]
        async fn empty_task_is_rejected() {
            let h = harness().await;
            let err = h.lifecycle.create(&h.user_id, "   ", None).await.unwrap_err();
            assert!(matches!(err, LifecycleError::Validation(_)));
        }
    }

    mod resume {
        use super::*;

        #[tokio::test]
        async fn running_session_is_not_resumable() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            let err = h
                .lifecycle
                .resume(&session.id, &h.user_id, "more")
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::NotResumable(_)));
        }

        #[tokio::test]
        async fn cancelled_session_gets_resume_context() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Cancelled),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            h.store.set_resume_id(&session.id, "conv-7").await.unwrap();

            let plan = h
                .lifecycle
                .resume(&session.id, &h.user_id, "continue please")
                .await
                .unwrap();
            assert!(plan.task.starts_with(RESUME_CONTEXT));
            assert!(plan.task.ends_with("continue please"));
            assert_eq!(plan.resume_id.as_deref(), Some("conv-7"));
        }

        #[tokio::test]
        async fn completed_session_resumes_without_context_block() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            for status in [SessionStatus::Running, SessionStatus::Complete] {
                h.store
                    .update_session(
                        &session.id,
                        SessionUpdate {
                            status: Some(status),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }

            let plan = h
                .lifecycle
                .resume(&session.id, &h.user_id, "follow-up")
                .await
                .unwrap();
            assert_eq!(plan.task, "follow-up");
        }

        #[tokio::test]
        async fn resume_clears_stale_cancel_intent() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store.set_cancel_requested(&session.id).await.unwrap();

            h.lifecycle
                .resume(&session.id, &h.user_id, "again")
                .await
                .unwrap();
            let fresh = h.store.get_session_unchecked(&session.id).await.unwrap().unwrap();
            assert!(!fresh.cancel_requested);
        }

        #[tokio::test]
        async fn cross_user_resume_is_not_found() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            let other = h.store.get_or_create_user(None).await.unwrap();
            let err = h
                .lifecycle
                .resume(&session.id, &other.id, "steal")
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::NotFound));
        }
    }

    mod cancel {
        use super::*;

        #[tokio::test]
        async fn sets_cancel_flag_on_running_session() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            h.lifecycle.cancel(&session.id, &h.user_id).await.unwrap();
            let fresh = h.store.get_session_unchecked(&session.id).await.unwrap().unwrap();
            assert!(fresh.cancel_requested);

            // Idempotent while still running.
            h.lifecycle.cancel(&session.id, &h.user_id).await.unwrap();
        }

        #[tokio::test]
        async fn cancel_after_terminal_is_a_transition_error() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            for status in [SessionStatus::Running, SessionStatus::Complete] {
                h.store
                    .update_session(
                        &session.id,
                        SessionUpdate {
                            status: Some(status),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }

            let err = h.lifecycle.cancel(&session.id, &h.user_id).await.unwrap_err();
            assert!(matches!(err, LifecycleError::Transition { .. }));
        }
    }

    mod transitions {
        use super::*;

        #[tokio::test]
        async fn legal_transition_stamps_completed_at() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.lifecycle
                .transition(&session.id, SessionStatus::Running)
                .await
                .unwrap();
            let done = h
                .lifecycle
                .transition(&session.id, SessionStatus::Complete)
                .await
                .unwrap();
            assert_eq!(done.status, SessionStatus::Complete);
            assert!(done.completed_at.is_some());
        }

        #[tokio::test]
        async fn illegal_transition_is_rejected() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            let err = h
                .lifecycle
                .transition(&session.id, SessionStatus::Pending)
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::Transition { .. }));
        }
    }

    mod stale_cleanup {
        use super::*;

        #[tokio::test]
        async fn orphaned_running_rows_become_failed() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            let cleaned = h.lifecycle.cleanup_stale_sessions().await.unwrap();
            assert_eq!(cleaned, 1);
            let fresh = h.store.get_session_unchecked(&session.id).await.unwrap().unwrap();
            assert_eq!(fresh.status, SessionStatus::Failed);
            assert!(fresh.completed_at.is_some());
        }

        #[tokio::test]
        async fn persisted_terminal_event_wins_over_failed() {
            let h = harness().await;
            let session = h.lifecycle.create(&h.user_id, "task", None).await.unwrap();
            h.store
                .update_session(
                    &session.id,
                    SessionUpdate {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            // The run actually finished; only the row update was lost.
            let record = EventRecord::new(
                EventBody::AgentComplete {
                    status: "complete".to_string(),
                    num_turns: 1,
                    duration_ms: 5,
                    total_cost_usd: None,
                    usage: None,
                    model: None,
                },
                1,
            );
            h.store.record_event(&session.id, &record).await.unwrap();

            h.lifecycle.cleanup_stale_sessions().await.unwrap();
            let fresh = h.store.get_session_unchecked(&session.id).await.unwrap().unwrap();
            assert_eq!(fresh.status, SessionStatus::Complete);
        }

        #[tokio::test]
        async fn nothing_to_clean_returns_zero() {
            let h = harness().await;
            assert_eq!(h.lifecycle.cleanup_stale_sessions().await.unwrap(), 0);
        }
    }
}
