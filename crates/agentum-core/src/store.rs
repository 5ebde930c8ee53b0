//! Metadata store: durable, indexed persistence for users, sessions, and
//! the canonical event subset.
//!
//! Backed by SQLite through `sqlx` with a single-connection pool (one writer
//! per session in practice, and SQLite is a single-writer engine anyway).
//! Migrations are embedded at compile time from `migrations/` and run on open.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::events::EventRecord;
use crate::session::{Session, SessionStatus, User};

/// Retries for transient database errors.
const MAX_RETRIES: u32 = 3;
/// Base delay before the first retry; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("event persistence failed after {attempts} attempts: {source}")]
    Persistence { attempts: u32, source: sqlx::Error },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Partial update applied to a session row.
///
/// Metric fields are deltas: they are *added* onto the stored values so that
/// `num_turns`, `duration_ms`, and `total_cost_usd` stay monotonically
/// non-decreasing across resumed runs.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub model: Option<String>,
    pub add_num_turns: Option<u32>,
    pub add_duration_ms: Option<u64>,
    pub add_cost_usd: Option<f64>,
    pub cancel_requested: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resume_id: Option<String>,
}

/// Durable store for users, sessions, and persisted events.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Io(e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Fetch a user by id, creating an anonymous one when `id` is `None` or
    /// unknown.
    pub async fn get_or_create_user(&self, id: Option<&str>) -> Result<User, StoreError> {
        if let Some(id) = id {
            let row = sqlx::query("SELECT id, type, created_at FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return user_from_row(&row);
            }
        }

        let user = User {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_type: "anonymous".to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO users (id, type, created_at) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.user_type)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, type, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Insert a new session row with status `pending`.
    pub async fn create_session(
        &self,
        id: &str,
        user_id: &str,
        task: &str,
        model: Option<&str>,
        working_dir: &str,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, status, task, model, working_dir, \
             created_at, updated_at) VALUES (?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(task)
        .bind(model)
        .bind(working_dir)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_session_unchecked(id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Fetch a session by id, filtered by owner. An unknown id and a
    /// cross-user id both return `None` so callers cannot distinguish them.
    pub async fn get_session(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Fetch a session by id without an owner filter (internal callers only).
    pub async fn get_session_unchecked(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// List a user's sessions, newest first, with the total count.
    pub async fn list_sessions(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let sessions = rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((sessions, total as u64))
    }

    /// Apply a partial update and return the post-image.
    pub async fn update_session(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE sessions SET \
             status = COALESCE(?, status), \
             model = COALESCE(?, model), \
             num_turns = num_turns + COALESCE(?, 0), \
             duration_ms = COALESCE(duration_ms, 0) + COALESCE(?, 0), \
             total_cost_usd = COALESCE(total_cost_usd, 0) + COALESCE(?, 0), \
             cancel_requested = COALESCE(?, cancel_requested), \
             completed_at = COALESCE(?, completed_at), \
             resume_id = COALESCE(?, resume_id), \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.model)
        .bind(update.add_num_turns.map(|n| n as i64))
        .bind(update.add_duration_ms.map(|n| n as i64))
        .bind(update.add_cost_usd)
        .bind(update.cancel_requested.map(|b| b as i64))
        .bind(update.completed_at)
        .bind(update.resume_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_session_unchecked(id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Persist the agent-reported resume id as soon as it is known, so that
    /// cancelled runs remain resumable.
    pub async fn set_resume_id(&self, id: &str, resume_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET resume_id = ?, updated_at = ? WHERE id = ?")
            .bind(resume_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_cancel_requested(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET cancel_requested = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All sessions currently in the given status (startup reconciliation).
    pub async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Persist one event, retrying transient failures with exponential
    /// backoff. Duplicate sequences and other constraint violations are not
    /// retried.
    pub async fn record_event(
        &self,
        session_id: &str,
        record: &EventRecord,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(&record.body)
            .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        let data = body
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let data_json =
            serde_json::to_string(&data).map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        let kind = record.kind().as_str();

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = sqlx::query(
                "INSERT INTO events (session_id, sequence, event_type, data, timestamp) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(record.sequence as i64)
            .bind(kind)
            .bind(&data_json)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if !is_transient(&e) => return Err(StoreError::Database(e)),
                Err(e) if attempt > MAX_RETRIES => {
                    return Err(StoreError::Persistence {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "event write failed for {} seq {} (attempt {}): {}",
                        session_id,
                        record.sequence,
                        attempt,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    /// Persisted events for a session with `sequence > after`, in order.
    pub async fn list_events(
        &self,
        session_id: &str,
        after: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT sequence, event_type, data, timestamp FROM events \
             WHERE session_id = ? AND sequence > ? ORDER BY sequence ASC",
        )
        .bind(session_id)
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    /// Highest persisted sequence for a session, 0 when none.
    pub async fn max_sequence(&self, session_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT MAX(sequence) AS n FROM events WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let max: Option<i64> = row.get("n");
        Ok(max.unwrap_or(0) as u64)
    }

    /// The status implied by the latest persisted terminal event, if any.
    /// Used at startup to reconcile sessions interrupted by a restart. The
    /// non-terminal line-overflow warning shares the `error` kind and is
    /// skipped.
    pub async fn latest_terminal_status(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionStatus>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_type, data FROM events \
             WHERE session_id = ? AND event_type IN ('agent_complete', 'error', 'cancelled') \
             ORDER BY sequence DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let event_type: String = row.get("event_type");
            let data: String = row.get("data");
            if event_type == "error" && is_line_overflow(&data) {
                continue;
            }
            return Ok(Some(terminal_status_of(&event_type, &data)));
        }
        Ok(None)
    }
}

/// Whether an `error` payload is the non-terminal line-overflow warning.
fn is_line_overflow(data: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("error_type").and_then(|t| t.as_str()).map(str::to_string))
        .as_deref()
        == Some(crate::events::LINE_OVERFLOW_ERROR)
}

/// Map a persisted terminal event back to the session status it implies.
fn terminal_status_of(event_type: &str, data: &str) -> SessionStatus {
    match event_type {
        "cancelled" => SessionStatus::Cancelled,
        "agent_complete" => {
            let status = serde_json::from_str::<serde_json::Value>(data)
                .ok()
                .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_lowercase));
            match status.as_deref() {
                Some("complete") | Some("completed") => SessionStatus::Complete,
                _ => SessionStatus::Failed,
            }
        }
        _ => SessionStatus::Failed,
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => !db.is_unique_violation() && !db.is_foreign_key_violation(),
        _ => false,
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.get("id"),
        user_type: row.get("type"),
        created_at: row.get("created_at"),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let status: String = row.get("status");
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown status '{status}'")))?;
    let num_turns: i64 = row.get("num_turns");
    let duration_ms: Option<i64> = row.get("duration_ms");
    let cancel_requested: i64 = row.get("cancel_requested");
    Ok(Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        status,
        task: row.get("task"),
        model: row.get("model"),
        working_dir: row.get("working_dir"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
        num_turns: num_turns as u32,
        duration_ms: duration_ms.map(|n| n as u64),
        total_cost_usd: row.get("total_cost_usd"),
        cancel_requested: cancel_requested != 0,
        resume_id: row.get("resume_id"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, StoreError> {
    let sequence: i64 = row.get("sequence");
    let event_type: String = row.get("event_type");
    let data: String = row.get("data");
    let timestamp: DateTime<Utc> = row.get("timestamp");

    let payload: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| StoreError::CorruptRow(e.to_string()))?;
    let value = serde_json::json!({
        "type": event_type,
        "data": payload,
        "timestamp": timestamp,
        "sequence": sequence,
    });
    serde_json::from_value(value).map_err(|e| StoreError::CorruptRow(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBody;

    async fn store() -> MetadataStore {
        MetadataStore::open_in_memory().await.unwrap()
    }

    async fn seeded_session(store: &MetadataStore) -> Session {
        let user = store.get_or_create_user(None).await.unwrap();
        store
            .create_session(
                "20260105_123456_deadbeef",
                &user.id,
                "write hello",
                Some("model-1"),
                "/tmp/sessions/20260105_123456_deadbeef/workspace",
            )
            .await
            .unwrap()
    }

    fn message_event(sequence: u64, partial: bool) -> EventRecord {
        EventRecord::new(
            EventBody::Message {
                text: "hi".to_string(),
                is_partial: partial,
                full_text: (!partial).then(|| "hi".to_string()),
            },
            sequence,
        )
    }

    mod users {
        use super::*;

        #[tokio::test]
        async fn creates_anonymous_user() {
            let store = store().await;
            let user = store.get_or_create_user(None).await.unwrap();
            assert_eq!(user.user_type, "anonymous");
            assert_eq!(user.id.len(), 36);
        }

        #[tokio::test]
        async fn returns_existing_user() {
            let store = store().await;
            let user = store.get_or_create_user(None).await.unwrap();
            let again = store.get_or_create_user(Some(&user.id)).await.unwrap();
            assert_eq!(user.id, again.id);
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn create_and_fetch_roundtrip() {
            let store = store().await;
            let session = seeded_session(&store).await;
            assert_eq!(session.status, SessionStatus::Pending);

            let fetched = store
                .get_session(&session.id, &session.user_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(fetched.id, session.id);
            assert_eq!(fetched.task, "write hello");
            assert_eq!(fetched.model.as_deref(), Some("model-1"));
        }

        #[tokio::test]
        async fn cross_user_fetch_is_absent() {
            let store = store().await;
            let session = seeded_session(&store).await;
            let other = store.get_or_create_user(None).await.unwrap();
            let fetched = store.get_session(&session.id, &other.id).await.unwrap();
            assert!(fetched.is_none());
        }

        #[tokio::test]
        async fn list_returns_total() {
            let store = store().await;
            let session = seeded_session(&store).await;
            let (sessions, total) = store.list_sessions(&session.user_id, 10, 0).await.unwrap();
            assert_eq!(total, 1);
            assert_eq!(sessions.len(), 1);
        }

        #[tokio::test]
        async fn metrics_accumulate_monotonically() {
            let store = store().await;
            let session = seeded_session(&store).await;

            let update = SessionUpdate {
                add_num_turns: Some(3),
                add_duration_ms: Some(1000),
                add_cost_usd: Some(0.10),
                ..Default::default()
            };
            let after_first = store.update_session(&session.id, update.clone()).await.unwrap();
            let after_second = store.update_session(&session.id, update).await.unwrap();

            assert_eq!(after_first.num_turns, 3);
            assert_eq!(after_second.num_turns, 6);
            assert_eq!(after_second.duration_ms, Some(2000));
            assert!(after_second.total_cost_usd.unwrap() > 0.19);
        }

        #[tokio::test]
        async fn resume_id_persists() {
            let store = store().await;
            let session = seeded_session(&store).await;
            store.set_resume_id(&session.id, "conv-abc").await.unwrap();
            let fetched = store.get_session_unchecked(&session.id).await.unwrap().unwrap();
            assert_eq!(fetched.resume_id.as_deref(), Some("conv-abc"));
        }
    }

    mod events {
        use super::*;

        #[tokio::test]
        async fn record_and_list_preserves_order() {
            let store = store().await;
            let session = seeded_session(&store).await;

            for seq in 1..=5 {
                store
                    .record_event(&session.id, &message_event(seq, false))
                    .await
                    .unwrap();
            }

            let events = store.list_events(&session.id, 0).await.unwrap();
            let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        }

        #[tokio::test]
        async fn list_after_filters_prefix() {
            let store = store().await;
            let session = seeded_session(&store).await;
            for seq in 1..=4 {
                store
                    .record_event(&session.id, &message_event(seq, false))
                    .await
                    .unwrap();
            }
            let events = store.list_events(&session.id, 2).await.unwrap();
            let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, vec![3, 4]);
        }

        #[tokio::test]
        async fn duplicate_sequence_is_not_retried() {
            let store = store().await;
            let session = seeded_session(&store).await;
            store
                .record_event(&session.id, &message_event(1, false))
                .await
                .unwrap();
            let err = store
                .record_event(&session.id, &message_event(1, false))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Database(_)));
        }

        #[tokio::test]
        async fn max_sequence_tracks_highest() {
            let store = store().await;
            let session = seeded_session(&store).await;
            assert_eq!(store.max_sequence(&session.id).await.unwrap(), 0);
            store
                .record_event(&session.id, &message_event(7, false))
                .await
                .unwrap();
            assert_eq!(store.max_sequence(&session.id).await.unwrap(), 7);
        }

        #[tokio::test]
        async fn terminal_status_from_events() {
            let store = store().await;
            let session = seeded_session(&store).await;
            let cancelled = EventRecord::new(
                EventBody::Cancelled {
                    message: "stop".to_string(),
                    resumable: true,
                },
                1,
            );
            store.record_event(&session.id, &cancelled).await.unwrap();
            let status = store.latest_terminal_status(&session.id).await.unwrap();
            assert_eq!(status, Some(SessionStatus::Cancelled));
        }

        #[tokio::test]
        async fn line_overflow_warning_is_not_a_terminal_status() {
            let store = store().await;
            let session = seeded_session(&store).await;
            let warning = EventRecord::new(
                EventBody::Error {
                    message: "line dropped".to_string(),
                    error_type: crate::events::LINE_OVERFLOW_ERROR.to_string(),
                },
                1,
            );
            store.record_event(&session.id, &warning).await.unwrap();
            let status = store.latest_terminal_status(&session.id).await.unwrap();
            assert_eq!(status, None);

            // A real terminal event after the warning still wins.
            let cancelled = EventRecord::new(
                EventBody::Cancelled {
                    message: "stop".to_string(),
                    resumable: true,
                },
                2,
            );
            store.record_event(&session.id, &cancelled).await.unwrap();
            let status = store.latest_terminal_status(&session.id).await.unwrap();
            assert_eq!(status, Some(SessionStatus::Cancelled));
        }

        #[tokio::test]
        async fn no_terminal_status_when_stream_open() {
            let store = store().await;
            let session = seeded_session(&store).await;
            store
                .record_event(&session.id, &message_event(1, false))
                .await
                .unwrap();
            let status = store.latest_terminal_status(&session.id).await.unwrap();
            assert_eq!(status, None);
        }
    }
}
