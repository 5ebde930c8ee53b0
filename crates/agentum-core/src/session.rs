//! Session domain types shared by the store, lifecycle manager, and supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::TokenUsage;

/// Session lifecycle status.
///
/// `Pending -> Running` is the only non-terminal transition; every other legal
/// transition lands in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "running" => Some(SessionStatus::Running),
            "complete" => Some(SessionStatus::Complete),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        match self {
            SessionStatus::Pending => {
                matches!(
                    to,
                    SessionStatus::Running | SessionStatus::Failed | SessionStatus::Cancelled
                )
            }
            SessionStatus::Running => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session row as stored in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub task: String,
    pub model: Option<String>,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub num_turns: u32,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub cancel_requested: bool,
    pub resume_id: Option<String>,
}

/// Machine-readable session mirror written to `session_info.json` for the
/// agent child to consume inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub cumulative_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Fresh mirror for a session row, with zeroed usage counters. When a
    /// run finishes, the supervisor carries the previously written mirror's
    /// `cumulative_usage` forward before adding the run's own usage.
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            working_dir: session.working_dir.clone(),
            model: session.model.clone(),
            resume_id: session.resume_id.clone(),
            num_turns: session.num_turns,
            cumulative_usage: TokenUsage::default(),
            created_at: session.created_at,
        }
    }
}

/// Registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(rename = "type")]
    pub user_type: String,
    pub created_at: DateTime<Utc>,
}

/// Resolved parameters for one agent run, handed to the supervisor.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub session_id: String,
    pub task: String,
    pub model: String,
    pub max_turns: u32,
    pub timeout_seconds: u64,
    pub workspace: std::path::PathBuf,
    pub resume_id: Option<String>,
}
