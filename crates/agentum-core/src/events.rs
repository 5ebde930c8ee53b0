//! Canonical event records for the session runtime.
//!
//! Every event that flows through a session — from the agent child process,
//! the supervisor, or the hub itself — is an [`EventRecord`]: a typed body
//! plus the sequence number and timestamp assigned by the hub. The wire shape
//! is fixed: `{"type": ..., "data": {...}, "timestamp": ..., "sequence": ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `error_type` of the warning emitted when an agent stdout line exceeds the
/// configured bound and is dropped. The only `error` payload that does not
/// close the stream.
pub const LINE_OVERFLOW_ERROR: &str = "line_overflow";

/// Event kinds, in the order clients usually see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStart,
    UserMessage,
    Thinking,
    Message,
    ToolStart,
    ToolComplete,
    OutputDisplay,
    AgentComplete,
    MetricsUpdate,
    Error,
    Cancelled,
    ConversationTurn,
    ProfileSwitch,
    HookTriggered,
    SessionConnect,
    SessionDisconnect,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStart => "agent_start",
            EventKind::UserMessage => "user_message",
            EventKind::Thinking => "thinking",
            EventKind::Message => "message",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolComplete => "tool_complete",
            EventKind::OutputDisplay => "output_display",
            EventKind::AgentComplete => "agent_complete",
            EventKind::MetricsUpdate => "metrics_update",
            EventKind::Error => "error",
            EventKind::Cancelled => "cancelled",
            EventKind::ConversationTurn => "conversation_turn",
            EventKind::ProfileSwitch => "profile_switch",
            EventKind::HookTriggered => "hook_triggered",
            EventKind::SessionConnect => "session_connect",
            EventKind::SessionDisconnect => "session_disconnect",
        }
    }

    /// Terminal kinds close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::AgentComplete | EventKind::Error | EventKind::Cancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage counters reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another run's usage onto this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }
}

/// Typed event body.
///
/// One variant per event kind; the `type`/`data` JSON shape is produced by the
/// adjacently-tagged representation so no untyped map travels through the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    /// The agent child announced itself. `session_id` here is the agent's own
    /// conversation id, captured by the supervisor as the resume id.
    AgentStart {
        session_id: String,
        model: String,
        tools: Vec<String>,
        working_dir: String,
        task: String,
    },

    /// The user-submitted prompt, echoed into the stream.
    UserMessage { text: String },

    /// Extended thinking text.
    Thinking { text: String },

    /// Assistant text. Partial fragments stream with `is_partial = true`;
    /// the finalized message carries the concatenated `full_text`.
    Message {
        text: String,
        is_partial: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        full_text: Option<String>,
    },

    /// A tool invocation began.
    ToolStart {
        tool_name: String,
        tool_input: serde_json::Value,
        tool_id: String,
    },

    /// A tool invocation finished.
    ToolComplete {
        tool_name: String,
        tool_id: String,
        result: serde_json::Value,
        duration_ms: u64,
        is_error: bool,
    },

    /// Structured task output surfaced for display.
    OutputDisplay {
        output: String,
        error: String,
        comments: String,
        result_files: Vec<String>,
        status: String,
    },

    /// The agent finished its run.
    AgentComplete {
        status: String,
        num_turns: u32,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Incremental metrics snapshot.
    MetricsUpdate {
        turns: u32,
        tokens_in: u64,
        tokens_out: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// A run-level error. Terminal unless the supervisor says otherwise.
    Error { message: String, error_type: String },

    /// The run was cancelled. `resumable` is true when the agent had reported
    /// a conversation id before the cancel landed.
    Cancelled { message: String, resumable: bool },

    /// Summary of one completed conversation turn.
    ConversationTurn {
        turn_number: u32,
        prompt_preview: String,
        response_preview: String,
        duration_ms: u64,
        tools_used: Vec<String>,
    },

    /// The permission profile in effect changed.
    ProfileSwitch {
        profile_name: String,
        tools: Vec<String>,
        allow_rules: u32,
        deny_rules: u32,
    },

    /// A permission hook fired for a tool call.
    HookTriggered {
        hook_type: String,
        tool_call: String,
        decision: String,
    },

    /// A subscriber attached to the live stream.
    SessionConnect { subscriber_count: u32 },

    /// A subscriber detached from the live stream.
    SessionDisconnect { subscriber_count: u32 },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::AgentStart { .. } => EventKind::AgentStart,
            EventBody::UserMessage { .. } => EventKind::UserMessage,
            EventBody::Thinking { .. } => EventKind::Thinking,
            EventBody::Message { .. } => EventKind::Message,
            EventBody::ToolStart { .. } => EventKind::ToolStart,
            EventBody::ToolComplete { .. } => EventKind::ToolComplete,
            EventBody::OutputDisplay { .. } => EventKind::OutputDisplay,
            EventBody::AgentComplete { .. } => EventKind::AgentComplete,
            EventBody::MetricsUpdate { .. } => EventKind::MetricsUpdate,
            EventBody::Error { .. } => EventKind::Error,
            EventBody::Cancelled { .. } => EventKind::Cancelled,
            EventBody::ConversationTurn { .. } => EventKind::ConversationTurn,
            EventBody::ProfileSwitch { .. } => EventKind::ProfileSwitch,
            EventBody::HookTriggered { .. } => EventKind::HookTriggered,
            EventBody::SessionConnect { .. } => EventKind::SessionConnect,
            EventBody::SessionDisconnect { .. } => EventKind::SessionDisconnect,
        }
    }

    /// Terminal events end the stream and dispose the hub. Every `error`
    /// event is terminal except the [`LINE_OVERFLOW_ERROR`] warning, which
    /// reports a truncated stdout line while the run continues.
    pub fn is_terminal(&self) -> bool {
        match self {
            EventBody::Error { error_type, .. } => error_type != LINE_OVERFLOW_ERROR,
            _ => self.kind().is_terminal(),
        }
    }

    /// True for streaming message fragments.
    pub fn is_partial_message(&self) -> bool {
        matches!(self, EventBody::Message { is_partial: true, .. })
    }

    /// Everything except partial message fragments is persisted.
    pub fn is_persistable(&self) -> bool {
        !self.is_partial_message()
    }
}

/// A sequenced, timestamped event as seen by subscribers and the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub body: EventBody,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl EventRecord {
    pub fn new(body: EventBody, sequence: u64) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
            sequence,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod wire_format {
        use super::*;

        #[test]
        fn record_serializes_to_documented_shape() {
            let record = EventRecord::new(
                EventBody::ToolStart {
                    tool_name: "Read".to_string(),
                    tool_input: json!({"file_path": "./x.py"}),
                    tool_id: "t_1".to_string(),
                },
                42,
            );

            let value = serde_json::to_value(&record).unwrap();
            assert_eq!(value["type"], "tool_start");
            assert_eq!(value["data"]["tool_name"], "Read");
            assert_eq!(value["data"]["tool_input"]["file_path"], "./x.py");
            assert_eq!(value["sequence"], 42);
            assert!(value["timestamp"].is_string());
        }

        #[test]
        fn kinds_are_snake_case() {
            let record = EventRecord::new(
                EventBody::AgentComplete {
                    status: "complete".to_string(),
                    num_turns: 3,
                    duration_ms: 1200,
                    total_cost_usd: Some(0.05),
                    usage: None,
                    model: Some("m".to_string()),
                },
                7,
            );
            let json = serde_json::to_string(&record).unwrap();
            assert!(json.contains("\"type\":\"agent_complete\""));
        }

        #[test]
        fn partial_message_omits_full_text() {
            let record = EventRecord::new(
                EventBody::Message {
                    text: "Hel".to_string(),
                    is_partial: true,
                    full_text: None,
                },
                1,
            );
            let json = serde_json::to_string(&record).unwrap();
            assert!(!json.contains("full_text"));
        }

        #[test]
        fn roundtrip_preserves_body() {
            let record = EventRecord::new(
                EventBody::Cancelled {
                    message: "stop".to_string(),
                    resumable: true,
                },
                9,
            );
            let json = serde_json::to_string(&record).unwrap();
            let parsed: EventRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.sequence, 9);
            match parsed.body {
                EventBody::Cancelled { resumable, .. } => assert!(resumable),
                other => panic!("expected cancelled, got {:?}", other.kind()),
            }
        }
    }

    mod predicates {
        use super::*;

        #[test]
        fn terminal_kinds() {
            assert!(EventKind::AgentComplete.is_terminal());
            assert!(EventKind::Error.is_terminal());
            assert!(EventKind::Cancelled.is_terminal());
            assert!(!EventKind::Message.is_terminal());
            assert!(!EventKind::ToolStart.is_terminal());
        }

        #[test]
        fn partial_messages_are_not_persistable() {
            let partial = EventBody::Message {
                text: "a".to_string(),
                is_partial: true,
                full_text: None,
            };
            let fin = EventBody::Message {
                text: "ab".to_string(),
                is_partial: false,
                full_text: Some("ab".to_string()),
            };
            assert!(!partial.is_persistable());
            assert!(fin.is_persistable());
        }

        #[test]
        fn non_message_kinds_are_persistable() {
            let body = EventBody::Thinking {
                text: "hmm".to_string(),
            };
            assert!(body.is_persistable());
        }

        #[test]
        fn line_overflow_error_is_not_terminal() {
            let warning = EventBody::Error {
                message: "line dropped".to_string(),
                error_type: LINE_OVERFLOW_ERROR.to_string(),
            };
            assert!(!warning.is_terminal());
            // Still part of the persisted transcript.
            assert!(warning.is_persistable());

            let fatal = EventBody::Error {
                message: "boom".to_string(),
                error_type: "timeout".to_string(),
            };
            assert!(fatal.is_terminal());
        }
    }

    mod token_usage {
        use super::*;

        #[test]
        fn add_accumulates_all_counters() {
            let mut total = TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                cache_creation_input_tokens: 1,
                cache_read_input_tokens: 2,
            };
            total.add(&TokenUsage {
                input_tokens: 5,
                output_tokens: 5,
                cache_creation_input_tokens: 5,
                cache_read_input_tokens: 5,
            });
            assert_eq!(total.input_tokens, 15);
            assert_eq!(total.output_tokens, 25);
            assert_eq!(total.cache_creation_input_tokens, 6);
            assert_eq!(total.cache_read_input_tokens, 7);
        }

        #[test]
        fn missing_fields_default_to_zero() {
            let usage: TokenUsage = serde_json::from_str(r#"{"input_tokens": 3}"#).unwrap();
            assert_eq!(usage.input_tokens, 3);
            assert_eq!(usage.output_tokens, 0);
        }
    }
}
