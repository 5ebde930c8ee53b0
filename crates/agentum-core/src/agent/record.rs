//! Structured records emitted by the agent child on stdout.
//!
//! The child writes one JSON object per line; each complete line maps 1:1 to
//! an event kind. Malformed lines are logged and dropped without aborting the
//! stream.

use serde::Deserialize;

use crate::events::{EventBody, TokenUsage};

/// One parsed line of agent output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    /// First record of a run. `session_id` is the agent's own conversation
    /// id — the resume token for continuing this conversation later.
    AgentStart {
        session_id: String,
        #[serde(default)]
        model: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        working_dir: String,
        #[serde(default)]
        task: String,
    },

    Thinking {
        text: String,
    },

    Message {
        text: String,
        #[serde(default)]
        is_partial: bool,
        #[serde(default)]
        full_text: Option<String>,
    },

    ToolStart {
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
        tool_id: String,
    },

    ToolComplete {
        tool_name: String,
        tool_id: String,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        is_error: bool,
    },

    ConversationTurn {
        turn_number: u32,
        #[serde(default)]
        prompt_preview: String,
        #[serde(default)]
        response_preview: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        tools_used: Vec<String>,
    },

    OutputDisplay {
        #[serde(default)]
        output: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        comments: String,
        #[serde(default)]
        result_files: Vec<String>,
        #[serde(default)]
        status: String,
    },

    MetricsUpdate {
        #[serde(default)]
        turns: u32,
        #[serde(default)]
        tokens_in: u64,
        #[serde(default)]
        tokens_out: u64,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        model: Option<String>,
    },

    AgentComplete {
        #[serde(default = "default_status")]
        status: String,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<TokenUsage>,
        #[serde(default)]
        model: Option<String>,
    },

    Error {
        message: String,
        #[serde(default = "default_error_type")]
        error_type: String,
    },
}

fn default_status() -> String {
    "complete".to_string()
}

fn default_error_type() -> String {
    "agent_error".to_string()
}

impl AgentRecord {
    /// Parse one line. Returns `None` for malformed input.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("dropping malformed agent line: {e}");
                None
            }
        }
    }

    /// The resume token, when this record carries one.
    pub fn resume_id(&self) -> Option<&str> {
        match self {
            AgentRecord::AgentStart { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Convert into the event body forwarded to the hub.
    pub fn into_event_body(self) -> EventBody {
        match self {
            AgentRecord::AgentStart {
                session_id,
                model,
                tools,
                working_dir,
                task,
            } => EventBody::AgentStart {
                session_id,
                model,
                tools,
                working_dir,
                task,
            },
            AgentRecord::Thinking { text } => EventBody::Thinking { text },
            AgentRecord::Message {
                text,
                is_partial,
                full_text,
            } => EventBody::Message {
                text,
                is_partial,
                full_text,
            },
            AgentRecord::ToolStart {
                tool_name,
                tool_input,
                tool_id,
            } => EventBody::ToolStart {
                tool_name,
                tool_input,
                tool_id,
            },
            AgentRecord::ToolComplete {
                tool_name,
                tool_id,
                result,
                duration_ms,
                is_error,
            } => EventBody::ToolComplete {
                tool_name,
                tool_id,
                result,
                duration_ms,
                is_error,
            },
            AgentRecord::ConversationTurn {
                turn_number,
                prompt_preview,
                response_preview,
                duration_ms,
                tools_used,
            } => EventBody::ConversationTurn {
                turn_number,
                prompt_preview,
                response_preview,
                duration_ms,
                tools_used,
            },
            AgentRecord::OutputDisplay {
                output,
                error,
                comments,
                result_files,
                status,
            } => EventBody::OutputDisplay {
                output,
                error,
                comments,
                result_files,
                status,
            },
            AgentRecord::MetricsUpdate {
                turns,
                tokens_in,
                tokens_out,
                total_cost_usd,
                model,
            } => EventBody::MetricsUpdate {
                turns,
                tokens_in,
                tokens_out,
                total_cost_usd,
                model,
            },
            AgentRecord::AgentComplete {
                status,
                num_turns,
                duration_ms,
                total_cost_usd,
                usage,
                model,
            } => EventBody::AgentComplete {
                status,
                num_turns,
                duration_ms,
                total_cost_usd,
                usage,
                model,
            },
            AgentRecord::Error {
                message,
                error_type,
            } => EventBody::Error {
                message,
                error_type,
            },
        }
    }

    /// Format the tool-call fingerprint checked against the permission
    /// engine, e.g. `Bash(git status)` or `Write(./out.yaml)`.
    pub fn tool_call_fingerprint(&self) -> Option<String> {
        let AgentRecord::ToolStart {
            tool_name,
            tool_input,
            ..
        } = self
        else {
            return None;
        };

        // The display argument: a bash command, a file path, or the raw
        // input for anything else.
        let arg = tool_input
            .get("command")
            .or_else(|| tool_input.get("file_path"))
            .or_else(|| tool_input.get("path"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if tool_input.is_null() {
                    String::new()
                } else {
                    tool_input.to_string()
                }
            });
        Some(format!("{tool_name}({arg})"))
    }
}
