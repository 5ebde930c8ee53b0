//! Permission rule engine.
//!
//! A profile declares ordered `allow`/`deny` pattern lists plus four tool
//! categories. Tool calls are formatted `ToolName(argument...)` — e.g.
//! `Bash(git status)` or `Write(./out.yaml)` — and evaluated in a fixed order:
//!
//! 1. tool in `disabled` -> deny
//! 2. tool in `pre_approved` -> allow, no rule scan
//! 3. first matching `deny` pattern -> deny
//! 4. first matching `allow` pattern -> allow
//! 5. default -> deny
//!
//! Deny patterns are consulted before allow patterns so explicit prohibitions
//! win over broad allows like `Bash(*)`. Anything undecidable (including a
//! pattern that fails to compile) falls back to deny.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Denials of the same tool-call fingerprint tolerated before the engine asks
/// the host to abort the run.
const DEFAULT_INTERRUPT_THRESHOLD: u32 = 3;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse profile {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Tool-name categories from the profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCategories {
    /// Tools the agent is told exist.
    #[serde(default)]
    pub enabled: Vec<String>,
    /// Always denied, even when allow-matched.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Routed through the decision function with a confirmation flag.
    #[serde(default)]
    pub permission_checked: Vec<String>,
    /// Bypass the rule scan entirely.
    #[serde(default)]
    pub pre_approved: Vec<String>,
}

/// A permission profile as loaded from `permissions.yaml`.
///
/// `allow` and `deny` are explicitly ordered sequences; declaration order is
/// significant and must never be replaced by a map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tools: ToolCategories,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// Denials of one fingerprint tolerated before the run is interrupted.
    #[serde(default)]
    pub interrupt_threshold: Option<u32>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|e| ProfileError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_yaml::from_str(&text).map_err(|e| ProfileError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Outcome of a permission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Set on a denial once the same fingerprint has been denied more than
    /// the configured threshold; instructs the host to abort the run.
    pub interrupt: bool,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            interrupt: false,
        }
    }

    fn deny(interrupt: bool) -> Self {
        Self {
            allowed: false,
            interrupt,
        }
    }
}

/// One compiled pattern: a tool-name matcher plus an optional argument glob.
#[derive(Debug)]
struct CompiledRule {
    name: Regex,
    arg: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, call: &ToolCall<'_>) -> bool {
        if !self.name.is_match(call.name) {
            return false;
        }
        match (&self.arg, call.arg) {
            // Bare tool-name pattern matches any invocation of that tool.
            (None, _) => true,
            // Argument pattern against a call without arguments: only `*`
            // style globs that accept the empty string can match.
            (Some(re), None) => re.is_match(""),
            (Some(re), Some(arg)) => re.is_match(arg),
        }
    }
}

struct ToolCall<'a> {
    name: &'a str,
    arg: Option<&'a str>,
}

/// Split `ToolName(argument)` into its parts. A call without parentheses is a
/// bare tool name.
fn split_tool_call(call: &str) -> ToolCall<'_> {
    match call.find('(') {
        Some(open) if call.ends_with(')') => ToolCall {
            name: &call[..open],
            arg: Some(&call[open + 1..call.len() - 1]),
        },
        _ => ToolCall {
            name: call,
            arg: None,
        },
    }
}

/// Compile a glob into an anchored regex.
///
/// `**` always crosses path separators. A single `*` stays within one path
/// segment when the word containing it is a path (has a `/`); in plain
/// argument position it matches anything, so `Bash(rm *)` covers
/// `rm -rf /tmp` while `Read(./src/*.py)` does not reach into
/// subdirectories.
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for (i, word) in glob.split(' ').enumerate() {
        if i > 0 {
            pattern.push(' ');
        }
        let path_scoped = word.contains('/');
        let mut chars = word.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        pattern.push_str(".*");
                    } else if path_scoped {
                        pattern.push_str("[^/]*");
                    } else {
                        pattern.push_str(".*");
                    }
                }
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Runtime decision function built from a [`Profile`].
pub struct PermissionEngine {
    profile_name: String,
    enabled: Vec<String>,
    disabled: Vec<String>,
    pre_approved: Vec<String>,
    permission_checked: Vec<String>,
    deny: Vec<CompiledRule>,
    allow: Vec<CompiledRule>,
    allow_count: u32,
    deny_count: u32,
    interrupt_threshold: u32,
    denial_counts: Mutex<HashMap<String, u32>>,
}

impl PermissionEngine {
    /// Build an engine for one session. `workspace` replaces the
    /// `{workspace}` placeholder in patterns before compilation.
    pub fn new(profile: &Profile, workspace: &Path) -> Self {
        let workspace_str = workspace.display().to_string();
        let compile_list = |patterns: &[String]| -> Vec<CompiledRule> {
            patterns
                .iter()
                .filter_map(|p| {
                    let substituted = p.replace("{workspace}", &workspace_str);
                    match compile_rule(&substituted) {
                        Ok(rule) => Some(rule),
                        Err(e) => {
                            // An uncompilable pattern matches nothing. For
                            // allow that means deny by default; for deny the
                            // explicit prohibition is lost, so warn loudly.
                            log::warn!("ignoring unparseable permission pattern {p:?}: {e}");
                            None
                        }
                    }
                })
                .collect()
        };

        Self {
            profile_name: profile.name.clone().unwrap_or_else(|| "default".to_string()),
            enabled: profile.tools.enabled.clone(),
            disabled: profile.tools.disabled.clone(),
            pre_approved: profile.tools.pre_approved.clone(),
            permission_checked: profile.tools.permission_checked.clone(),
            deny: compile_list(&profile.deny),
            allow: compile_list(&profile.allow),
            allow_count: profile.allow.len() as u32,
            deny_count: profile.deny.len() as u32,
            interrupt_threshold: profile
                .interrupt_threshold
                .unwrap_or(DEFAULT_INTERRUPT_THRESHOLD),
            denial_counts: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_interrupt_threshold(mut self, threshold: u32) -> Self {
        self.interrupt_threshold = threshold;
        self
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Tools the agent is told exist, minus the disabled set.
    pub fn enabled_tools(&self) -> Vec<String> {
        self.enabled
            .iter()
            .filter(|t| !self.disabled.contains(t))
            .cloned()
            .collect()
    }

    /// Rule counts, surfaced in `profile_switch` events.
    pub fn rule_counts(&self) -> (u32, u32) {
        (self.allow_count, self.deny_count)
    }

    /// Evaluate a tool call against the profile.
    pub fn evaluate(&self, tool_call: &str) -> Decision {
        let call = split_tool_call(tool_call);

        if self.disabled.iter().any(|t| t == call.name) {
            return self.record_denial(tool_call);
        }
        if self.pre_approved.iter().any(|t| t == call.name) {
            return Decision::allow();
        }
        if self.deny.iter().any(|rule| rule.matches(&call)) {
            return self.record_denial(tool_call);
        }
        if self.allow.iter().any(|rule| rule.matches(&call)) {
            return Decision::allow();
        }
        self.record_denial(tool_call)
    }

    /// Convenience wrapper over [`evaluate`](Self::evaluate).
    pub fn is_allowed(&self, tool_call: &str) -> bool {
        self.evaluate(tool_call).allowed
    }

    /// True iff the tool-name prefix routes through user confirmation.
    pub fn needs_confirmation(&self, tool_call: &str) -> bool {
        let call = split_tool_call(tool_call);
        self.permission_checked.iter().any(|t| t == call.name)
    }

    fn record_denial(&self, fingerprint: &str) -> Decision {
        let mut counts = match self.denial_counts.lock() {
            Ok(counts) => counts,
            // A poisoned counter map must not turn a denial into an allow.
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counts.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        Decision::deny(*count > self.interrupt_threshold)
    }
}

fn compile_rule(pattern: &str) -> Result<CompiledRule, regex::Error> {
    let parts = split_tool_call(pattern);
    Ok(CompiledRule {
        name: glob_to_regex(parts.name)?,
        arg: parts.arg.map(glob_to_regex).transpose()?,
    })
}
