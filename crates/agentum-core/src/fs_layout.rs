//! Per-session directory tree.
//!
//! ```text
//! <sessions_root>/<session_id>/
//!   session_info.json       machine-readable session mirror
//!   agent.jsonl             raw per-line child stdout
//!   workspace/
//!     output.yaml           structured final output
//!     skills -> ../../..    read-only symlink to the shared skills tree
//! ```
//!
//! Session ids are validated against a strict format before any path join,
//! and resolved paths are checked to stay inside the sessions root.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionInfo;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{8}_\d{6}_[a-f0-9]{8}$").expect("session id regex")
});

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("path escapes the session workspace: {0}")]
    PathEscape(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Generate a fresh session id: `YYYYMMDD_HHMMSS_<8 hex>`.
///
/// Human-sortable, URL-safe, and path-safe by construction.
pub fn generate_session_id() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let uid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", ts, &uid[..8])
}

/// Validate a session id against the documented format.
pub fn validate_session_id(id: &str) -> Result<(), FsError> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(FsError::InvalidSessionId(id.to_string()))
    }
}

/// Structured task output parsed from `workspace/output.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDoc {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub result_files: Vec<String>,
    #[serde(default = "default_output_status")]
    pub status: String,
}

fn default_output_status() -> String {
    "failed".to_string()
}

impl Default for OutputDoc {
    fn default() -> Self {
        Self {
            output: String::new(),
            error: String::new(),
            comments: String::new(),
            result_files: Vec::new(),
            status: default_output_status(),
        }
    }
}

/// Handle to the on-disk session hierarchy.
#[derive(Debug, Clone)]
pub struct SessionFs {
    sessions_root: PathBuf,
    skills_dir: PathBuf,
}

impl SessionFs {
    pub fn new(sessions_root: impl Into<PathBuf>, skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            skills_dir: skills_dir.into(),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Directory for a session. Validates the id before joining.
    pub fn session_dir(&self, id: &str) -> Result<PathBuf, FsError> {
        validate_session_id(id)?;
        Ok(self.sessions_root.join(id))
    }

    /// The agent's working directory and output area.
    pub fn workspace_dir(&self, id: &str) -> Result<PathBuf, FsError> {
        Ok(self.session_dir(id)?.join("workspace"))
    }

    pub fn output_file(&self, id: &str) -> Result<PathBuf, FsError> {
        Ok(self.workspace_dir(id)?.join("output.yaml"))
    }

    /// Raw child stdout capture.
    pub fn log_file(&self, id: &str) -> Result<PathBuf, FsError> {
        Ok(self.session_dir(id)?.join("agent.jsonl"))
    }

    pub fn info_file(&self, id: &str) -> Result<PathBuf, FsError> {
        Ok(self.session_dir(id)?.join("session_info.json"))
    }

    /// Create the session directory tree: `<id>/` and `<id>/workspace/`.
    pub fn create(&self, id: &str) -> Result<PathBuf, FsError> {
        let workspace = self.workspace_dir(id)?;
        std::fs::create_dir_all(&workspace).map_err(|e| FsError::io(&workspace, e))?;
        Ok(self.sessions_root.join(id))
    }

    /// Write the `session_info.json` mirror.
    pub fn write_info(&self, id: &str, info: &SessionInfo) -> Result<(), FsError> {
        let path = self.info_file(id)?;
        let json = serde_json::to_string_pretty(info)
            .map_err(|e| FsError::io(&path, std::io::Error::other(e)))?;
        std::fs::write(&path, json).map_err(|e| FsError::io(&path, e))
    }

    /// Read the `session_info.json` mirror back, if one was written. A
    /// malformed file reads as absent rather than failing the caller.
    pub fn read_info(&self, id: &str) -> Result<Option<SessionInfo>, FsError> {
        let path = self.info_file(id)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::io(&path, e)),
        };
        match serde_json::from_str(&text) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                log::warn!("failed to parse session_info.json for session {id}: {e}");
                Ok(None)
            }
        }
    }

    /// Install the read-only skills symlink at `workspace/skills`.
    ///
    /// The shared skills tree is symlinked, never copied per-session.
    pub fn install_skills_symlink(&self, id: &str) -> Result<(), FsError> {
        let link = self.workspace_dir(id)?.join("skills");
        if link.symlink_metadata().is_ok() {
            return Ok(());
        }
        std::os::unix::fs::symlink(&self.skills_dir, &link).map_err(|e| FsError::io(&link, e))
    }

    /// Remove the skills symlink after a run. The symlink itself is unlinked,
    /// never followed.
    pub fn remove_skills_symlink(&self, id: &str) -> Result<(), FsError> {
        let link = self.workspace_dir(id)?.join("skills");
        match link.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(&link).map_err(|e| FsError::io(&link, e))
            }
            _ => Ok(()),
        }
    }

    /// Parse `workspace/output.yaml` into a typed document. Missing or
    /// malformed output yields the default (status `failed`).
    pub fn parse_output(&self, id: &str) -> Result<OutputDoc, FsError> {
        let path = self.output_file(id)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no output.yaml for session {id}");
                return Ok(OutputDoc::default());
            }
            Err(e) => return Err(FsError::io(&path, e)),
        };
        match serde_yaml::from_str(&text) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                log::warn!("failed to parse output.yaml for session {id}: {e}");
                Ok(OutputDoc::default())
            }
        }
    }

    /// Resolve a workspace-relative file path, rejecting anything that would
    /// escape the workspace (absolute paths, `..`, or symlinks pointing out).
    pub fn resolve_workspace_file(&self, id: &str, rel: &str) -> Result<PathBuf, FsError> {
        let workspace = self
            .workspace_dir(id)?
            .canonicalize()
            .map_err(|e| FsError::io(&self.sessions_root.join(id), e))?;

        let normalized = rel.trim().trim_start_matches('/');
        let normalized = normalized.strip_prefix("./").unwrap_or(normalized);
        if normalized.is_empty()
            || Path::new(normalized)
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(FsError::PathEscape(rel.to_string()));
        }

        let candidate = workspace.join(normalized);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        if !resolved.starts_with(&workspace) {
            return Err(FsError::PathEscape(rel.to_string()));
        }
        Ok(resolved)
    }

    /// Remove a session directory. Used only by the two-phase creation
    /// rollback; sessions are never deleted once the store row exists.
    pub fn destroy(&self, id: &str) -> Result<(), FsError> {
        let dir = self.session_dir(id)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| FsError::io(&dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ID: &str = "20260105_123456_deadbeef";

    fn fixture() -> (tempfile::TempDir, SessionFs) {
        let dir = tempdir().unwrap();
        let skills = dir.path().join("skills");
        std::fs::create_dir_all(&skills).unwrap();
        let fs = SessionFs::new(dir.path().join("sessions"), skills);
        (dir, fs)
    }

    mod ids {
        use super::*;

        #[test]
        fn generated_ids_validate() {
            let id = generate_session_id();
            assert!(validate_session_id(&id).is_ok(), "bad id: {id}");
        }

        #[test]
        fn generated_ids_are_unique() {
            assert_ne!(generate_session_id(), generate_session_id());
        }

        #[test]
        fn rejects_traversal_shapes() {
            for bad in [
                "",
                "../etc",
                "20260105_123456_deadbeef/..",
                "20260105-123456-deadbeef",
                "20260105_123456_DEADBEEF",
                "20260105_123456_dead",
                "x/20260105_123456_deadbeef",
            ] {
                assert!(validate_session_id(bad).is_err(), "accepted {bad:?}");
            }
        }
    }

    mod layout {
        use super::*;

        #[test]
        fn create_builds_workspace() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            assert!(fs.workspace_dir(ID).unwrap().is_dir());
        }

        #[test]
        fn paths_stay_under_root() {
            let (_dir, fs) = fixture();
            let dir = fs.session_dir(ID).unwrap();
            assert!(dir.starts_with(fs.sessions_root()));
            assert!(fs.log_file(ID).unwrap().ends_with("agent.jsonl"));
            assert!(fs
                .output_file(ID)
                .unwrap()
                .ends_with("workspace/output.yaml"));
        }

        #[test]
        fn invalid_id_never_joins() {
            let (_dir, fs) = fixture();
            assert!(matches!(
                fs.session_dir("../../etc"),
                Err(FsError::InvalidSessionId(_))
            ));
        }

        #[test]
        fn skills_symlink_install_and_remove() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            fs.install_skills_symlink(ID).unwrap();
            let link = fs.workspace_dir(ID).unwrap().join("skills");
            assert!(link.symlink_metadata().unwrap().file_type().is_symlink());

            // Idempotent install, then removal unlinks without touching the target.
            fs.install_skills_symlink(ID).unwrap();
            fs.remove_skills_symlink(ID).unwrap();
            assert!(link.symlink_metadata().is_err());
        }

        #[test]
        fn info_mirror_roundtrips() {
            use crate::events::TokenUsage;
            use crate::session::{SessionInfo, SessionStatus};

            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            assert!(fs.read_info(ID).unwrap().is_none());

            let info = SessionInfo {
                session_id: ID.to_string(),
                status: SessionStatus::Complete,
                working_dir: "/w".to_string(),
                model: Some("m".to_string()),
                resume_id: Some("conv-1".to_string()),
                num_turns: 3,
                cumulative_usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                created_at: chrono::Utc::now(),
            };
            fs.write_info(ID, &info).unwrap();

            let read = fs.read_info(ID).unwrap().unwrap();
            assert_eq!(read.session_id, ID);
            assert_eq!(read.cumulative_usage.input_tokens, 10);
            assert_eq!(read.resume_id.as_deref(), Some("conv-1"));
        }

        #[test]
        fn malformed_info_mirror_reads_as_absent() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            std::fs::write(fs.info_file(ID).unwrap(), "not json").unwrap();
            assert!(fs.read_info(ID).unwrap().is_none());
        }

        #[test]
        fn destroy_removes_tree() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            fs.destroy(ID).unwrap();
            assert!(!fs.session_dir(ID).unwrap().exists());
        }
    }

    mod output {
        use super::*;

        #[test]
        fn parses_full_document() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            std::fs::write(
                fs.output_file(ID).unwrap(),
                "output: hello\nstatus: complete\nresult_files:\n  - out.yaml\n",
            )
            .unwrap();
            let doc = fs.parse_output(ID).unwrap();
            assert_eq!(doc.output, "hello");
            assert_eq!(doc.status, "complete");
            assert_eq!(doc.result_files, vec!["out.yaml"]);
        }

        #[test]
        fn missing_file_yields_failed_default() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            let doc = fs.parse_output(ID).unwrap();
            assert_eq!(doc.status, "failed");
            assert!(doc.output.is_empty());
        }

        #[test]
        fn malformed_yaml_yields_failed_default() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            std::fs::write(fs.output_file(ID).unwrap(), ":\n  - [").unwrap();
            let doc = fs.parse_output(ID).unwrap();
            assert_eq!(doc.status, "failed");
        }
    }

    mod workspace_files {
        use super::*;

        #[test]
        fn resolves_relative_file() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            let file = fs.workspace_dir(ID).unwrap().join("out.txt");
            std::fs::write(&file, "data").unwrap();
            let resolved = fs.resolve_workspace_file(ID, "./out.txt").unwrap();
            assert_eq!(resolved, file.canonicalize().unwrap());
        }

        #[test]
        fn rejects_parent_traversal() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            assert!(matches!(
                fs.resolve_workspace_file(ID, "../session_info.json"),
                Err(FsError::PathEscape(_))
            ));
        }

        #[test]
        fn rejects_symlink_escape() {
            let (dir, fs) = fixture();
            fs.create(ID).unwrap();
            let outside = dir.path().join("secret.txt");
            std::fs::write(&outside, "secret").unwrap();
            let link = fs.workspace_dir(ID).unwrap().join("leak");
            std::os::unix::fs::symlink(&outside, &link).unwrap();
            assert!(matches!(
                fs.resolve_workspace_file(ID, "leak"),
                Err(FsError::PathEscape(_))
            ));
        }

        #[test]
        fn missing_file_is_not_found() {
            let (_dir, fs) = fixture();
            fs.create(ID).unwrap();
            assert!(matches!(
                fs.resolve_workspace_file(ID, "nope.txt"),
                Err(FsError::NotFound(_))
            ));
        }
    }
}
