//! Coder session orchestration.
//!
//! The coder is an external CLI spawned per conversation with line-delimited
//! JSON on stdin and stdout. This crate owns everything about that boundary:
//! the stream protocol ([`stream`]), the on-disk session-log records it
//! writes under its home directory ([`stored`]), decision extraction from
//! its prose ([`decision`]), and the long-lived interactive session state
//! machine ([`session`]). Nothing outside this crate parses coder output.

pub mod decision;
pub mod session;
pub mod stored;
pub mod stream;

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// The coder executable. Authentication is the user's own CLI session; the
/// daemon never handles coder credentials.
pub const CODER_BIN: &str = "claude";

/// Marker separating the execution preamble from the user's actual request;
/// the watcher strips everything up to it when deriving session titles.
pub const USER_REQUEST_MARKER: &str = "User request:";

#[derive(Debug, Error)]
pub enum CoderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("coder not running")]
    NotRunning,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("coder reported: {0}")]
    Reported(String),
    #[error("git error: {0}")]
    Git(#[from] finn_git::GitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Thinking,
    ToolUse,
    Decision,
    Diff,
    Usage,
    Complete,
    Error,
}

/// One event interpreted from the coder's stream, ready to forward to
/// remote clients. `content` is the wire payload minus the conversation id,
/// which the router adds.
#[derive(Debug, Clone)]
pub struct CoderEvent {
    pub kind: EventKind,
    pub content: Value,
}

impl CoderEvent {
    pub fn new(kind: EventKind, content: Value) -> Self {
        Self { kind, content }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, serde_json::json!({ "message": message.into() }))
    }
}

pub type EventHandler = Arc<dyn Fn(CoderEvent) + Send + Sync>;
pub type SessionLinkedHandler = Arc<dyn Fn(String) + Send + Sync>;

pub fn is_installed() -> bool {
    which(CODER_BIN)
}

fn which(binary: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

/// Root of the coder's per-project session logs: `~/.claude/projects`.
pub fn sessions_root() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".claude").join("projects"))
}

/// The coder encodes a project path into a directory name by replacing
/// every `/` with `-`, leading slash included.
pub fn encode_project_path(path: &str) -> String {
    path.replace('/', "-")
}

/// Inverse of [`encode_project_path`] for absolute paths.
pub fn decode_project_path(encoded: &str) -> String {
    let trimmed = encoded.strip_prefix('-').unwrap_or(encoded);
    format!("/{}", trimmed.replace('-', "/"))
}
