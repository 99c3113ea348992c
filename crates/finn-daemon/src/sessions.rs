//! External coder-session surface: watcher wiring, session queries,
//! resume, and on-demand message reads.
//!
//! The watcher is a passive producer; its callbacks land here, get
//! enriched with folder ids, and go out on the control channel unless no
//! client is online to see them.

use crate::daemon::{ConversationState, Daemon};
use finn_core::{msg, GetSessionMessagesPayload, ResumeSessionPayload};
use finn_coder::session::CoderSession;
use finn_watcher::{SessionCallbacks, SessionInfo, SessionWatcher};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Daemon {
    pub fn init_session_watcher(&self) {
        let filter_weak = self.weak.clone();
        let new_weak = self.weak.clone();
        let updated_weak = self.weak.clone();
        let ended_weak = self.weak.clone();

        let callbacks = SessionCallbacks {
            on_new_session: Some(Arc::new(move |session| {
                if let Some(daemon) = new_weak.upgrade() {
                    tokio::spawn(async move {
                        daemon.broadcast_session(&session, msg::EXTERNAL_SESSION_DETECTED).await;
                    });
                }
            })),
            on_session_updated: Some(Arc::new(move |session| {
                if let Some(daemon) = updated_weak.upgrade() {
                    tokio::spawn(async move {
                        daemon.broadcast_session(&session, msg::EXTERNAL_SESSION_UPDATED).await;
                    });
                }
            })),
            on_session_end: Some(Arc::new(move |session_id| {
                if let Some(daemon) = ended_weak.upgrade() {
                    tokio::spawn(async move {
                        if !daemon.has_active_clients() {
                            return;
                        }
                        daemon
                            .send(
                                msg::EXTERNAL_SESSION_ENDED,
                                json!({ "session_id": session_id }),
                            )
                            .await;
                    });
                }
            })),
            // Only logs whose decoded project path is approved right now
            // are ever read.
            should_watch: Arc::new(move |project_path| {
                filter_weak
                    .upgrade()
                    .map(|daemon| daemon.is_path_approved(project_path))
                    .unwrap_or(false)
            }),
        };

        match SessionWatcher::new(callbacks) {
            Ok(watcher) => {
                watcher.start();
                *self.watcher.lock().expect("watcher lock") = Some(watcher);
            }
            Err(err) => warn!("failed to create session watcher: {err}"),
        }
    }

    /// Watcher-initiated broadcast; skipped when nobody is online.
    async fn broadcast_session(&self, session: &SessionInfo, kind: &str) {
        if !self.has_active_clients() {
            debug!(
                "session {} changed (no clients online, skipping broadcast)",
                session.session_id
            );
            return;
        }

        let folder_id = {
            let cfg = self.cfg.lock().await;
            cfg.folder_by_path(&session.project_path)
                .map(|f| f.id.clone())
                .unwrap_or_default()
        };

        // Sessions become resumable conversations, which need a repo to
        // diff against.
        if kind == msg::EXTERNAL_SESSION_DETECTED && !folder_id.is_empty() {
            let path = std::path::Path::new(&session.project_path);
            if let Err(err) = finn_git::ensure_git_repo(path).await {
                warn!("failed to ensure git repo: {err}");
            }
        }

        self.send(kind, session_payload(session, &folder_id)).await;
    }
}

pub async fn handle_get_external_sessions(daemon: &Arc<Daemon>) {
    let watcher = daemon.watcher.lock().expect("watcher lock").clone();
    let Some(watcher) = watcher else {
        warn!("session watcher not initialized");
        return;
    };

    let sessions = watcher.get_sessions();
    let path_to_id: HashMap<String, String> = {
        let cfg = daemon.cfg.lock().await;
        cfg.approved_folders
            .iter()
            .map(|f| (f.path.clone(), f.id.clone()))
            .collect()
    };

    let enriched: Vec<Value> = sessions
        .iter()
        .filter_map(|session| {
            path_to_id
                .get(&session.project_path)
                .map(|folder_id| session_payload(session, folder_id))
        })
        .collect();

    info!(
        event = "sessions_listed",
        sent = enriched.len(),
        total = sessions.len()
    );
    daemon
        .send(msg::EXTERNAL_SESSIONS_LIST, json!({ "sessions": enriched }))
        .await;
}

/// Batch announcement after a folder add discovered existing sessions.
pub async fn send_sessions_batch(daemon: &Arc<Daemon>, sessions: &[SessionInfo], project_path: &str) {
    if !daemon.has_active_clients() {
        debug!(
            "discovered {} sessions for {project_path} (no clients online)",
            sessions.len()
        );
        return;
    }

    let folder_id = {
        let cfg = daemon.cfg.lock().await;
        cfg.folder_by_path(project_path)
            .map(|f| f.id.clone())
            .unwrap_or_default()
    };

    let enriched: Vec<Value> = sessions
        .iter()
        .map(|session| session_payload(session, &folder_id))
        .collect();

    daemon
        .send(
            msg::EXTERNAL_SESSIONS_LIST,
            json!({
                "sessions": enriched,
                "folder_id": folder_id,
                "project_path": project_path,
                "batch_type": "folder_add",
            }),
        )
        .await;
}

/// Resumes an externally started session as a remote conversation.
pub async fn handle_resume_session(daemon: &Arc<Daemon>, payload: Value) {
    let payload: ResumeSessionPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse resume_session payload: {err}");
            return;
        }
    };
    info!(
        event = "resume_session",
        session_id = %payload.session_id,
        conversation_id = %payload.conversation_id
    );

    let Some(folder) = daemon
        .resolve_folder(&payload.folder_id, Some(&payload.project_path))
        .await
    else {
        daemon
            .send_error(&payload.conversation_id, "Folder not found or not approved")
            .await;
        return;
    };

    let requires_approval = {
        let cfg = daemon.cfg.lock().await;
        cfg.execution_mode.diff_approval_mode != finn_config::DiffApprovalMode::AutoApprove
    };

    let on_event = daemon.coder_event_handler(&payload.conversation_id);
    let session = CoderSession::new(
        std::path::Path::new(&folder.path),
        requires_approval,
        on_event,
    );

    let replaced = {
        let mut conversations = daemon.conversations.lock().await;
        conversations.insert(
            payload.conversation_id.clone(),
            ConversationState {
                session: session.clone(),
                folder_id: folder.id.clone(),
                folder_path: folder.path.clone().into(),
                pending_diffs: HashMap::new(),
                total_diffs: 0,
                files: Vec::new(),
                // An empty prompt resumes interactively without starting a
                // turn; the next prompt message opens one.
                turn_active: !payload.prompt.is_empty(),
            },
        )
    };
    if let Some(old) = replaced {
        old.session.stop().await;
    }

    if let Err(err) = session.resume_session(&payload.session_id, &payload.prompt).await {
        warn!("failed to resume session: {err}");
        daemon.send_error(&payload.conversation_id, &err.to_string()).await;
        daemon.conversations.lock().await.remove(&payload.conversation_id);
        return;
    }

    daemon
        .send(
            msg::SESSION_RESUMED,
            json!({
                "session_id": payload.session_id,
                "conversation_id": payload.conversation_id,
                "status": "resuming",
            }),
        )
        .await;
}

/// On-demand read of a session's stored messages, with consecutive tool
/// uses coalesced into synthetic system rows for display.
pub async fn handle_get_session_messages(daemon: &Arc<Daemon>, payload: Value) {
    let payload: GetSessionMessagesPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse get_session_messages payload: {err}");
            return;
        }
    };

    let watcher = daemon.watcher.lock().expect("watcher lock").clone();
    let Some(watcher) = watcher else {
        warn!("session watcher not initialized");
        return;
    };

    let messages = match watcher.get_messages(&payload.session_id) {
        Ok(messages) => messages,
        Err(err) => {
            daemon
                .send(
                    msg::SESSION_MESSAGES,
                    json!({
                        "session_id": payload.session_id,
                        "error": err.to_string(),
                    }),
                )
                .await;
            return;
        }
    };

    let total = messages.len();
    let mut windowed = messages;
    if payload.offset > 0 && payload.offset < windowed.len() {
        windowed.drain(..payload.offset);
    }
    if payload.limit > 0 && payload.limit < windowed.len() {
        windowed.truncate(payload.limit);
    }

    let display = render_messages(&windowed);

    daemon
        .send(
            msg::SESSION_MESSAGES,
            json!({
                "session_id": payload.session_id,
                "messages": display,
                "total_count": total,
                "offset": payload.offset,
                "has_more": false,
            }),
        )
        .await;
}

fn session_payload(session: &SessionInfo, folder_id: &str) -> Value {
    json!({
        "session_id": session.session_id,
        "project_path": session.project_path,
        "folder_id": folder_id,
        "title": session.title,
        "model": session.model,
        "message_count": session.message_count,
        "total_cost_usd": session.total_cost_usd,
        "last_activity": session.last_activity.to_rfc3339(),
        "is_active": session.is_recently_active(),
        "status": session.status().as_str(),
        "source": "coder_cli",
    })
}

/// Text rows pass through; runs of tool uses between them collapse into
/// one "Used: ..." system row.
fn render_messages(messages: &[finn_coder::stored::StoredMessage]) -> Vec<Value> {
    let mut rows = Vec::new();
    let mut pending_tools: Vec<String> = Vec::new();
    let mut last_tool_timestamp = None;

    let flush =
        |rows: &mut Vec<Value>, tools: &mut Vec<String>, ts: &Option<chrono::DateTime<chrono::Utc>>| {
            if tools.is_empty() {
                return;
            }
            let label = if tools.len() <= 3 {
                format!("Used: {}", tools.join(", "))
            } else {
                format!(
                    "Used: {} ... and {} more",
                    tools[..3].join(", "),
                    tools.len() - 3
                )
            };
            rows.push(json!({
                "uuid": format!("tools-{}", ts.map(|t| t.timestamp_millis()).unwrap_or_default()),
                "type": "system",
                "role": "system",
                "content": label,
                "timestamp": ts.map(|t| t.to_rfc3339()),
            }));
            tools.clear();
        };

    for message in messages {
        let tools = message.tool_uses();
        if !tools.is_empty() {
            for tool in tools {
                if !tool.name.is_empty() && !pending_tools.contains(&tool.name) {
                    pending_tools.push(tool.name);
                }
            }
            last_tool_timestamp = message.timestamp;
        }

        let content = message.text_content();
        if !content.is_empty() {
            flush(&mut rows, &mut pending_tools, &last_tool_timestamp);
            rows.push(json!({
                "uuid": message.uuid,
                "parent_uuid": message.parent_uuid,
                "type": message.kind,
                "role": message.role(),
                "content": content,
                "model": message.model(),
                "timestamp": message.timestamp.map(|t| t.to_rfc3339()),
                "cost_usd": message.cost_usd,
                "duration_ms": message.duration_ms,
            }));
        }
    }
    flush(&mut rows, &mut pending_tools, &last_tool_timestamp);

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use finn_coder::stored::StoredMessage;

    fn record(json: &str) -> StoredMessage {
        serde_json::from_str(json).expect("record")
    }

    #[test]
    fn tool_runs_collapse_into_one_system_row() {
        let messages = vec![
            record(r#"{"type":"user","uuid":"u1","message":{"role":"user","content":"do it"}}"#),
            record(
                r#"{"type":"assistant","uuid":"u2","timestamp":"2026-03-01T10:00:00Z",
                    "message":{"content":[{"type":"tool_use","name":"Write","input":{}}]}}"#,
            ),
            record(
                r#"{"type":"assistant","uuid":"u3","timestamp":"2026-03-01T10:00:01Z",
                    "message":{"content":[{"type":"tool_use","name":"Bash","input":{}},
                                          {"type":"tool_use","name":"Write","input":{}}]}}"#,
            ),
            record(r#"{"type":"assistant","uuid":"u4","message":{"content":[{"type":"text","text":"done"}]}}"#),
        ];

        let rows = render_messages(&messages);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["content"], "do it");
        assert_eq!(rows[1]["type"], "system");
        assert_eq!(rows[1]["content"], "Used: Write, Bash");
        assert_eq!(rows[2]["content"], "done");
    }

    #[test]
    fn many_tools_truncate_with_count() {
        let messages = vec![
            record(
                r#"{"type":"assistant","uuid":"u1","timestamp":"2026-03-01T10:00:00Z",
                    "message":{"content":[
                        {"type":"tool_use","name":"A","input":{}},
                        {"type":"tool_use","name":"B","input":{}},
                        {"type":"tool_use","name":"C","input":{}},
                        {"type":"tool_use","name":"D","input":{}},
                        {"type":"tool_use","name":"E","input":{}}]}}"#,
            ),
            record(r#"{"type":"assistant","uuid":"u2","message":{"content":[{"type":"text","text":"ok"}]}}"#),
        ];

        let rows = render_messages(&messages);
        assert_eq!(rows[0]["content"], "Used: A, B, C ... and 2 more");
    }

    #[test]
    fn trailing_tools_still_flush() {
        let messages = vec![record(
            r#"{"type":"assistant","uuid":"u1","timestamp":"2026-03-01T10:00:00Z",
                "message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#,
        )];
        let rows = render_messages(&messages);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"], "Used: Bash");
    }
}
