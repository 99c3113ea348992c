//! Coder execution handlers: prompt, choice, approval flow, reprompts and
//! execution-mode settings.

use crate::daemon::{ConversationState, Daemon};
use finn_config::DiffApprovalMode;
use finn_core::{
    msg, ApprovalPayload, ChoicePayload, DiffApprovedPayload, DiffContextEntry, PromptPayload,
    RepromptPayload, SettingsUpdatePayload,
};
use finn_coder::session::CoderSession;
use finn_git::Repository;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_COMMIT_MESSAGE: &str = "Apply changes via Finn";

/// Starts (or resumes) a coder run for a conversation.
pub async fn handle_prompt(daemon: &Arc<Daemon>, payload: Value) {
    let payload: PromptPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse prompt payload: {err}");
            return;
        }
    };
    info!(
        event = "prompt",
        conversation_id = %payload.conversation_id,
        folder_id = %payload.folder_id
    );

    let Some(folder) = daemon.resolve_folder(&payload.folder_id, None).await else {
        daemon
            .send_error(&payload.conversation_id, "Folder not found or not approved")
            .await;
        return;
    };

    if !finn_coder::is_installed() {
        daemon
            .send_error(
                &payload.conversation_id,
                "Coder CLI not installed. Please install it and sign in first.",
            )
            .await;
        return;
    }

    // A conversation whose turn has not reached its result yet cannot take
    // a second prompt.
    {
        let conversations = daemon.conversations.lock().await;
        if let Some(state) = conversations.get(&payload.conversation_id) {
            if state.turn_active {
                drop(conversations);
                daemon
                    .send_error(
                        &payload.conversation_id,
                        "A turn is already running for this conversation",
                    )
                    .await;
                return;
            }
        }
    }

    let (interactive, requires_approval) = {
        let cfg = daemon.cfg.lock().await;
        (
            cfg.execution_mode.interactive_mode,
            cfg.execution_mode.diff_approval_mode != DiffApprovalMode::AutoApprove,
        )
    };

    let on_event = daemon.coder_event_handler(&payload.conversation_id);
    let session = CoderSession::new(
        std::path::Path::new(&folder.path),
        requires_approval,
        on_event,
    );

    // Link the client's conversation id with the coder's own session id
    // once the new log file shows up.
    {
        let weak = daemon.weak.clone();
        let conversation_id = payload.conversation_id.clone();
        let folder_id = folder.id.clone();
        session
            .set_session_linked_handler(Arc::new(move |session_id| {
                let Some(daemon) = weak.upgrade() else { return };
                let conversation_id = conversation_id.clone();
                let folder_id = folder_id.clone();
                tokio::spawn(async move {
                    daemon
                        .send(
                            msg::SESSION_LINKED,
                            serde_json::json!({
                                "conversation_id": conversation_id,
                                "session_id": session_id,
                                "folder_id": folder_id,
                            }),
                        )
                        .await;
                });
            }))
            .await;
    }

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
                turn_active: true,
            },
        )
    };
    if let Some(old) = replaced {
        old.session.stop().await;
    }

    let result = if let Some(session_id) = payload.session_id.as_deref() {
        session.resume_session(session_id, &payload.text).await
    } else if interactive {
        session.execute_task(&payload.text).await
    } else {
        session.execute_one_shot(&payload.text).await
    };

    if let Err(err) = result {
        warn!("coder start failed: {err}");
        daemon.send_error(&payload.conversation_id, &err.to_string()).await;
        daemon.conversations.lock().await.remove(&payload.conversation_id);
    }
}

/// Relays a user's decision back into the coder's stdin.
pub async fn handle_choice(daemon: &Arc<Daemon>, payload: Value) {
    let payload: ChoicePayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse choice payload: {err}");
            return;
        }
    };
    info!(
        event = "choice",
        conversation_id = %payload.conversation_id,
        selected = %payload.selected_id
    );

    let session = {
        let conversations = daemon.conversations.lock().await;
        conversations
            .get(&payload.conversation_id)
            .map(|state| state.session.clone())
    };
    let Some(session) = session else {
        daemon
            .send_error(&payload.conversation_id, "No active task for this conversation")
            .await;
        return;
    };

    let message = if payload.decision_type.as_deref() == Some("plan_approval") {
        if payload.selected_id == "approve" {
            "Yes, proceed with the plan".to_string()
        } else {
            "No, let me suggest some changes".to_string()
        }
    } else {
        format!("I choose option {}", payload.selected_id)
    };

    if let Err(err) = session.send_message(&message).await {
        daemon
            .send_error(
                &payload.conversation_id,
                &format!("Failed to send choice: {err}"),
            )
            .await;
    }
}

/// All-or-nothing verdict on a turn's diff set: commit everything or
/// discard the conversation's files. Either way the conversation ends.
pub async fn handle_approval(daemon: &Arc<Daemon>, payload: Value) {
    let payload: ApprovalPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse approval payload: {err}");
            return;
        }
    };

    let state = {
        let mut conversations = daemon.conversations.lock().await;
        conversations.remove(&payload.conversation_id)
    };
    let Some(state) = state else {
        daemon
            .send_error(
                &payload.conversation_id,
                "Conversation has expired. Please restart the task.",
            )
            .await;
        return;
    };

    let repo = Repository::new(&state.folder_path);

    if payload.approved {
        let commit_message = payload
            .commit_message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string());
        info!(
            event = "approval_commit",
            conversation_id = %payload.conversation_id,
            files = state.files.len()
        );
        // Commit through the session so the turn's complete event fires
        // with it.
        if let Err(err) = state.session.continue_after_approval(&commit_message).await {
            daemon
                .send_error(
                    &payload.conversation_id,
                    &format!("Failed to commit: {err}"),
                )
                .await;
            return;
        }
        crate::git_sync::send_commit_success(
            daemon,
            &payload.conversation_id,
            &state.folder_id,
            &repo,
        )
        .await;
    } else {
        info!(
            event = "approval_discard",
            conversation_id = %payload.conversation_id,
            files = state.files.len()
        );
        let mut failed = Vec::new();
        for file in &state.files {
            if let Err(err) = repo.discard_file(file).await {
                warn!("failed to discard {file}: {err}");
                failed.push(file.clone());
            }
        }
        if !failed.is_empty() {
            daemon
                .send_error(
                    &payload.conversation_id,
                    &format!("Failed to discard some files: {failed:?}"),
                )
                .await;
        }
    }

    state.session.stop().await;
}

/// Per-file approval. When the last pending file is approved the session
/// commits and fires the turn's complete event.
pub async fn handle_diff_approved(daemon: &Arc<Daemon>, payload: Value) {
    let payload: DiffApprovedPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse diff_approved payload: {err}");
            return;
        }
    };

    let ready = {
        let mut conversations = daemon.conversations.lock().await;
        let Some(state) = conversations.get_mut(&payload.conversation_id) else {
            warn!(
                "diff approval for unknown conversation {}",
                payload.conversation_id
            );
            return;
        };
        state.pending_diffs.insert(payload.file_path.clone(), true);
        let approved = state.pending_diffs.values().filter(|v| **v).count();
        info!(
            event = "diff_approved",
            conversation_id = %payload.conversation_id,
            file = %payload.file_path,
            approved = approved,
            total = state.total_diffs
        );
        if approved >= state.total_diffs {
            Some(state.session.clone())
        } else {
            None
        }
    };

    if let Some(session) = ready {
        if let Err(err) = session.continue_after_approval(DEFAULT_COMMIT_MESSAGE).await {
            daemon
                .send_error(
                    &payload.conversation_id,
                    &format!("Failed to continue: {err}"),
                )
                .await;
            return;
        }
        // Every file is approved and committed; the conversation is done.
        let removed = {
            let mut conversations = daemon.conversations.lock().await;
            conversations.remove(&payload.conversation_id)
        };
        if let Some(state) = removed {
            let repo = Repository::new(&state.folder_path);
            crate::git_sync::send_commit_success(
                daemon,
                &payload.conversation_id,
                &state.folder_id,
                &repo,
            )
            .await;
            state.session.stop().await;
        }
    }
}

/// A revision request: the previous diffs come back as context for a fresh
/// coder run in the same conversation.
pub async fn handle_reprompt(daemon: &Arc<Daemon>, payload: Value) {
    let payload: RepromptPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse reprompt payload: {err}");
            return;
        }
    };
    info!(event = "reprompt", conversation_id = %payload.conversation_id);

    let folder = {
        let conversations = daemon.conversations.lock().await;
        conversations
            .get(&payload.conversation_id)
            .map(|state| (state.folder_id.clone(), state.folder_path.clone()))
    };
    let Some((folder_id, folder_path)) = folder else {
        daemon
            .send_error(&payload.conversation_id, "Conversation not found")
            .await;
        return;
    };

    let requires_approval = {
        let cfg = daemon.cfg.lock().await;
        cfg.execution_mode.diff_approval_mode != DiffApprovalMode::AutoApprove
    };

    let prompt = build_reprompt(&payload.reprompt_text, &payload.diff_context);

    let on_event = daemon.coder_event_handler(&payload.conversation_id);
    let session = CoderSession::new(&folder_path, requires_approval, on_event);

    let replaced = {
        let mut conversations = daemon.conversations.lock().await;
        conversations.insert(
            payload.conversation_id.clone(),
            ConversationState {
                session: session.clone(),
                folder_id,
                folder_path,
                pending_diffs: HashMap::new(),
                total_diffs: 0,
                files: Vec::new(),
                turn_active: true,
            },
        )
    };
    if let Some(old) = replaced {
        old.session.stop().await;
    }

    if let Err(err) = session.execute_task(&prompt).await {
        warn!("reprompt start failed: {err}");
        daemon.send_error(&payload.conversation_id, &err.to_string()).await;
        daemon.conversations.lock().await.remove(&payload.conversation_id);
    }
}

pub async fn handle_settings_update(daemon: &Arc<Daemon>, payload: Value) {
    let payload: SettingsUpdatePayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to parse settings_update payload: {err}");
            return;
        }
    };

    let mode = match payload.diff_approval_mode.as_str() {
        "show-all" => DiffApprovalMode::ShowAll,
        "show-on-error" => DiffApprovalMode::ShowOnError,
        "auto-approve" => DiffApprovalMode::AutoApprove,
        other => {
            warn!("unknown diff approval mode {other}");
            return;
        }
    };

    let mut cfg = daemon.cfg.lock().await;
    cfg.execution_mode.interactive_mode = payload.interactive_mode;
    cfg.execution_mode.diff_approval_mode = mode;
    if let Err(err) = cfg.save() {
        warn!("failed to save settings: {err}");
        return;
    }
    info!(
        event = "settings_updated",
        interactive = payload.interactive_mode,
        diff_mode = %payload.diff_approval_mode
    );
}

/// Folds a diff event into the conversation's approval bookkeeping.
pub async fn track_diff_event(daemon: &Daemon, conversation_id: &str, content: &Value) {
    let mut conversations = daemon.conversations.lock().await;
    let Some(state) = conversations.get_mut(conversation_id) else {
        return;
    };

    if let Some(diffs) = content.get("diffs").and_then(Value::as_object) {
        for file_path in diffs.keys() {
            if !state.pending_diffs.contains_key(file_path) {
                state.pending_diffs.insert(file_path.clone(), false);
                state.total_diffs += 1;
                state.files.push(file_path.clone());
            }
        }
    }
    // Single-file shape, kept for older clients.
    if let Some(file_path) = content.get("file_path").and_then(Value::as_str) {
        if !file_path.is_empty() && !state.pending_diffs.contains_key(file_path) {
            state.pending_diffs.insert(file_path.to_string(), false);
            state.total_diffs += 1;
            state.files.push(file_path.to_string());
        }
    }
}

fn build_reprompt(reprompt_text: &str, diffs: &[DiffContextEntry]) -> String {
    let mut prompt = format!(
        "You just made some changes to the codebase. The user reviewed them \
         and wants you to make adjustments.\n\nUser's feedback: \"{reprompt_text}\"\n\n\
         Here are the changes you made:\n\n"
    );
    for entry in diffs {
        prompt.push_str(&format!(
            "File: {}\n```diff\n{}\n```\n\n",
            entry.file_path, entry.diff
        ));
    }
    prompt.push_str("Please revise the changes based on the user's feedback.");
    prompt
}
