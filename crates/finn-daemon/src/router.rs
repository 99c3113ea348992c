//! Inbound message dispatch.
//!
//! Every decoded control-channel frame lands here. Unknown types are
//! logged and dropped; handler failures are the handler's problem and
//! never tear down the router.

use crate::daemon::Daemon;
use crate::{execution, folders, git_sync, preview, sessions};
use finn_core::{msg, Envelope, PresencePayload, RelayErrorPayload};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn handle_message(daemon: &Arc<Daemon>, envelope: Envelope) {
    if envelope.kind != msg::PRESENCE {
        debug!("handling message type {}", envelope.kind);
    }

    match envelope.kind.as_str() {
        // Coder execution
        msg::PROMPT => execution::handle_prompt(daemon, envelope.payload).await,
        msg::CHOICE => execution::handle_choice(daemon, envelope.payload).await,
        msg::APPROVAL => execution::handle_approval(daemon, envelope.payload).await,
        msg::DIFF_APPROVED => execution::handle_diff_approved(daemon, envelope.payload).await,
        msg::REPROMPT => execution::handle_reprompt(daemon, envelope.payload).await,
        msg::SETTINGS_UPDATE => execution::handle_settings_update(daemon, envelope.payload).await,

        // Folder management
        msg::FOLDER_SYNC => daemon.send_folder_list().await,
        msg::FOLDER_ADD_REQUEST => folders::handle_folder_add(daemon, envelope.payload).await,
        msg::FOLDER_REMOVE_REQUEST => folders::handle_folder_remove(daemon, envelope.payload).await,
        msg::FOLDER_SELECT => folders::handle_folder_select(daemon, envelope.payload).await,
        msg::BROWSE_FOLDERS => folders::handle_browse_folders(daemon, envelope.payload).await,

        // Git
        msg::GIT_INIT => git_sync::handle_git_init(daemon, envelope.payload).await,
        msg::GET_COMMITS => git_sync::handle_get_commits(daemon, envelope.payload).await,
        msg::GET_COMMIT_DETAIL => {
            git_sync::handle_get_commit_detail(daemon, envelope.payload).await
        }
        msg::REQUEST_COMMIT_SYNC => {
            git_sync::handle_request_commit_sync(daemon, envelope.payload).await
        }

        // Sessions
        msg::RESUME_SESSION => sessions::handle_resume_session(daemon, envelope.payload).await,
        msg::GET_EXTERNAL_SESSIONS => sessions::handle_get_external_sessions(daemon).await,
        msg::GET_SESSION_MESSAGES => {
            sessions::handle_get_session_messages(daemon, envelope.payload).await
        }

        // Live preview
        msg::PREVIEW_START => preview::handle_preview_start(daemon, envelope.payload).await,
        msg::PREVIEW_STOP => preview::handle_preview_stop(daemon, envelope.payload).await,

        // Server-originated
        msg::ERROR => handle_relay_error(envelope.payload),
        msg::PRESENCE => handle_presence(daemon, envelope.payload),

        other => info!("unknown message type: {other}"),
    }
}

fn handle_relay_error(payload: serde_json::Value) {
    let Ok(payload) = serde_json::from_value::<RelayErrorPayload>(payload) else {
        warn!("relay error with unparseable payload");
        return;
    };
    let message = if payload.error.is_empty() {
        payload.message
    } else {
        payload.error
    };
    if payload.code == "rate_limit" {
        warn!("rate limited by relay: {message}");
    } else {
        warn!("relay error: {message} (code: {})", payload.code);
    }
}

/// Tracks which client kinds are online so watcher-initiated broadcasts
/// can be skipped when nobody is looking. Direct request/response traffic
/// is never suppressed.
fn handle_presence(daemon: &Arc<Daemon>, payload: serde_json::Value) {
    let Ok(payload) = serde_json::from_value::<PresencePayload>(payload) else {
        warn!("failed to parse presence payload");
        return;
    };
    let mut presence = daemon.presence.lock().expect("presence lock");
    match payload.device_type.as_str() {
        "mobile" => {
            if presence.mobile != payload.online {
                presence.mobile = payload.online;
                info!(event = "presence", device = "mobile", online = payload.online);
            }
        }
        "web" => {
            if presence.web != payload.online {
                presence.web = payload.online;
                info!(event = "presence", device = "web", online = payload.online);
            }
        }
        other => debug!("presence for unknown device type {other}"),
    }
}
