//! Wire protocol shared by the control channel and the preview tunnel.
//!
//! The relay speaks JSON text frames. Control-channel frames are an
//! [`Envelope`] whose `payload` stays opaque until a handler picks it apart;
//! tunnel frames are [`TunnelRequest`]/[`TunnelResponse`] pairs correlated by
//! id. Payload structs for every recognised message type live here so the
//! daemon, the transports and the tests agree on field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const DEVICE_TYPE_DESKTOP: &str = "desktop";

/// Message type strings carried in [`Envelope::kind`].
///
/// Inbound and outbound sets overlap; the router only dispatches on the
/// inbound ones and logs-and-drops anything it does not recognise.
pub mod msg {
    // Coder execution
    pub const PROMPT: &str = "prompt";
    pub const CHOICE: &str = "choice";
    pub const APPROVAL: &str = "approval";
    pub const DIFF_APPROVED: &str = "diff_approved";
    pub const REPROMPT: &str = "reprompt";
    pub const SETTINGS_UPDATE: &str = "settings_update";

    // Coder events (outbound)
    pub const THINKING: &str = "thinking";
    pub const TOOL_USE: &str = "tool_use";
    pub const DECISION: &str = "decision";
    pub const DIFF: &str = "diff";
    pub const USAGE: &str = "usage";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";
    pub const SESSION_LINKED: &str = "session_linked";

    // Folder management
    pub const FOLDER_SYNC: &str = "folder_sync";
    pub const FOLDER_ADD_REQUEST: &str = "folder_add_request";
    pub const FOLDER_REMOVE_REQUEST: &str = "folder_remove_request";
    pub const FOLDER_SELECT: &str = "folder_select";
    pub const BROWSE_FOLDERS: &str = "browse_folders";
    pub const FOLDER_RESPONSE: &str = "folder_response";
    pub const FOLDER_BROWSE_RESPONSE: &str = "folder_browse_response";
    pub const FOLDER_LIST: &str = "folder_list";

    // Git
    pub const GIT_INIT: &str = "git_init";
    pub const GIT_INIT_RESPONSE: &str = "git_init_response";
    pub const GET_COMMITS: &str = "get_commits";
    pub const COMMITS_LIST: &str = "commits_list";
    pub const GET_COMMIT_DETAIL: &str = "get_commit_detail";
    pub const COMMIT_DETAIL: &str = "commit_detail";
    pub const REQUEST_COMMIT_SYNC: &str = "request_commit_sync";
    pub const COMMIT_SYNC_COMPLETE: &str = "commit_sync_complete";
    pub const SYNC_COMMITS: &str = "sync_commits";
    pub const COMMIT_SUCCESS: &str = "commit_success";

    // Sessions
    pub const RESUME_SESSION: &str = "resume_session";
    pub const SESSION_RESUMED: &str = "session_resumed";
    pub const GET_EXTERNAL_SESSIONS: &str = "get_external_sessions";
    pub const EXTERNAL_SESSIONS_LIST: &str = "external_sessions_list";
    pub const EXTERNAL_SESSION_DETECTED: &str = "external_session_detected";
    pub const EXTERNAL_SESSION_UPDATED: &str = "external_session_updated";
    pub const EXTERNAL_SESSION_ENDED: &str = "external_session_ended";
    pub const GET_SESSION_MESSAGES: &str = "get_session_messages";
    pub const SESSION_MESSAGES: &str = "session_messages";

    // Live preview
    pub const PREVIEW_START: &str = "preview_start";
    pub const PREVIEW_STOP: &str = "preview_stop";
    pub const PREVIEW_READY: &str = "preview_ready";
    pub const PREVIEW_STATUS: &str = "preview_status";

    // Server-originated
    pub const PRESENCE: &str = "presence";
}

/// One control-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub user_id: String,
    pub device_type: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    /// Builds a desktop-originated frame. Payloads that fail to serialize
    /// collapse to `null`; every payload type in this crate is infallible to
    /// serialize, so that path only exists for caller-supplied maps.
    pub fn desktop(user_id: &str, kind: &str, payload: impl Serialize) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_type: DEVICE_TYPE_DESKTOP.to_string(),
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub conversation_id: String,
    pub folder_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoicePayload {
    pub conversation_id: String,
    pub selected_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub conversation_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffApprovedPayload {
    pub conversation_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffContextEntry {
    pub file_path: String,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepromptPayload {
    pub conversation_id: String,
    pub reprompt_text: String,
    #[serde(default)]
    pub diff_context: Vec<DiffContextEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsUpdatePayload {
    #[serde(rename = "interactiveMode")]
    pub interactive_mode: bool,
    #[serde(rename = "diffApprovalMode")]
    pub diff_approval_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderAddRequest {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRemoveRequest {
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSelectRequest {
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseFoldersRequest {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInitRequest {
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCommitsRequest {
    pub folder_id: String,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCommitDetailRequest {
    pub folder_id: String,
    pub commit_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCommitSync {
    #[serde(default)]
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSessionPayload {
    pub session_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub folder_id: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionMessagesPayload {
    pub session_id: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewStartPayload {
    pub folder_id: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewStopPayload {
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub device_type: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayErrorPayload {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// An HTTP request forwarded over the preview tunnel. Bodies travel as
/// base64 text inside the JSON frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serde adapter for byte bodies: base64 text on the wire, raw bytes in
/// memory. An absent or empty field decodes to an empty body.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_opaque_payload() {
        let envelope = Envelope::desktop(
            "user-1",
            msg::PROMPT,
            PromptPayload {
                conversation_id: "c1".into(),
                folder_id: "f1".into(),
                text: "add a README".into(),
                session_id: None,
            },
        );

        let raw = serde_json::to_string(&envelope).expect("serialize");
        assert!(raw.contains("\"type\":\"prompt\""));
        assert!(!raw.contains("session_id"), "absent optional must be omitted");

        let decoded: Envelope = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(decoded.kind, msg::PROMPT);
        assert_eq!(decoded.device_type, DEVICE_TYPE_DESKTOP);

        let payload: PromptPayload =
            serde_json::from_value(decoded.payload).expect("payload decode");
        assert_eq!(payload.conversation_id, "c1");
        assert!(payload.session_id.is_none());
    }

    #[test]
    fn tunnel_frames_carry_base64_bodies() {
        let request = TunnelRequest {
            id: "req-7".into(),
            method: "POST".into(),
            path: "/api/echo".into(),
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            body: b"hello tunnel".to_vec(),
        };

        let raw = serde_json::to_string(&request).expect("serialize");
        assert!(raw.contains("aGVsbG8gdHVubmVs"), "body must be base64 on the wire");

        let decoded: TunnelRequest = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(decoded.body, b"hello tunnel");
    }

    #[test]
    fn tunnel_request_tolerates_missing_body_and_headers() {
        let decoded: TunnelRequest =
            serde_json::from_str(r#"{"id":"1","method":"GET","path":"/"}"#).expect("deserialize");
        assert!(decoded.body.is_empty());
        assert!(decoded.headers.is_empty());
    }

    #[test]
    fn choice_payload_defaults_optional_fields() {
        let payload: ChoicePayload =
            serde_json::from_str(r#"{"conversation_id":"c1","selected_id":"approve"}"#)
                .expect("deserialize");
        assert!(payload.decision_type.is_none());
        assert!(!payload.remember);
    }
}
