//! The coder's stdout protocol: one JSON object per line, top-level `type`
//! in {assistant, user, system, result, error}, with nested content blocks
//! for assistant output. Unknown fields are ignored so the daemon survives
//! protocol additions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub message: MessageBody,
    /// Result text on terminal `result` / `error` frames.
    #[serde(default)]
    pub result: String,
    /// Aggregated totals, present on `result` frames.
    #[serde(default)]
    pub usage: Option<UsageInfo>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Input shape of the coder's structured question tool.
#[derive(Debug, Clone, Deserialize)]
pub struct AskUserQuestionInput {
    #[serde(default)]
    pub questions: Vec<AskQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskQuestion {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<AskOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Input shape of the coder's plan-mode exit tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ExitPlanModeInput {
    #[serde(default)]
    pub plan: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_frame_with_mixed_blocks() {
        let line = r#"{
            "type": "assistant",
            "message": {
                "model": "sonnet",
                "stop_reason": "tool_use",
                "content": [
                    {"type": "text", "text": "Let me write that file."},
                    {"type": "tool_use", "name": "Write", "id": "tu_1",
                     "input": {"file_path": "a.txt", "content": "hi"}}
                ],
                "usage": {"input_tokens": 120, "output_tokens": 45}
            }
        }"#;

        let msg: StreamMessage = serde_json::from_str(line).expect("parse");
        assert_eq!(msg.kind, "assistant");
        assert_eq!(msg.message.content.len(), 2);
        assert_eq!(msg.message.content[0].kind, "text");
        assert_eq!(msg.message.content[1].name, "Write");
        assert_eq!(msg.message.usage.expect("usage").input_tokens, 120);
        assert_eq!(msg.message.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn parses_result_frame_with_aggregate_usage() {
        let line = r#"{
            "type": "result",
            "result": "done",
            "usage": {"input_tokens": 900, "output_tokens": 300},
            "total_cost_usd": 0.0421,
            "duration_ms": 15000
        }"#;

        let msg: StreamMessage = serde_json::from_str(line).expect("parse");
        assert_eq!(msg.kind, "result");
        assert_eq!(msg.usage.expect("usage").output_tokens, 300);
        assert!((msg.total_cost_usd - 0.0421).abs() < f64::EPSILON);
        assert!(msg.message.content.is_empty());
    }

    #[test]
    fn ask_user_question_input_decodes() {
        let input = serde_json::json!({
            "questions": [{
                "question": "Which database?",
                "header": "Storage",
                "options": [
                    {"label": "SQLite", "description": "file-backed"},
                    {"label": "Postgres", "description": "server"}
                ]
            }]
        });
        let parsed: AskUserQuestionInput = serde_json::from_value(input).expect("decode");
        assert_eq!(parsed.questions[0].options.len(), 2);
        assert_eq!(parsed.questions[0].header, "Storage");
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let msg: StreamMessage =
            serde_json::from_str(r#"{"type":"system","subtype":"init","session_id":"s1"}"#)
                .expect("parse");
        assert_eq!(msg.kind, "system");
        assert_eq!(msg.subtype, "init");
    }
}
