//! Records the coder appends to its per-session log files.
//!
//! One JSON object per line under `~/.claude/projects/<encoded>/<id>.jsonl`.
//! The inner `message` field has drifted across coder releases, so
//! [`StoredMessage::text_content`] tries several shapes before giving up;
//! consumers should treat every accessor as best-effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "parentUuid")]
    pub parent_uuid: String,
    #[serde(default, rename = "sessionId")]
    pub session_id: String,

    /// One of: user, assistant, system, summary, result, error.
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Raw inner message; shape varies by record kind and coder version.
    #[serde(default)]
    pub message: Value,

    #[serde(default, rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(default, rename = "durationMs")]
    pub duration_ms: i64,

    /// Summary records only.
    #[serde(default)]
    pub summary: String,
    #[serde(default, rename = "leafUuid")]
    pub leaf_uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredToolUse {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl StoredMessage {
    pub fn model(&self) -> Option<String> {
        if self.kind != "assistant" {
            return None;
        }
        self.message
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(String::from)
    }

    pub fn role(&self) -> String {
        if let Some(role) = self.message.get("role").and_then(Value::as_str) {
            if !role.is_empty() {
                return role.to_string();
            }
        }
        self.kind.clone()
    }

    /// First usable text in the record, across the formats the coder has
    /// used: a content-block array, a plain `content`/`text` string, an
    /// array of strings, or a bare JSON string.
    pub fn text_content(&self) -> String {
        let message = &self.message;
        if message.is_null() {
            return String::new();
        }

        if let Some(blocks) = message.get("content").and_then(Value::as_array) {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    Value::String(text) if !text.is_empty() => texts.push(text.clone()),
                    Value::Object(map) => {
                        let is_text = map.get("type").and_then(Value::as_str) == Some("text");
                        if is_text {
                            if let Some(text) = map.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    texts.push(text.to_string());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }

        for key in ["content", "text"] {
            if let Some(text) = message.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }

        if let Some(text) = message.as_str() {
            return text.to_string();
        }

        String::new()
    }

    pub fn tool_uses(&self) -> Vec<StoredToolUse> {
        let Some(blocks) = self.message.get("content").and_then(Value::as_array) else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter_map(|block| serde_json::from_value(block.clone()).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_record() {
        let line = r#"{
            "uuid": "u2", "parentUuid": "u1", "sessionId": "s1",
            "type": "assistant",
            "timestamp": "2026-03-01T10:00:00Z",
            "costUSD": 0.012, "durationMs": 2300,
            "message": {
                "role": "assistant", "model": "sonnet",
                "content": [
                    {"type": "text", "text": "done"},
                    {"type": "tool_use", "name": "Write", "input": {"file_path": "a.txt"}}
                ]
            }
        }"#;

        let record: StoredMessage = serde_json::from_str(line).expect("parse");
        assert_eq!(record.kind, "assistant");
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.model().as_deref(), Some("sonnet"));
        assert_eq!(record.text_content(), "done");
        assert_eq!(record.role(), "assistant");
        let tools = record.tool_uses();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "Write");
        assert!((record.cost_usd - 0.012).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_summary_record() {
        let line = r#"{"type":"summary","summary":"Add dark mode toggle","leafUuid":"u9"}"#;
        let record: StoredMessage = serde_json::from_str(line).expect("parse");
        assert_eq!(record.kind, "summary");
        assert_eq!(record.summary, "Add dark mode toggle");
        assert!(record.timestamp.is_none());
    }

    #[test]
    fn text_content_handles_plain_string_content() {
        let record: StoredMessage = serde_json::from_str(
            r#"{"type":"user","message":{"role":"user","content":"fix the login bug"}}"#,
        )
        .expect("parse");
        assert_eq!(record.text_content(), "fix the login bug");
        assert_eq!(record.role(), "user");
    }

    #[test]
    fn text_content_joins_mixed_array() {
        let record: StoredMessage = serde_json::from_str(
            r#"{"type":"user","message":{"content":["first", {"type":"text","text":"second"}]}}"#,
        )
        .expect("parse");
        assert_eq!(record.text_content(), "first\nsecond");
    }

    #[test]
    fn text_content_empty_for_tool_only_records() {
        let record: StoredMessage = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#,
        )
        .expect("parse");
        assert!(record.text_content().is_empty());
        assert_eq!(record.tool_uses().len(), 1);
    }

    #[test]
    fn model_only_from_assistant_records() {
        let record: StoredMessage = serde_json::from_str(
            r#"{"type":"user","message":{"model":"sonnet","content":"hi"}}"#,
        )
        .expect("parse");
        assert!(record.model().is_none());
    }
}
