//! Script messages.
//!
//! Scripts report back through agent messages whose text is a JSON object.
//! The object's `type` field selects the variant; only `send`, `log` and
//! `error` are recognised, and anything else is rejected rather than guessed.

use serde::{Deserialize, Serialize};

use crate::agent::{kind, AgentMessage, ScriptId};
use crate::error::{Error, Result};

/// Longest excerpt of a bad message kept in the error.
const EXCERPT_LEN: usize = 120;

/// Severity of a script `console.*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A decoded message from a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Explicit `send(payload)` from the script.
    Send {
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Console output.
    Log { level: LogLevel, payload: String },
    /// Uncaught exception inside the script.
    #[serde(rename_all = "camelCase")]
    Error {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_number: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column_number: Option<u32>,
    },
}

impl Message {
    /// Classify the JSON text of a script message.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::MalformedAgentMessage(format!("{e} in {:?}", excerpt(text))))
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// A script message plus the binary data that came with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub script_id: ScriptId,
    pub message: Message,
    pub data: Option<Vec<u8>>,
}

impl ScriptMessage {
    /// Decode one raw agent message.
    ///
    /// Returns `None` for kinds other than script messages.
    pub fn decode(raw: AgentMessage) -> Option<Result<Self>> {
        if raw.kind != kind::SCRIPT {
            return None;
        }
        let message = match Message::parse(&raw.text) {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(Self {
            script_id: raw.script_id,
            message,
            data: raw.has_data.then_some(raw.data),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_message() {
        let msg = Message::parse(r#"{"type":"send","payload":"pong"}"#).unwrap();
        assert_eq!(msg, Message::Send { payload: json!("pong") });
    }

    #[test]
    fn send_with_structured_payload() {
        let msg = Message::parse(r#"{"type":"send","payload":{"count":3,"ok":true}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Send {
                payload: json!({"count": 3, "ok": true})
            }
        );
    }

    #[test]
    fn log_message() {
        let msg = Message::parse(
            r#"{"type":"log","level":"warning","payload":"Logged warning message!"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::Log {
                level: LogLevel::Warning,
                payload: "Logged warning message!".into()
            }
        );
    }

    #[test]
    fn error_message_with_location() {
        let text = r#"{
            "type": "error",
            "description": "Error: Intentional script failure error",
            "stack": "Error: Intentional script failure error\n    at <eval> (/script1.js:1)",
            "fileName": "/script1.js",
            "lineNumber": 1,
            "columnNumber": 1
        }"#;
        match Message::parse(text).unwrap() {
            Message::Error {
                description,
                file_name,
                line_number,
                column_number,
                stack,
            } => {
                assert_eq!(description, "Error: Intentional script failure error");
                assert_eq!(file_name.as_deref(), Some("/script1.js"));
                assert_eq!(line_number, Some(1));
                assert_eq!(column_number, Some(1));
                assert!(stack.unwrap().contains("<eval>"));
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn error_message_serializes_camel_case() {
        let msg = Message::Error {
            description: "boom".into(),
            stack: None,
            file_name: Some("/a.js".into()),
            line_number: Some(2),
            column_number: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "description": "boom", "fileName": "/a.js", "lineNumber": 2})
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = Message::parse(r#"{"type":"telemetry","payload":1}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedAgentMessage(_)));
    }

    #[test]
    fn non_json_is_malformed() {
        let err = Message::parse("not json at all").unwrap_err();
        assert!(matches!(err, Error::MalformedAgentMessage(_)));
    }

    #[test]
    fn excerpt_is_char_safe() {
        let long = "é".repeat(500);
        assert_eq!(excerpt(&long).chars().count(), EXCERPT_LEN);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn debugger_messages_are_skipped() {
        let raw = AgentMessage {
            kind: kind::DEBUGGER,
            script_id: ScriptId(1),
            text: "{}".into(),
            has_data: false,
            data: Vec::new(),
        };
        assert!(ScriptMessage::decode(raw).is_none());
    }

    #[test]
    fn binary_data_passes_through() {
        let raw = AgentMessage::script(
            ScriptId(4),
            r#"{"type":"send","payload":null}"#.into(),
            Some(b"buffer"),
        );
        let decoded = ScriptMessage::decode(raw).unwrap().unwrap();
        assert_eq!(decoded.script_id, ScriptId(4));
        assert_eq!(decoded.data.as_deref(), Some(&b"buffer"[..]));

        let without = AgentMessage::script(ScriptId(4), r#"{"type":"send","payload":1}"#.into(), None);
        assert!(ScriptMessage::decode(without).unwrap().unwrap().data.is_none());
    }
}
