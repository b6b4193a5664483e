//! Bus frame types.
//!
//! Every frame is a JSON object tagged by `type`. Method calls carry a
//! `serial` chosen by the sender; replies and errors point back at it with
//! `reply_serial`. Arguments are positional.
//!
//! This is a JSON rendering of D-Bus call semantics, not D-Bus wire format.

use serde::{Deserialize, Serialize};

/// Positional arguments of a call, or positional values of a reply.
pub type Body = Vec<serde_json::Value>;

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Invoke `member` of `interface` on the object at `path`.
    MethodCall {
        serial: u32,
        path: String,
        interface: String,
        member: String,
        #[serde(default)]
        body: Body,
        /// The sender does not want a reply.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        no_reply: bool,
    },
    /// Successful reply to a method call.
    MethodReturn {
        reply_serial: u32,
        #[serde(default)]
        body: Body,
    },
    /// Structured failure reply to a method call.
    Error {
        reply_serial: u32,
        name: String,
        #[serde(default)]
        message: String,
    },
    /// Unsolicited notification; never replied to.
    Signal {
        path: String,
        interface: String,
        member: String,
        #[serde(default)]
        body: Body,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_call_serializes_with_tag() {
        let frame = Frame::MethodCall {
            serial: 7,
            path: "/re/frida/HostSession".into(),
            interface: "re.frida.HostSession17".into(),
            member: "Attach".into(),
            body: vec![json!(1234), json!([])],
            no_reply: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "method_call");
        assert_eq!(value["serial"], 7);
        assert!(value.get("no_reply").is_none());
    }

    #[test]
    fn error_frame_message_defaults_empty() {
        let frame = Frame::decode(br#"{"type":"error","reply_serial":3,"name":"x.Error"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                reply_serial: 3,
                name: "x.Error".into(),
                message: String::new(),
            }
        );
    }

    #[test]
    fn unknown_frame_type_fails() {
        assert!(Frame::decode(br#"{"type":"hello"}"#).is_err());
    }
}
