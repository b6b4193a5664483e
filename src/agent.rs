//! Agent session proxy.
//!
//! One agent session exists per attachment; it lives at a path derived from
//! the server-issued session id and manages the scripts loaded into that
//! process.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::bus::{reply_arg, BusConnection};
use crate::config::Interfaces;
use crate::error::Result;
use crate::transport::Body;
use crate::variant::{Variant, VariantDict};

/// Server-issued identifier of an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued identifier of a script within an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(pub u32);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind tag of a raw agent message.
pub mod kind {
    /// Message to or from a script.
    pub const SCRIPT: i32 = 1;
    /// Debugger traffic; never surfaced.
    pub const DEBUGGER: i32 = 2;
}

/// Raw agent message as carried by `PostMessages`.
///
/// On the wire this is the positional tuple `[kind, script_id, text,
/// has_data, data]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AgentMessageTuple", into = "AgentMessageTuple")]
pub struct AgentMessage {
    pub kind: i32,
    pub script_id: ScriptId,
    pub text: String,
    pub has_data: bool,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct AgentMessageTuple(i32, ScriptId, String, bool, Vec<u8>);

impl From<AgentMessageTuple> for AgentMessage {
    fn from(AgentMessageTuple(kind, script_id, text, has_data, data): AgentMessageTuple) -> Self {
        Self {
            kind,
            script_id,
            text,
            has_data,
            data,
        }
    }
}

impl From<AgentMessage> for AgentMessageTuple {
    fn from(m: AgentMessage) -> Self {
        Self(m.kind, m.script_id, m.text, m.has_data, m.data)
    }
}

impl AgentMessage {
    /// A script message carrying `text` and optional binary `data`.
    pub fn script(script_id: ScriptId, text: String, data: Option<&[u8]>) -> Self {
        Self {
            kind: kind::SCRIPT,
            script_id,
            text,
            has_data: data.is_some(),
            data: data.map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// JavaScript runtime to run a script in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    Default,
    Qjs,
    V8,
}

/// Options for `CreateScript`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOptions {
    pub name: Option<String>,
    pub runtime: Option<ScriptRuntime>,
}

impl ScriptOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            runtime: None,
        }
    }

    fn to_variant_dict(&self) -> VariantDict {
        let mut dict = VariantDict::new();
        if let Some(name) = &self.name {
            dict.push(("name".to_string(), Variant::string(name.clone())));
        }
        match self.runtime {
            Some(ScriptRuntime::Qjs) => dict.push(("runtime".to_string(), Variant::string("qjs"))),
            Some(ScriptRuntime::V8) => dict.push(("runtime".to_string(), Variant::string("v8"))),
            Some(ScriptRuntime::Default) | None => {}
        }
        dict
    }
}

/// Typed view of the remote agent session interface.
#[derive(Clone)]
pub struct AgentSession {
    bus: BusConnection,
    path: String,
    interface: String,
}

impl AgentSession {
    /// Bind to the agent session for `id`.
    pub fn new(bus: BusConnection, interfaces: &Interfaces, id: &SessionId) -> Self {
        Self {
            bus,
            path: Interfaces::agent_session_path(id),
            interface: interfaces.agent_session(),
        }
    }

    async fn call(&self, method: &str, args: Body) -> Result<Body> {
        self.bus.call(&self.path, &self.interface, method, args).await
    }

    pub async fn create_script(&self, source: &str, options: &ScriptOptions) -> Result<ScriptId> {
        let options = serde_json::to_value(options.to_variant_dict())?;
        let reply = self.call("CreateScript", vec![json!(source), options]).await?;
        let id = reply_arg("CreateScript", &reply, 0)?;
        debug!(path = %self.path, script = %id, "Script created");
        Ok(id)
    }

    pub async fn load_script(&self, id: ScriptId) -> Result<()> {
        self.call("LoadScript", vec![json!(id)]).await?;
        Ok(())
    }

    pub async fn destroy_script(&self, id: ScriptId) -> Result<()> {
        self.call("DestroyScript", vec![json!(id)]).await?;
        Ok(())
    }

    /// Deliver messages to scripts. One-way: no reply is awaited.
    pub fn post_messages(&self, messages: &[AgentMessage], batch_id: u32) -> Result<()> {
        let messages = serde_json::to_value(messages)?;
        self.bus
            .send(&self.path, &self.interface, "PostMessages", vec![messages, json!(batch_id)])
    }

    /// End the agent session (detach from the process).
    pub async fn close(&self) -> Result<()> {
        self.call("Close", Body::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::connected;
    use crate::transport::Frame;

    #[test]
    fn agent_message_is_a_positional_tuple() {
        let msg = AgentMessage::script(ScriptId(3), "\"ping\"".into(), Some(b"ab"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!([1, 3, "\"ping\"", true, [97, 98]]));

        let back: AgentMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn script_options_become_variant_dict() {
        let options = ScriptOptions {
            name: Some("hook".into()),
            runtime: Some(ScriptRuntime::V8),
        };
        let dict = options.to_variant_dict();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict[0], ("name".to_string(), Variant::string("hook")));
        assert!(ScriptOptions::default().to_variant_dict().is_empty());
    }

    #[tokio::test]
    async fn create_script_returns_id() {
        let (bus, mut server) = connected();
        let agent = AgentSession::new(bus, &Interfaces::default(), &SessionId("s1".into()));

        let call = tokio::spawn(async move {
            agent
                .create_script("send('hi')", &ScriptOptions::default())
                .await
        });

        match server.next_frame().await {
            Frame::MethodCall {
                serial,
                path,
                interface,
                member,
                body,
                ..
            } => {
                assert_eq!(path, "/re/frida/AgentSession/s1");
                assert_eq!(interface, "re.frida.AgentSession17");
                assert_eq!(member, "CreateScript");
                assert_eq!(body, vec![json!("send('hi')"), json!([])]);
                server.reply(serial, vec![json!(7)]).await;
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(call.await.unwrap().unwrap(), ScriptId(7));
    }

    #[tokio::test]
    async fn post_messages_is_one_way() {
        let (bus, mut server) = connected();
        let agent = AgentSession::new(bus, &Interfaces::default(), &SessionId("s1".into()));

        agent
            .post_messages(&[AgentMessage::script(ScriptId(1), "\"ping\"".into(), None)], 0)
            .unwrap();

        match server.next_frame().await {
            Frame::MethodCall {
                member,
                body,
                no_reply,
                ..
            } => {
                assert_eq!(member, "PostMessages");
                assert!(no_reply);
                assert_eq!(body, vec![json!([[1, 1, "\"ping\"", false, []]]), json!(0)]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
