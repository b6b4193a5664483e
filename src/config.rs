//! Client configuration.
//!
//! Loaded from a JSON file, a JSON string, or `FRIDA_*` environment
//! variables. Also derives the well-known object paths and interface names,
//! which carry the server's protocol version as a suffix.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::SessionId;

/// Default server address.
pub const DEFAULT_HOST: &str = "127.0.0.1:27042";

/// Protocol version the interface names are suffixed with.
pub const DEFAULT_INTERFACE_VERSION: u32 = 17;

/// Top-level configuration for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    #[serde(default = "default_host")]
    pub host: String,

    /// How to reach the server.
    #[serde(default)]
    pub transport: TransportKind,

    /// Version suffix of the remote interface names.
    #[serde(default = "default_interface_version")]
    pub interface_version: u32,
}

/// Available transports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Websocket at `ws://{host}/ws`.
    #[default]
    WebSocket,
    /// Length-prefixed frames over plain TCP.
    Tcp,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "tcp" => Ok(Self::Tcp),
            other => anyhow::bail!("Unknown transport '{other}' (expected 'websocket' or 'tcp')"),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

const fn default_interface_version() -> u32 {
    DEFAULT_INTERFACE_VERSION
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            transport: TransportKind::default(),
            interface_version: DEFAULT_INTERFACE_VERSION,
        }
    }
}

impl ClientConfig {
    /// Configuration for `host` with everything else defaulted.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse client config")?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&json)?;
        debug!(path = %path.display(), host = %config.host, "Loaded client config");
        Ok(config)
    }

    /// Build from environment variables, falling back to defaults.
    ///
    /// Reads `FRIDA_HOST`, `FRIDA_TRANSPORT` and `FRIDA_INTERFACE_VERSION`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("FRIDA_HOST") {
            config.host = host;
        }
        if let Some(transport) = lookup("FRIDA_TRANSPORT") {
            config.transport = transport.parse().context("Invalid FRIDA_TRANSPORT")?;
        }
        if let Some(version) = lookup("FRIDA_INTERFACE_VERSION") {
            config.interface_version = version
                .parse()
                .with_context(|| format!("Invalid FRIDA_INTERFACE_VERSION: {version}"))?;
        }
        Ok(config)
    }

    pub fn interfaces(&self) -> Interfaces {
        Interfaces {
            version: self.interface_version,
        }
    }
}

/// Well-known paths and interface names for one protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interfaces {
    version: u32,
}

impl Interfaces {
    pub const HOST_SESSION_PATH: &'static str = "/re/frida/HostSession";

    pub const fn new(version: u32) -> Self {
        Self { version }
    }

    pub fn host_session(&self) -> String {
        format!("re.frida.HostSession{}", self.version)
    }

    pub fn agent_session(&self) -> String {
        format!("re.frida.AgentSession{}", self.version)
    }

    pub fn agent_message_sink(&self) -> String {
        format!("re.frida.AgentMessageSink{}", self.version)
    }

    pub fn agent_session_path(id: &SessionId) -> String {
        format!("/re/frida/AgentSession/{id}")
    }

    pub fn agent_message_sink_path(id: &SessionId) -> String {
        format!("/re/frida/AgentMessageSink/{id}")
    }
}

impl Default for Interfaces {
    fn default() -> Self {
        Self::new(DEFAULT_INTERFACE_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_uses_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.host, "127.0.0.1:27042");
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.interface_version, 17);
    }

    #[test]
    fn parse_full_json() {
        let json = r#"{
            "host": "10.0.0.5:1337",
            "transport": "tcp",
            "interface_version": 16
        }"#;
        let config = ClientConfig::from_json(json).unwrap();
        assert_eq!(config.host, "10.0.0.5:1337");
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.interfaces().host_session(), "re.frida.HostSession16");
    }

    #[test]
    fn unknown_transport_is_rejected() {
        assert!(ClientConfig::from_json(r#"{"transport": "carrier-pigeon"}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"host": "device.local:27042"}"#).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.host, "device.local:27042");
        assert_eq!(config.transport, TransportKind::WebSocket);
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClientConfig::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn env_overrides() {
        let vars = HashMap::from([
            ("FRIDA_HOST", "192.168.1.20:27042"),
            ("FRIDA_TRANSPORT", "WS"),
            ("FRIDA_INTERFACE_VERSION", "16"),
        ]);
        let config = ClientConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.host, "192.168.1.20:27042");
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.interface_version, 16);
    }

    #[test]
    fn env_defaults_when_unset() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn bad_env_version_is_an_error() {
        let result = ClientConfig::from_lookup(|k| (k == "FRIDA_INTERFACE_VERSION").then(|| "x".into()));
        assert!(result.is_err());
    }

    #[test]
    fn paths_embed_session_id() {
        let id = SessionId("abc123".into());
        let names = Interfaces::new(17);
        assert_eq!(Interfaces::agent_session_path(&id), "/re/frida/AgentSession/abc123");
        assert_eq!(
            Interfaces::agent_message_sink_path(&id),
            "/re/frida/AgentMessageSink/abc123"
        );
        assert_eq!(names.agent_session(), "re.frida.AgentSession17");
        assert_eq!(names.agent_message_sink(), "re.frida.AgentMessageSink17");
    }
}
