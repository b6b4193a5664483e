//! frida-remote client library
//!
//! This crate talks to a remote Frida server over a single connection:
//! - RPC call correlation and inbound dispatch (`bus`) over websocket or TCP
//! - Typed host and agent session proxies
//! - Attachment and script lifecycle, with per-session message delivery
//! - Decoding of the self-describing variant values used for metadata
//!
//! The bus frames are JSON objects (see [`transport::protocol`]), not D-Bus
//! wire messages. A stock frida-server speaks D-Bus on its websocket, so the
//! server side needs a bridge that speaks these frames.

pub mod agent;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod nodejs;
pub mod session;
pub mod transport;
pub mod variant;

pub use client::{Client, ScriptedAttachment, SpawnedProcess};
pub use config::ClientConfig;
pub use error::{Error, RemoteCallError, RemoteErrorKind, Result};
pub use message::{LogLevel, Message, ScriptMessage};
pub use session::{Attachment, AttachmentState, Script, ScriptState};
