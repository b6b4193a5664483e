//! Attachment and script lifecycle.
//!
//! An [`Attachment`] is a live control relationship with one process. It
//! owns exactly one message-sink registration on the bus, keyed by its
//! session id; installing a new message callback replaces the previous one.
//!
//! ```text
//! Attached ─▸ ScriptCreated ─▸ ScriptLoaded ─▸ Resumed
//!    │                                           │
//!    └──────────────▸ Killed / Detached ◂────────┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::agent::{AgentMessage, AgentSession, ScriptId, ScriptOptions, SessionId};
use crate::bus::BusConnection;
use crate::config::Interfaces;
use crate::error::{Error, Result};
use crate::host::HostSession;
use crate::message::ScriptMessage;
use crate::transport::Body;

/// Batch id for messages posted outside a persistent session.
const NO_BATCH_ID: u32 = 0;

/// Where an attachment is in its lifecycle.
///
/// Process exit is not observed; an exited target shows up as failing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachmentState {
    Attached,
    ScriptCreated,
    ScriptLoaded,
    Resumed,
    Killed,
    Detached,
}

impl AttachmentState {
    pub const fn has_ended(self) -> bool {
        matches!(self, Self::Killed | Self::Detached)
    }
}

/// Shared lifecycle cell. Only moves forward.
#[derive(Clone)]
struct Lifecycle {
    session_id: SessionId,
    state: Arc<watch::Sender<AttachmentState>>,
}

impl Lifecycle {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: Arc::new(watch::Sender::new(AttachmentState::Attached)),
        }
    }

    fn get(&self) -> AttachmentState {
        *self.state.borrow()
    }

    fn advance(&self, to: AttachmentState) {
        self.state.send_if_modified(|state| {
            if to > *state {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    fn ensure_active(&self) -> Result<()> {
        if self.get().has_ended() {
            return Err(Error::SessionEnded(self.session_id.clone()));
        }
        Ok(())
    }
}

/// A live attachment to one process.
pub struct Attachment {
    pid: u32,
    bus: BusConnection,
    host: HostSession,
    agent: AgentSession,
    sink_path: String,
    sink_interface: String,
    lifecycle: Lifecycle,
}

impl Attachment {
    /// Bind to an attachment the server has already created, and install the
    /// default (logging) message sink for it.
    pub(crate) async fn bind(
        bus: BusConnection,
        host: HostSession,
        interfaces: &Interfaces,
        pid: u32,
        session_id: SessionId,
    ) -> Self {
        let attachment = Self {
            pid,
            agent: AgentSession::new(bus.clone(), interfaces, &session_id),
            sink_path: Interfaces::agent_message_sink_path(&session_id),
            sink_interface: interfaces.agent_message_sink(),
            lifecycle: Lifecycle::new(session_id),
            bus,
            host,
        };

        let session_id = attachment.session_id().clone();
        attachment
            .install_sink(move |msg| {
                debug!(session = %session_id, script = %msg.script_id, message = ?msg.message, "Unobserved script message");
            })
            .await;
        attachment
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn session_id(&self) -> &SessionId {
        &self.lifecycle.session_id
    }

    pub fn state(&self) -> AttachmentState {
        self.lifecycle.get()
    }

    /// Create a script in the target. It does not run until loaded.
    #[instrument(skip(self, source, options), fields(session = %self.session_id()))]
    pub async fn create_script(&self, source: &str, options: &ScriptOptions) -> Result<Script> {
        self.lifecycle.ensure_active()?;
        let id = self.agent.create_script(source, options).await?;
        self.lifecycle.advance(AttachmentState::ScriptCreated);
        Ok(Script {
            id,
            state: ScriptState::Created,
            agent: self.agent.clone(),
            lifecycle: self.lifecycle.clone(),
        })
    }

    /// Deliver this attachment's script messages to `callback`.
    ///
    /// Replaces whatever callback was installed before.
    pub async fn on_message<F>(&self, callback: F)
    where
        F: Fn(ScriptMessage) + Send + Sync + 'static,
    {
        self.install_sink(callback).await;
    }

    /// Deliver this attachment's script messages into a queue.
    ///
    /// This is a callback registration like [`Attachment::on_message`] and
    /// replaces it.
    pub async fn message_channel(&self) -> mpsc::UnboundedReceiver<ScriptMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.install_sink(move |msg| {
            let _ = tx.send(msg);
        })
        .await;
        rx
    }

    async fn install_sink<F>(&self, callback: F)
    where
        F: Fn(ScriptMessage) + Send + Sync + 'static,
    {
        let session_id = self.session_id().clone();
        self.bus
            .register_handler(
                &self.sink_path,
                &self.sink_interface,
                "PostMessages",
                move |body| demultiplex(&session_id, body, &callback),
            )
            .await;
    }

    /// Let a spawned process start running.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub async fn resume(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.host.resume(self.pid).await?;
        self.lifecycle.advance(AttachmentState::Resumed);
        info!("Process resumed");
        Ok(())
    }

    /// Kill the process. The attachment is unusable afterwards.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub async fn kill(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.host.kill(self.pid).await?;
        self.lifecycle.advance(AttachmentState::Killed);
        self.remove_sink().await;
        info!("Process killed");
        Ok(())
    }

    /// Detach from the process, leaving it running.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub async fn detach(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.agent.close().await?;
        self.lifecycle.advance(AttachmentState::Detached);
        self.remove_sink().await;
        info!("Detached");
        Ok(())
    }

    async fn remove_sink(&self) {
        self.bus
            .unregister_handler(&self.sink_path, &self.sink_interface, "PostMessages")
            .await;
    }
}

/// Route one `PostMessages` batch to `callback`.
///
/// Non-script kinds are dropped; malformed entries are logged and skipped so
/// the rest of the batch is still delivered.
fn demultiplex<F>(session_id: &SessionId, body: Body, callback: &F)
where
    F: Fn(ScriptMessage),
{
    let batch: Vec<AgentMessage> = match body.into_iter().next().map(serde_json::from_value) {
        Some(Ok(batch)) => batch,
        Some(Err(e)) => {
            warn!(session = %session_id, error = %e, "Dropping undecodable message batch");
            return;
        }
        None => {
            warn!(session = %session_id, "Empty PostMessages call");
            return;
        }
    };

    for raw in batch {
        match ScriptMessage::decode(raw) {
            Some(Ok(msg)) => callback(msg),
            Some(Err(e)) => warn!(session = %session_id, error = %e, "Dropping agent message"),
            None => trace!(session = %session_id, "Skipping non-script agent message"),
        }
    }
}

/// Load state of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Created,
    Loaded,
    Destroyed,
}

/// A script injected into an attachment.
pub struct Script {
    id: ScriptId,
    state: ScriptState,
    agent: AgentSession,
    lifecycle: Lifecycle,
}

impl Script {
    pub const fn id(&self) -> ScriptId {
        self.id
    }

    pub const fn state(&self) -> ScriptState {
        self.state
    }

    /// Start running the script. Messages can be expected once this returns.
    #[instrument(skip(self), fields(script = %self.id))]
    pub async fn load(&mut self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        if self.state == ScriptState::Loaded {
            debug!("Script already loaded");
            return Ok(());
        }
        self.agent.load_script(self.id).await?;
        self.state = ScriptState::Loaded;
        self.lifecycle.advance(AttachmentState::ScriptLoaded);
        debug!("Script loaded");
        Ok(())
    }

    /// Destroy the script inside the target.
    pub async fn unload(&mut self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        if self.state == ScriptState::Destroyed {
            return Ok(());
        }
        self.agent.destroy_script(self.id).await?;
        self.state = ScriptState::Destroyed;
        Ok(())
    }

    /// Send `payload` (any JSON value) and optional binary `data` to the
    /// script's `recv()` handlers.
    ///
    /// Not acknowledged. Posts on one script arrive in order.
    pub fn post<T>(&self, payload: &T, data: Option<&[u8]>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.lifecycle.ensure_active()?;
        let text = serde_json::to_string(payload)?;
        self.agent
            .post_messages(&[AgentMessage::script(self.id, text, data)], NO_BATCH_ID)
    }
}
