//! Client-facing API.
//!
//! A [`Client`] owns one bus connection to a server and hands out
//! attachments. Composite helpers (`inject_into_process`,
//! `spawn_with_script`) chain the single-step operations and add no state of
//! their own.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, instrument, warn};

use crate::agent::ScriptOptions;
use crate::bus::BusConnection;
use crate::config::{ClientConfig, Interfaces, TransportKind};
use crate::error::{Error, Result};
use crate::host::{ApplicationInfo, HostSession, ProcessInfo, SpawnOptions};
use crate::nodejs;
use crate::session::{Attachment, Script};
use crate::transport::{Duplex, StreamTransport, WebSocketTransport};
use crate::variant::{decode_dict, DecodedMap};

/// A process spawned suspended, with an attachment ready for setup.
pub struct SpawnedProcess {
    pub pid: u32,
    pub attachment: Attachment,
}

/// An attachment with one script created in it.
///
/// `load_error` is set when the script was created but failed to load; the
/// attachment stays usable either way.
pub struct ScriptedAttachment {
    pub pid: u32,
    pub attachment: Attachment,
    pub script: Script,
    pub load_error: Option<Error>,
}

impl ScriptedAttachment {
    /// Turn a recorded load failure into an error.
    pub fn into_loaded(self) -> Result<Self> {
        match self.load_error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Connection to one remote server.
///
/// Attachments handed out share this connection. Dropping the client shuts
/// the connection down, which ends them too.
pub struct Client {
    bus: BusConnection,
    host: HostSession,
    interfaces: Interfaces,
}

impl Client {
    /// Connect to `config.host` using the configured transport.
    #[instrument(skip(config), fields(host = %config.host, transport = ?config.transport))]
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let duplex = match config.transport {
            TransportKind::WebSocket => WebSocketTransport::connect(&config.host).await?,
            TransportKind::Tcp => StreamTransport::connect_tcp(&config.host).await?,
        };
        info!("Connected");
        Ok(Self::over(duplex, config))
    }

    /// Connect over a caller-supplied stream (a tunnel, a forwarded port).
    ///
    /// The websocket handshake runs over `stream`; `config.host` only names
    /// the server in the request. With the TCP transport the stream carries
    /// length-prefixed frames directly.
    pub async fn connect_stream<S>(stream: S, config: &ClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let duplex = match config.transport {
            TransportKind::WebSocket => WebSocketTransport::connect_over(stream, &config.host).await?,
            TransportKind::Tcp => StreamTransport::new(stream),
        };
        Ok(Self::over(duplex, config))
    }

    /// Run the client over an existing frame transport.
    pub fn over(duplex: Duplex, config: &ClientConfig) -> Self {
        let bus = BusConnection::open(duplex);
        let interfaces = config.interfaces();
        Self {
            host: HostSession::new(bus.clone(), &interfaces),
            bus,
            interfaces,
        }
    }

    /// Close the connection. Outstanding calls fail with
    /// [`Error::ConnectionClosed`].
    pub async fn disconnect(&self) {
        self.bus.disconnect().await;
        info!("Disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_alive()
    }

    /// Wait until the server drops the connection (or it is disconnected).
    pub async fn closed(&self) {
        self.bus.closed().await;
    }

    /// Server metadata, with integers rendered as decimal strings.
    pub async fn query_metadata(&self) -> Result<DecodedMap> {
        let params = self.host.query_system_parameters().await?;
        Ok(decode_dict(&params)?)
    }

    pub async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.host.enumerate_processes().await
    }

    pub async fn enumerate_applications(&self) -> Result<Vec<ApplicationInfo>> {
        self.host.enumerate_applications().await
    }

    #[instrument(skip(self))]
    pub async fn attach_to_process(&self, pid: u32) -> Result<Attachment> {
        let session_id = self.host.attach(pid).await?;
        Ok(Attachment::bind(self.bus.clone(), self.host.clone(), &self.interfaces, pid, session_id).await)
    }

    /// Attach to `pid`, then create and load `source` in it.
    pub async fn inject_into_process(&self, pid: u32, source: &str) -> Result<ScriptedAttachment> {
        let attachment = self.attach_to_process(pid).await?;
        let (script, load_error) = create_and_load(&attachment, source).await?;
        Ok(ScriptedAttachment {
            pid,
            attachment,
            script,
            load_error,
        })
    }

    /// Like [`Client::inject_into_process`], but `code` runs inside the
    /// target's Node.js runtime rather than the agent's.
    pub async fn inject_into_nodejs_process(&self, pid: u32, code: &str) -> Result<ScriptedAttachment> {
        let source = nodejs::build_injection_script(code)?;
        self.inject_into_process(pid, &source).await
    }

    /// Spawn `command` with `args`, suspended, and attach to it.
    #[instrument(skip(self, args))]
    pub async fn spawn_paused(&self, command: &str, args: &[String]) -> Result<SpawnedProcess> {
        let argv = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect();
        let options = SpawnOptions {
            argv: Some(argv),
            ..SpawnOptions::default()
        };
        let pid = self.host.spawn(command, &options).await?;
        let attachment = self.attach_to_process(pid).await?;
        Ok(SpawnedProcess { pid, attachment })
    }

    /// Spawn suspended, inject `source`, then let the process run.
    ///
    /// The process is resumed even if the script failed to load.
    pub async fn spawn_with_script(
        &self,
        command: &str,
        args: &[String],
        source: &str,
    ) -> Result<ScriptedAttachment> {
        let SpawnedProcess { pid, attachment } = self.spawn_paused(command, args).await?;
        let (script, load_error) = create_and_load(&attachment, source).await?;
        attachment.resume().await?;
        Ok(ScriptedAttachment {
            pid,
            attachment,
            script,
            load_error,
        })
    }

    /// Kill `pid` without attaching to it.
    pub async fn kill(&self, pid: u32) -> Result<()> {
        self.host.kill(pid).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.bus.shutdown();
    }
}

/// Create `source` in `attachment` and try to load it.
///
/// A load failure is logged and handed back rather than propagated.
async fn create_and_load(attachment: &Attachment, source: &str) -> Result<(Script, Option<Error>)> {
    let mut script = attachment.create_script(source, &ScriptOptions::default()).await?;
    let load_error = match script.load().await {
        Ok(()) => None,
        Err(e) => {
            warn!(pid = attachment.pid(), script = %script.id(), error = %e, "Script failed to load");
            Some(e)
        }
    };
    Ok((script, load_error))
}
