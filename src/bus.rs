//! RPC bus over one transport connection.
//!
//! Outbound calls get a fresh serial and park on a oneshot until the reply
//! with the matching `reply_serial` arrives. Inbound method calls and signals
//! are routed to handlers keyed by (path, interface, member).
//!
//! ```text
//!  callers ──call()──▸ outbound queue ──▸ writer task ──▸ sink
//!     ▴
//!     └── pending[serial] ◂── reader task (dispatch) ◂── source
//!                                  └──▸ handlers[(path, iface, member)]
//! ```
//!
//! When the connection drops, or `disconnect()` is called, every pending call
//! fails with [`Error::ConnectionClosed`].

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, RemoteCallError, Result};
use crate::transport::{Body, Duplex, Frame, FrameSink, FrameSource};

/// Error name sent back for inbound calls nobody handles.
pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Error name sent back when a handler panicked.
pub const HANDLER_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// How long `disconnect` waits for queued frames to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handler for inbound method calls and signals.
pub type MethodHandler = Arc<dyn Fn(Body) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    path: String,
    interface: String,
    member: String,
}

impl HandlerKey {
    fn new(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
        }
    }
}

enum Reply {
    Return(Body),
    Error { name: String, message: String },
    Closed,
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct Inner {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    handlers: RwLock<HashMap<HandlerKey, MethodHandler>>,
    next_serial: AtomicU32,
    alive: AtomicBool,
    shutdown_tx: mpsc::Sender<()>,
    closed_tx: watch::Sender<bool>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to one bus connection. Cheap to clone.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl BusConnection {
    /// Start the reader and writer tasks over `duplex`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(duplex: Duplex) -> Self {
        let Duplex { sink, source } = duplex;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_serial: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            shutdown_tx: shutdown_tx.clone(),
            closed_tx,
            writer: std::sync::Mutex::new(None),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx, shutdown_tx));
        *inner.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
        tokio::spawn(read_loop(Arc::clone(&inner), source, shutdown_rx));

        Self { inner }
    }

    /// Whether the connection is still usable.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Call `member` on `interface` at `path` and wait for its reply.
    pub async fn call(&self, path: &str, interface: &str, member: &str, args: Body) -> Result<Body> {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::MethodCall {
            serial,
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            body: args,
            no_reply: false,
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            // Checked under the lock: teardown flips `alive` before draining.
            if !self.is_alive() {
                return Err(Error::ConnectionClosed);
            }
            pending.insert(serial, tx);
        }

        if self.inner.outbound.send(Outbound::Frame(frame)).is_err() {
            self.inner.pending.lock().await.remove(&serial);
            return Err(Error::ConnectionClosed);
        }
        debug!(serial, interface = %interface, member = %member, "Call sent");

        match rx.await {
            Ok(Reply::Return(body)) => Ok(body),
            Ok(Reply::Error { name, message }) => Err(RemoteCallError {
                method: member.to_string(),
                name,
                message,
            }
            .into()),
            Ok(Reply::Closed) | Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send a call without waiting for (or asking for) a reply.
    ///
    /// Sends from one caller leave in the order they were made.
    pub fn send(&self, path: &str, interface: &str, member: &str, args: Body) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ConnectionClosed);
        }
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::MethodCall {
            serial,
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            body: args,
            no_reply: true,
        }
        .encode()?;

        self.inner
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(serial, member = %member, "One-way call sent");
        Ok(())
    }

    /// Install the handler for inbound calls/signals on (path, interface, member).
    ///
    /// Replaces any previous handler for the same key. Returns `true` if one
    /// was replaced.
    pub async fn register_handler<F>(&self, path: &str, interface: &str, member: &str, handler: F) -> bool
    where
        F: Fn(Body) + Send + Sync + 'static,
    {
        let key = HandlerKey::new(path, interface, member);
        let replaced = self
            .inner
            .handlers
            .write()
            .await
            .insert(key, Arc::new(handler))
            .is_some();
        if replaced {
            debug!(path = %path, member = %member, "Replaced existing handler");
        }
        replaced
    }

    /// Remove the handler for (path, interface, member), if any.
    pub async fn unregister_handler(&self, path: &str, interface: &str, member: &str) -> bool {
        self.inner
            .handlers
            .write()
            .await
            .remove(&HandlerKey::new(path, interface, member))
            .is_some()
    }

    /// Wait until the connection has shut down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Ask the connection to shut down without waiting for it.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.try_send(());
    }

    /// Close the connection. Every outstanding call fails with
    /// [`Error::ConnectionClosed`] before this returns.
    ///
    /// Frames already queued get a short grace period to reach the peer;
    /// a writer stuck on a peer that stopped reading is aborted.
    pub async fn disconnect(&self) {
        self.shutdown();
        self.closed().await;

        let writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!("Bus writer did not drain in time, aborting");
                writer.abort();
            }
        }
    }
}

/// Deserialize positional value `index` of a reply to `method`.
pub fn reply_arg<T: DeserializeOwned>(method: &str, body: &Body, index: usize) -> Result<T> {
    let value = body.get(index).ok_or_else(|| Error::InvalidReply {
        method: method.to_string(),
        reason: format!("missing value at position {index}"),
    })?;
    <T as Deserialize>::deserialize(value).map_err(|e| Error::InvalidReply {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

impl Inner {
    async fn dispatch(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::MethodReturn { reply_serial, body } => {
                self.complete(reply_serial, Reply::Return(body)).await;
            }
            Frame::Error {
                reply_serial,
                name,
                message,
            } => {
                self.complete(reply_serial, Reply::Error { name, message }).await;
            }
            Frame::MethodCall {
                serial,
                path,
                interface,
                member,
                body,
                no_reply,
            } => {
                let reply = if let Some(handler) = self.handler(&path, &interface, &member).await {
                    if invoke(&handler, body, &member) {
                        Frame::MethodReturn {
                            reply_serial: serial,
                            body: Body::new(),
                        }
                    } else {
                        Frame::Error {
                            reply_serial: serial,
                            name: HANDLER_FAILED.to_string(),
                            message: format!("Handler for {interface}.{member} at {path} panicked"),
                        }
                    }
                } else {
                    warn!(path = %path, interface = %interface, member = %member, "No handler for inbound call");
                    Frame::Error {
                        reply_serial: serial,
                        name: UNKNOWN_METHOD.to_string(),
                        message: format!("No handler for {interface}.{member} at {path}"),
                    }
                };
                if !no_reply {
                    self.reply(&reply);
                }
            }
            Frame::Signal {
                path,
                interface,
                member,
                body,
            } => {
                if let Some(handler) = self.handler(&path, &interface, &member).await {
                    invoke(&handler, body, &member);
                } else {
                    trace!(path = %path, member = %member, "Ignoring unhandled signal");
                }
            }
        }
    }

    async fn handler(&self, path: &str, interface: &str, member: &str) -> Option<MethodHandler> {
        self.handlers
            .read()
            .await
            .get(&HandlerKey::new(path, interface, member))
            .cloned()
    }

    async fn complete(&self, serial: u32, reply: Reply) {
        let tx = self.pending.lock().await.remove(&serial);
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(serial, "Reply for unknown serial"),
        }
    }

    fn reply(&self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => {
                if self.outbound.send(Outbound::Frame(bytes)).is_err() {
                    debug!("Writer gone, reply dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
    }

    async fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Reply::Closed);
        }

        let _ = self.outbound.send(Outbound::Close);
        self.closed_tx.send_replace(true);
    }
}

/// Run `handler` on the reader task. A panic is contained and logged so the
/// dispatch loop keeps going; returns `false` if it panicked.
fn invoke(handler: &MethodHandler, body: Body, member: &str) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(body))) {
        Ok(()) => true,
        Err(_) => {
            warn!(member = %member, "Inbound handler panicked");
            false
        }
    }
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown_tx: mpsc::Sender<()>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = sink.send_frame(bytes).await {
                    warn!(error = %e, "Bus write failed, closing connection");
                    let _ = shutdown_tx.try_send(());
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing bus sink");
    }
    debug!("Bus writer ended");
}

async fn read_loop(inner: Arc<Inner>, mut source: Box<dyn FrameSource>, mut shutdown_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            frame = source.recv_frame() => match frame {
                Some(Ok(bytes)) => inner.dispatch(&bytes).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Bus read failed");
                    break;
                }
                None => {
                    info!("Bus connection closed by peer");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("Bus shutdown requested");
                break;
            }
        }
    }

    inner.teardown().await;
}
