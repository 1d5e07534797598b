//! One established channel between two peers.
//!
//! A connection owns a [`FramedStream`], the formatter that turns frames into
//! messages, and the worker running its read loop. It moves through
//! `created → started → stopped` exactly once; servers and clients create a
//! fresh connection for every peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use super::protocol::FramedStream;
use crate::cancel::CancellationToken;
use crate::error::{PipeError, Result};
use crate::events::EventSender;
use crate::formatter::SharedFormatter;
use crate::worker::Worker;

/// Async callback run on every new connection before its read loop starts.
///
/// This is the only window in which the connection's formatter may be
/// replaced. Returning an error tears the connection down: a client's
/// `connect()` fails, a server reports the error and drops the peer.
#[async_trait::async_trait]
pub trait ConnectHook<T>: Send + Sync + 'static {
    async fn on_connected(&self, connection: &Arc<PipeConnection<T>>) -> Result<()>;
}

/// Slot holding an owner's optional connect hook.
pub(crate) type HookSlot<T> = RwLock<Option<Arc<dyn ConnectHook<T>>>>;

pub(crate) fn load_hook<T>(slot: &HookSlot<T>) -> Option<Arc<dyn ConnectHook<T>>> {
    match slot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub(crate) fn store_hook<T>(slot: &HookSlot<T>, hook: Option<Arc<dyn ConnectHook<T>>>) {
    match slot.write() {
        Ok(mut guard) => *guard = hook,
        Err(poisoned) => *poisoned.into_inner() = hook,
    }
}

/// A framed, typed channel to one peer.
pub struct PipeConnection<T> {
    id: u64,
    pipe_name: String,
    server_name: String,
    stream: FramedStream,
    formatter: RwLock<SharedFormatter<T>>,
    initial_formatter: SharedFormatter<T>,
    worker: Mutex<Option<Worker>>,
    started: AtomicBool,
    disconnected: AtomicBool,
    closed: CancellationToken,
}

impl<T> PipeConnection<T> {
    /// Wrap an already-connected stream. The read loop is not running yet.
    pub fn new(
        id: u64,
        pipe_name: impl Into<String>,
        server_name: impl Into<String>,
        stream: FramedStream,
        formatter: SharedFormatter<T>,
    ) -> Self {
        Self {
            id,
            pipe_name: pipe_name.into(),
            server_name: server_name.into(),
            stream,
            formatter: RwLock::new(formatter.clone()),
            initial_formatter: formatter,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Identifier assigned by the owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the endpoint carrying this connection.
    ///
    /// For handshake connections this is the data name (`{public}_{n}`).
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Host of the server side (`"."` for local).
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the underlying stream is still open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_connected() && !self.closed.is_cancelled()
    }

    /// Whether `start()` has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// The formatter currently used for reads and writes.
    pub fn formatter(&self) -> SharedFormatter<T> {
        match self.formatter.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the formatter.
    ///
    /// Only allowed before the read loop starts, i.e. from a connect hook.
    pub fn set_formatter(&self, formatter: SharedFormatter<T>) -> Result<()> {
        if self.is_started() {
            return Err(PipeError::AlreadyStarted {
                what: "Read loop".into(),
                pipe_name: self.pipe_name.clone(),
            });
        }
        self.replace_formatter(formatter);
        Ok(())
    }

    fn replace_formatter(&self, formatter: SharedFormatter<T>) {
        match self.formatter.write() {
            Ok(mut guard) => *guard = formatter,
            Err(poisoned) => *poisoned.into_inner() = formatter,
        }
    }

    /// Resolves once the connection has disconnected or been stopped.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Cancel the read loop without waiting for it.
    pub fn cancel(&self) {
        if let Ok(guard) = self.worker.lock() {
            if let Some(worker) = guard.as_ref() {
                worker.cancel();
            }
        }
    }

    /// Record the disconnect once: revert the formatter, wake `closed()`
    /// waiters and tell the owner.
    fn mark_disconnected(self: &Arc<Self>, events: &EventSender<T>) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.replace_formatter(self.initial_formatter.clone());
        self.closed.cancel();
        debug!("Pipe connection {} disconnected", self.pipe_name);
        events.disconnected(Arc::clone(self));
    }
}

impl<T> PipeConnection<T>
where
    T: Send + Sync + 'static,
{
    /// Start the read loop.
    ///
    /// Messages, decode errors and the final `Disconnected` are emitted into
    /// `events`. Fails with `AlreadyStarted` on a started or stopped connection.
    pub fn start(self: &Arc<Self>, events: EventSender<T>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(PipeError::AlreadyStarted {
                what: "Pipe connection".into(),
                pipe_name: self.pipe_name.clone(),
            });
        }

        let connection = Arc::clone(self);
        let error_events = events.clone();
        let error_connection = Arc::downgrade(self);
        let worker = Worker::spawn(
            format!("{} read loop", self.pipe_name),
            move |token| connection.read_loop(token, events),
            move |e| error_events.error(error_connection.upgrade(), e),
        );

        match self.worker.lock() {
            Ok(mut guard) => *guard = Some(worker),
            Err(poisoned) => *poisoned.into_inner() = Some(worker),
        }
        debug!("Pipe connection {} started", self.pipe_name);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, token: CancellationToken, events: EventSender<T>) -> Result<()> {
        let result = loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break Err(PipeError::Cancelled),
                frame = self.stream.read() => frame,
            };

            match frame {
                Ok(Some(payload)) => match self.formatter().deserialize(&payload) {
                    Ok(message) => events.message(Arc::clone(&self), message),
                    Err(e) => {
                        warn!("Failed to decode message on {}: {}", self.pipe_name, e);
                        events.error(Some(Arc::clone(&self)), e);
                    }
                },
                Ok(None) => break Ok(()),
                Err(e) => {
                    debug!("Read failed on {}: {}", self.pipe_name, e);
                    events.error(Some(Arc::clone(&self)), e);
                    break Ok(());
                }
            }

            if !self.stream.is_connected() {
                break Ok(());
            }
        };

        // The peer must see end of stream whenever this side gives up.
        if result.is_ok() {
            self.stream.close().await;
        }
        self.mark_disconnected(&events);
        result
    }

    /// Serialize and send one message. `None` sends the empty message.
    ///
    /// Safe to call from many tasks at once; frames never interleave.
    pub async fn write(&self, value: Option<&T>) -> Result<()> {
        if !self.is_connected() {
            return Err(PipeError::not_connected(&self.pipe_name));
        }
        let payload = self.formatter().serialize(value)?;
        self.stream.write(&payload).await
    }

    /// Send an already-encoded payload, bypassing the formatter.
    pub async fn write_raw(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(PipeError::not_connected(&self.pipe_name));
        }
        self.stream.write(payload).await
    }

    /// Stop the read loop and close the stream.
    ///
    /// Idempotent. Awaits the read loop, so `Disconnected` (if the loop was
    /// running) has been emitted by the time this returns.
    pub async fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker.stop().await;
        }
        self.closed.cancel();
        self.stream.close().await;
    }
}

impl<T> Drop for PipeConnection<T> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl<T> std::fmt::Debug for PipeConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConnection")
            .field("id", &self.id)
            .field("pipe_name", &self.pipe_name)
            .field("server_name", &self.server_name)
            .field("connected", &self.is_connected())
            .field("started", &self.is_started())
            .finish()
    }
}
