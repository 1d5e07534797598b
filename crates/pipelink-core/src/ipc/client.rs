//! Pipe client with automatic reconnection.
//!
//! A client reaches its server in one of two ways:
//!
//! - **Handshake** ([`PipeClient::new`]): connect to the public name, read
//!   the private data name the server assigns, reconnect there. Pairs with
//!   [`PipeServer`](super::PipeServer).
//! - **Direct** ([`PipeClient::direct`]): connect straight to the public
//!   name. Pairs with [`SingleConnectionPipeServer`](super::SingleConnectionPipeServer).
//!
//! # Thread Safety
//!
//! `connect()` is serialized by an async lock, so concurrent callers wait for
//! the attempt already in flight instead of opening a second channel. The
//! reconnect timer is a [`Worker`] owned by the client handle; dropping the
//! client cancels it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connection::{load_hook, store_hook, ConnectHook, HookSlot, PipeConnection};
use super::protocol::FramedStream;
use crate::cancel::CancellationToken;
use crate::config::{ClientOptions, PipeConfig};
use crate::error::{PipeError, Result};
use crate::events::{EventSender, PipeEvents};
use crate::formatter::{JsonFormatter, SharedFormatter};
use crate::platform::{self, validate_name};
use crate::worker::Worker;

/// How a client reaches its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Rendezvous on the public name, then move to a private data name.
    Handshake,
    /// Use the public name as the data channel.
    Direct,
}

/// Marks the client as connecting until dropped.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ClientShared<T> {
    pipe_name: String,
    mode: ConnectMode,
    options: ClientOptions,
    formatter: SharedFormatter<T>,
    connection: Mutex<Option<Arc<PipeConnection<T>>>>,
    connect_lock: AsyncMutex<()>,
    connecting: AtomicBool,
    hook: HookSlot<T>,
    events: EventSender<T>,
    next_id: AtomicU64,
}

/// A client connection to a pipe server.
pub struct PipeClient<T> {
    shared: Arc<ClientShared<T>>,
    reconnect: Mutex<Option<Worker>>,
}

impl<T> PipeClient<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Handshake client for `pipe_name` using JSON and default options.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self::with_options(
            pipe_name,
            ConnectMode::Handshake,
            JsonFormatter::shared(),
            ClientOptions::default(),
        )
    }

    /// Direct client for `pipe_name` using JSON and default options.
    pub fn direct(pipe_name: impl Into<String>) -> Self {
        Self::with_options(
            pipe_name,
            ConnectMode::Direct,
            JsonFormatter::shared(),
            ClientOptions::default(),
        )
    }
}

impl<T> PipeClient<T>
where
    T: Send + Sync + 'static,
{
    /// Client with an explicit mode, formatter and options.
    pub fn with_options(
        pipe_name: impl Into<String>,
        mode: ConnectMode,
        formatter: SharedFormatter<T>,
        options: ClientOptions,
    ) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                pipe_name: pipe_name.into(),
                mode,
                options,
                formatter,
                connection: Mutex::new(None),
                connect_lock: AsyncMutex::new(()),
                connecting: AtomicBool::new(false),
                hook: std::sync::RwLock::new(None),
                events: EventSender::detached(),
                next_id: AtomicU64::new(1),
            }),
            reconnect: Mutex::new(None),
        }
    }

    /// The public name this client connects to.
    pub fn pipe_name(&self) -> &str {
        &self.shared.pipe_name
    }

    /// Host of the server (`"."` for local).
    pub fn server_name(&self) -> &str {
        &self.shared.options.server_name
    }

    pub fn mode(&self) -> ConnectMode {
        self.shared.mode
    }

    /// Take the event stream. Returns `None` after the first call.
    ///
    /// Events raised before the first call are dropped.
    pub fn take_events(&self) -> Option<PipeEvents<T>> {
        self.shared.events.subscribe()
    }

    /// Install (or clear) the connect hook run on every new connection.
    pub fn set_hook(&self, hook: Option<Arc<dyn ConnectHook<T>>>) {
        store_hook(&self.shared.hook, hook);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current().is_some()
    }

    /// Whether a connect attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::SeqCst)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<PipeConnection<T>>> {
        self.shared.current()
    }

    /// Connect to the server.
    ///
    /// Waits for the server's endpoint to appear; bound the wait with
    /// `tokio::time::timeout`. Returns immediately when already connected.
    /// With `auto_reconnect` this also arms the reconnect timer, which keeps
    /// the client connected until `disconnect()`.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.options.auto_reconnect {
            self.arm_reconnect();
        }
        self.shared.connect().await
    }

    /// Send one message, connecting first when `auto_reconnect` is set.
    pub async fn write(&self, value: Option<&T>) -> Result<()> {
        if self.shared.options.auto_reconnect && self.shared.current().is_none() {
            self.connect().await?;
        }
        match self.shared.current() {
            Some(connection) => connection.write(value).await,
            None => Err(PipeError::not_connected(&self.shared.pipe_name)),
        }
    }

    /// Stop reconnecting and close the connection. Idempotent.
    pub async fn disconnect(&self) {
        let timer = match self.reconnect.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(timer) = timer {
            timer.stop().await;
        }

        let connection = self.shared.take();
        if let Some(connection) = connection {
            connection.stop().await;
            info!("Disconnected from {}", connection.pipe_name());
        }
    }

    fn arm_reconnect(&self) {
        let mut timer = match self.reconnect.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if timer.as_ref().is_some_and(|w| w.is_running()) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let error_events = self.shared.events.clone();
        *timer = Some(Worker::spawn(
            format!("{} reconnect timer", self.shared.pipe_name),
            move |token| shared.reconnect_loop(token),
            move |e| error_events.error(None, e),
        ));
        debug!("Armed reconnect timer for {}", self.shared.pipe_name);
    }
}

impl<T> ClientShared<T>
where
    T: Send + Sync + 'static,
{
    /// The live connection, dropping one that has gone away.
    fn current(&self) -> Option<Arc<PipeConnection<T>>> {
        let mut guard = match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref().is_some_and(|c| !c.is_connected()) {
            *guard = None;
        }
        guard.clone()
    }

    fn store(&self, connection: Arc<PipeConnection<T>>) {
        match self.connection.lock() {
            Ok(mut guard) => *guard = Some(connection),
            Err(poisoned) => *poisoned.into_inner() = Some(connection),
        }
    }

    fn take(&self) -> Option<Arc<PipeConnection<T>>> {
        match self.connection.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn connect(&self) -> Result<()> {
        if self.current().is_some() {
            return Ok(());
        }
        let _serialized = self.connect_lock.lock().await;
        if self.current().is_some() {
            return Ok(());
        }
        let _connecting = ConnectingGuard::new(&self.connecting);

        let connection = self.open().await?;

        if let Some(hook) = load_hook(&self.hook) {
            if let Err(e) = hook.on_connected(&connection).await {
                warn!("Connect hook failed on {}: {}", connection.pipe_name(), e);
                connection.stop().await;
                return Err(e);
            }
        }

        self.store(Arc::clone(&connection));
        self.events.connected(Arc::clone(&connection));
        connection.start(self.events.clone())?;
        info!("Connected to {} via {}", self.pipe_name, connection.pipe_name());
        Ok(())
    }

    /// Open the data channel for the configured mode.
    async fn open(&self) -> Result<Arc<PipeConnection<T>>> {
        let server_name = &self.options.server_name;
        let max = self.options.max_message_size;

        let (data_name, stream) = match self.mode {
            ConnectMode::Direct => {
                let stream = platform::connect_when_available(&self.pipe_name, server_name).await?;
                (self.pipe_name.clone(), stream)
            }
            ConnectMode::Handshake => {
                let rendezvous =
                    platform::connect_when_available(&self.pipe_name, server_name).await?;
                let data_name = self.read_data_name(rendezvous).await?;
                let stream = platform::connect(&data_name, server_name)
                    .await
                    .map_err(|e| PipeError::Handshake {
                        pipe_name: data_name.clone(),
                        message: format!("failed to open data pipe: {}", e),
                    })?;
                (data_name, stream)
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(PipeConnection::new(
            id,
            data_name,
            server_name.clone(),
            FramedStream::with_max_message_size(stream, max),
            Arc::clone(&self.formatter),
        )))
    }

    /// Read the data name the server assigned on the rendezvous channel.
    async fn read_data_name(&self, rendezvous: platform::ClientStream) -> Result<String> {
        let rendezvous = FramedStream::with_max_message_size(rendezvous, PipeConfig::MAX_MESSAGE_SIZE);
        let reply = rendezvous.read().await;
        rendezvous.close().await;

        let handshake_error = |message: &str| PipeError::Handshake {
            pipe_name: self.pipe_name.clone(),
            message: message.to_string(),
        };

        let bytes = reply?.ok_or_else(|| handshake_error("server closed before naming a data pipe"))?;
        let data_name =
            String::from_utf8(bytes).map_err(|_| handshake_error("data pipe name is not UTF-8"))?;
        validate_name(&data_name).map_err(|e| handshake_error(&e.to_string()))?;
        debug!("Server {} assigned {}", self.pipe_name, data_name);
        Ok(data_name)
    }

    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let interval = self.options.reconnection_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(PipeError::Cancelled),
                _ = ticker.tick() => {}
            }
            if self.connecting.load(Ordering::SeqCst) || self.current().is_some() {
                continue;
            }

            let attempt = tokio::select! {
                _ = token.cancelled() => return Err(PipeError::Cancelled),
                attempt = tokio::time::timeout(interval, self.connect()) => attempt,
            };
            match attempt {
                Err(_) => {}
                Ok(Ok(())) => debug!("Reconnected to {}", self.pipe_name),
                Ok(Err(e)) => {
                    warn!("Reconnecting to {} failed, giving up: {}", self.pipe_name, e);
                    return Err(e);
                }
            }
        }
    }
}

impl<T> Drop for PipeClient<T> {
    fn drop(&mut self) {
        if let Ok(guard) = self.shared.connection.lock() {
            if let Some(connection) = guard.as_ref() {
                connection.cancel();
            }
        }
    }
}

impl<T> std::fmt::Debug for PipeClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeClient")
            .field("pipe_name", &self.shared.pipe_name)
            .field("mode", &self.shared.mode)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
