//! Multi-client pipe server.
//!
//! Listens on a fixed public endpoint name and gives every peer its own
//! private data endpoint through the rendezvous handshake:
//!
//! 1. a peer connects to the public endpoint;
//! 2. the server binds `{public}_{n}` and sends that name as one frame;
//! 3. the peer reconnects on the data endpoint, which is then released.
//!
//! The public endpoint is free again as soon as step 2 finishes, so one
//! server handles any number of peers without them sharing a channel.
//!
//! # Thread Safety
//!
//! The accept loop runs in a [`Worker`]. Connection promotion (waiting on
//! the data endpoint, running the connect hook, starting the read loop)
//! happens in tasks tracked by a `JoinSet` owned by the accept loop, so a
//! slow peer never stalls the others and `stop()` leaves nothing behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::connection::{load_hook, store_hook, ConnectHook, HookSlot, PipeConnection};
use super::protocol::FramedStream;
use crate::cancel::CancellationToken;
use crate::config::{PipeConfig, ServerOptions};
use crate::error::{PipeError, Result};
use crate::events::{EventSender, PipeEvents};
use crate::formatter::{JsonFormatter, SharedFormatter};
use crate::platform::{data_endpoint_name, validate_name, PipeListener};
use crate::retry::RetryConfig;
use crate::worker::Worker;

/// Bind a public endpoint name, applying the endpoint initialization hook.
///
/// With `wait_free_pipe` a name owned by someone else is retried with
/// backoff until it frees up; drop the future to give up.
pub(crate) async fn bind_public_endpoint(
    pipe_name: &str,
    options: &ServerOptions,
) -> Result<PipeListener> {
    let mut backoff = RetryConfig::default().backoff();
    loop {
        match PipeListener::bind(pipe_name) {
            Ok(listener) => {
                init_endpoint(&listener, options)?;
                return Ok(listener);
            }
            Err(e) => {
                let err = PipeError::from_bind(e, pipe_name);
                if !(options.wait_free_pipe && err.is_retryable()) {
                    return Err(err);
                }
                if backoff.attempts() == 0 {
                    info!("Pipe {} is busy, waiting for it to become free: {}", pipe_name, err);
                }
                backoff.sleep().await;
            }
        }
    }
}

pub(crate) fn init_endpoint(listener: &PipeListener, options: &ServerOptions) -> Result<()> {
    if let Some(init) = &options.endpoint_init {
        init(listener).map_err(|e| PipeError::Io {
            message: format!("Failed to initialize endpoint {}: {}", listener.name(), e),
            source: Some(e),
        })?;
    }
    Ok(())
}

/// Fold per-connection write results into one `Broadcast` error.
pub(crate) fn aggregate(results: Vec<Result<()>>) -> Result<()> {
    let total = results.len();
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err().map(|e| e.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PipeError::Broadcast {
            failed: errors.len(),
            total,
            errors,
        })
    }
}

/// State shared between the server handle and its accept loop.
struct ServerShared<T> {
    pipe_name: String,
    options: ServerOptions,
    formatter: SharedFormatter<T>,
    connections: Mutex<Vec<Arc<PipeConnection<T>>>>,
    hook: HookSlot<T>,
    events: EventSender<T>,
    next_id: AtomicU64,
}

/// A server accepting many clients on one public pipe name.
pub struct PipeServer<T> {
    shared: Arc<ServerShared<T>>,
    worker: AsyncMutex<Option<Worker>>,
    start_lock: AsyncMutex<()>,
}

impl<T> PipeServer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Server for `pipe_name` using JSON and default options.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self::with_options(pipe_name, JsonFormatter::shared(), ServerOptions::default())
    }
}

impl<T> PipeServer<T>
where
    T: Send + Sync + 'static,
{
    /// Server for `pipe_name` with a custom formatter and options.
    pub fn with_options(
        pipe_name: impl Into<String>,
        formatter: SharedFormatter<T>,
        options: ServerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                pipe_name: pipe_name.into(),
                options,
                formatter,
                connections: Mutex::new(Vec::new()),
                hook: std::sync::RwLock::new(None),
                events: EventSender::detached(),
                next_id: AtomicU64::new(1),
            }),
            worker: AsyncMutex::new(None),
            start_lock: AsyncMutex::new(()),
        }
    }

    /// The public endpoint name.
    pub fn pipe_name(&self) -> &str {
        &self.shared.pipe_name
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

    /// Whether the accept loop is running.
    pub async fn is_started(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    /// Claim the public name and start accepting peers.
    ///
    /// Returns once the endpoint is bound. Fails with `AlreadyStarted` if the
    /// server is running and `NameConflict` if another server owns the name
    /// (unless `wait_free_pipe` is set).
    ///
    /// Concurrent calls are serialized. `stop()` and `is_started()` do not
    /// wait for a bind in progress.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.start_lock.lock().await;
        if self.is_started().await {
            return Err(PipeError::AlreadyStarted {
                what: "Pipe server".into(),
                pipe_name: self.shared.pipe_name.clone(),
            });
        }

        validate_name(&self.shared.pipe_name)?;
        let listener = bind_public_endpoint(&self.shared.pipe_name, &self.shared.options).await?;
        info!("Pipe server listening on {}", self.shared.pipe_name);

        let shared = Arc::clone(&self.shared);
        let error_events = self.shared.events.clone();
        let pipe_name = self.shared.pipe_name.clone();
        *self.worker.lock().await = Some(Worker::spawn(
            format!("{} accept loop", self.shared.pipe_name),
            move |token| shared.accept_loop(listener, token),
            move |e| {
                error!("Pipe server {} accept loop failed: {}", pipe_name, e);
                error_events.error(None, e);
            },
        ));
        Ok(())
    }

    /// Stop accepting, then stop every connection.
    ///
    /// Idempotent. The server may be started again afterwards.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
            info!("Pipe server {} stopped accepting", self.shared.pipe_name);
        }

        let connections = match self.shared.connections.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        join_all(connections.iter().map(|c| c.stop())).await;
    }

    /// Snapshot of the connection set, in connect order.
    pub fn connections(&self) -> Vec<Arc<PipeConnection<T>>> {
        self.shared.snapshot()
    }

    /// Data endpoint names of the live connections.
    pub fn connected_pipe_names(&self) -> Vec<String> {
        self.shared
            .snapshot()
            .into_iter()
            .filter(|c| c.is_connected())
            .map(|c| c.pipe_name().to_string())
            .collect()
    }

    /// Send `value` to every live connection.
    pub async fn write(&self, value: Option<&T>) -> Result<()> {
        self.write_where(value, |_| true).await
    }

    /// Send `value` to the live connection on `pipe_name`.
    pub async fn write_to(&self, pipe_name: &str, value: Option<&T>) -> Result<()> {
        self.write_where(value, |c| c.pipe_name() == pipe_name).await
    }

    /// Send `value` to every live connection accepted by `predicate`.
    ///
    /// All writes run concurrently; the call returns once every attempt has
    /// completed. Failures are collected into one `Broadcast` error.
    pub async fn write_where<F>(&self, value: Option<&T>, predicate: F) -> Result<()>
    where
        F: Fn(&PipeConnection<T>) -> bool,
    {
        let targets: Vec<_> = self
            .shared
            .snapshot()
            .into_iter()
            .filter(|c| c.is_connected() && predicate(&**c))
            .collect();
        if targets.is_empty() {
            debug!("No live connections on {} to write to", self.shared.pipe_name);
            return Ok(());
        }

        let results = join_all(targets.iter().map(|c| c.write(value))).await;
        aggregate(results)
    }
}

impl<T> ServerShared<T>
where
    T: Send + Sync + 'static,
{
    fn snapshot(&self) -> Vec<Arc<PipeConnection<T>>> {
        match self.connections.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn insert(&self, connection: Arc<PipeConnection<T>>) {
        let mut connections = match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        connections.retain(|c| c.is_connected());
        connections.push(connection);
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: PipeListener,
        token: CancellationToken,
    ) -> Result<()> {
        let mut promotions = JoinSet::new();
        let mut backoff = RetryConfig::default().backoff();

        let result = loop {
            while promotions.try_join_next().is_some() {}

            let accepted = tokio::select! {
                _ = token.cancelled() => break Err(PipeError::Cancelled),
                accepted = listener.accept() => accepted,
            };

            let rendezvous = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Pipe server {} accept error: {}", self.pipe_name, e);
                    if backoff.wait(&token).await.is_err() {
                        break Err(PipeError::Cancelled);
                    }
                    continue;
                }
            };

            let handshake = tokio::select! {
                _ = token.cancelled() => break Err(PipeError::Cancelled),
                handshake = self.handshake(rendezvous) => handshake,
            };

            match handshake {
                Ok((id, data_name, data_listener)) => {
                    backoff = RetryConfig::default().backoff();
                    let shared = Arc::clone(&self);
                    promotions.spawn(shared.promote(id, data_name, data_listener));
                }
                Err(e) => {
                    warn!("Pipe server {} handshake failed: {}", self.pipe_name, e);
                    self.events.error(None, e);
                    if backoff.wait(&token).await.is_err() {
                        break Err(PipeError::Cancelled);
                    }
                }
            }
        };

        promotions.shutdown().await;
        debug!("Pipe server {} accept loop exited", self.pipe_name);
        result
    }

    /// Allocate a data endpoint and tell the peer its name.
    ///
    /// The data endpoint is bound before the name is sent, so the peer can
    /// connect the moment it reads it.
    async fn handshake(
        &self,
        rendezvous: crate::platform::PipeStream,
    ) -> Result<(u64, String, PipeListener)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let data_name = data_endpoint_name(&self.pipe_name, id);

        let data_listener =
            PipeListener::bind(&data_name).map_err(|e| PipeError::from_bind(e, &data_name))?;
        init_endpoint(&data_listener, &self.options)?;

        // The name frame ignores the message limit, which may be shorter than the name.
        let stream = FramedStream::with_max_message_size(rendezvous, PipeConfig::MAX_MESSAGE_SIZE);
        stream.write(data_name.as_bytes()).await?;
        stream.close().await;

        debug!("Pipe server {} assigned {}", self.pipe_name, data_name);
        Ok((id, data_name, data_listener))
    }

    /// Wait for the peer on its data endpoint and bring the connection up.
    async fn promote(self: Arc<Self>, id: u64, data_name: String, data_listener: PipeListener) {
        let accepted =
            tokio::time::timeout(self.options.handshake_timeout, data_listener.accept()).await;
        drop(data_listener);

        let stream = match accepted {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Pipe server {} failed to accept {}: {}", self.pipe_name, data_name, e);
                self.events.error(None, e.into());
                return;
            }
            Err(_) => {
                warn!("Peer never connected to {}", data_name);
                self.events.error(
                    None,
                    PipeError::Handshake {
                        pipe_name: data_name,
                        message: format!(
                            "peer did not connect within {:?}",
                            self.options.handshake_timeout
                        ),
                    },
                );
                return;
            }
        };

        let connection = Arc::new(PipeConnection::new(
            id,
            data_name,
            PipeConfig::LOCAL_SERVER,
            FramedStream::with_max_message_size(stream, self.options.max_message_size),
            Arc::clone(&self.formatter),
        ));

        if let Some(hook) = load_hook(&self.hook) {
            if let Err(e) = hook.on_connected(&connection).await {
                warn!("Connect hook failed on {}: {}", connection.pipe_name(), e);
                connection.stop().await;
                self.events.error(Some(connection), e);
                return;
            }
        }

        self.insert(Arc::clone(&connection));
        self.events.connected(Arc::clone(&connection));
        if let Err(e) = connection.start(self.events.clone()) {
            self.events.error(Some(Arc::clone(&connection)), e);
            return;
        }
        info!("Client connected on {}", connection.pipe_name());
    }
}

impl<T> std::fmt::Debug for PipeServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeServer")
            .field("pipe_name", &self.shared.pipe_name)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
