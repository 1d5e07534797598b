//! Single-client pipe server.
//!
//! Serves one peer at a time directly on the public endpoint, without the
//! rendezvous handshake. Pair it with [`PipeClient::direct`](super::PipeClient::direct).
//! After the peer disconnects the endpoint is bound again for the next one.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::connection::{load_hook, store_hook, ConnectHook, HookSlot, PipeConnection};
use super::protocol::FramedStream;
use super::server::{bind_public_endpoint, init_endpoint};
use crate::cancel::CancellationToken;
use crate::config::{PipeConfig, ServerOptions};
use crate::error::{PipeError, Result};
use crate::events::{EventSender, PipeEvents};
use crate::formatter::{JsonFormatter, SharedFormatter};
use crate::platform::{validate_name, PipeListener};
use crate::retry::RetryConfig;
use crate::worker::Worker;

struct SingleShared<T> {
    pipe_name: String,
    options: ServerOptions,
    formatter: SharedFormatter<T>,
    current: Mutex<Option<Arc<PipeConnection<T>>>>,
    hook: HookSlot<T>,
    events: EventSender<T>,
}

/// A server that talks to one client at a time on its public pipe name.
pub struct SingleConnectionPipeServer<T> {
    shared: Arc<SingleShared<T>>,
    worker: AsyncMutex<Option<Worker>>,
    start_lock: AsyncMutex<()>,
}

impl<T> SingleConnectionPipeServer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self::with_options(pipe_name, JsonFormatter::shared(), ServerOptions::default())
    }
}

impl<T> SingleConnectionPipeServer<T>
where
    T: Send + Sync + 'static,
{
    pub fn with_options(
        pipe_name: impl Into<String>,
        formatter: SharedFormatter<T>,
        options: ServerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(SingleShared {
                pipe_name: pipe_name.into(),
                options,
                formatter,
                current: Mutex::new(None),
                hook: std::sync::RwLock::new(None),
                events: EventSender::detached(),
            }),
            worker: AsyncMutex::new(None),
            start_lock: AsyncMutex::new(()),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.shared.pipe_name
    }

    /// Take the event stream. Returns `None` after the first call.
    ///
    /// Events raised before the first call are dropped.
    pub fn take_events(&self) -> Option<PipeEvents<T>> {
        self.shared.events.subscribe()
    }

    pub fn set_hook(&self, hook: Option<Arc<dyn ConnectHook<T>>>) {
        store_hook(&self.shared.hook, hook);
    }

    pub async fn is_started(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    /// The connected client, if any.
    pub fn connection(&self) -> Option<Arc<PipeConnection<T>>> {
        self.shared.current().filter(|c| c.is_connected())
    }

    /// Claim the public name and start serving.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.start_lock.lock().await;
        if self.is_started().await {
            return Err(PipeError::AlreadyStarted {
                what: "Single connection pipe server".into(),
                pipe_name: self.shared.pipe_name.clone(),
            });
        }

        validate_name(&self.shared.pipe_name)?;
        let listener = bind_public_endpoint(&self.shared.pipe_name, &self.shared.options).await?;
        info!("Single connection pipe server listening on {}", self.shared.pipe_name);

        let shared = Arc::clone(&self.shared);
        let error_events = self.shared.events.clone();
        *self.worker.lock().await = Some(Worker::spawn(
            format!("{} serve loop", self.shared.pipe_name),
            move |token| shared.serve_loop(listener, token),
            move |e| error_events.error(None, e),
        ));
        Ok(())
    }

    /// Stop serving and disconnect the current client. Idempotent.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
            info!("Single connection pipe server {} stopped", self.shared.pipe_name);
        }
        let current = self.shared.take_current();
        if let Some(connection) = current {
            connection.stop().await;
        }
    }

    /// Send `value` to the current client.
    ///
    /// Returns `Ok(())` without sending when no client is connected.
    pub async fn write(&self, value: Option<&T>) -> Result<()> {
        match self.connection() {
            Some(connection) => connection.write(value).await,
            None => {
                debug!("No client on {}, dropping message", self.shared.pipe_name);
                Ok(())
            }
        }
    }
}

impl<T> SingleShared<T>
where
    T: Send + Sync + 'static,
{
    fn current(&self) -> Option<Arc<PipeConnection<T>>> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current(&self, connection: Option<Arc<PipeConnection<T>>>) {
        match self.current.lock() {
            Ok(mut guard) => *guard = connection,
            Err(poisoned) => *poisoned.into_inner() = connection,
        }
    }

    fn take_current(&self) -> Option<Arc<PipeConnection<T>>> {
        match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Accept, serve until the client leaves, rebind, repeat.
    async fn serve_loop(self: Arc<Self>, listener: PipeListener, token: CancellationToken) -> Result<()> {
        let mut listener = Some(listener);
        let mut next_id: u64 = 1;

        loop {
            let bound = match listener.take() {
                Some(bound) => bound,
                None => self.rebind(&token).await?,
            };

            let accepted = tokio::select! {
                _ = token.cancelled() => return Err(PipeError::Cancelled),
                accepted = bound.accept() => accepted,
            };
            drop(bound);

            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Accept failed on {}: {}", self.pipe_name, e);
                    self.events.error(None, e.into());
                    RetryConfig::default().backoff().wait(&token).await?;
                    continue;
                }
            };

            let connection = Arc::new(PipeConnection::new(
                next_id,
                self.pipe_name.clone(),
                PipeConfig::LOCAL_SERVER,
                FramedStream::with_max_message_size(stream, self.options.max_message_size),
                Arc::clone(&self.formatter),
            ));
            next_id += 1;

            let served = tokio::select! {
                _ = token.cancelled() => Err(PipeError::Cancelled),
                served = self.serve(&connection) => served,
            };
            connection.stop().await;
            self.set_current(None);
            served?;
        }
    }

    async fn serve(&self, connection: &Arc<PipeConnection<T>>) -> Result<()> {
        if let Some(hook) = load_hook(&self.hook) {
            if let Err(e) = hook.on_connected(connection).await {
                warn!("Connect hook failed on {}: {}", self.pipe_name, e);
                self.events.error(Some(Arc::clone(connection)), e);
                return Ok(());
            }
        }

        self.set_current(Some(Arc::clone(connection)));
        self.events.connected(Arc::clone(connection));
        connection.start(self.events.clone())?;
        info!("Client connected on {}", self.pipe_name);

        connection.closed().await;
        debug!("Client left {}", self.pipe_name);
        Ok(())
    }

    /// Claim the public name again after a client left.
    async fn rebind(&self, token: &CancellationToken) -> Result<PipeListener> {
        let mut backoff = RetryConfig::default().backoff();
        loop {
            token.check()?;
            match PipeListener::bind(&self.pipe_name) {
                Ok(listener) => {
                    init_endpoint(&listener, &self.options)?;
                    return Ok(listener);
                }
                Err(e) => {
                    let err = PipeError::from_bind(e, &self.pipe_name);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!("Failed to rebind {}: {}", self.pipe_name, err);
                    backoff.wait(token).await?;
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for SingleConnectionPipeServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleConnectionPipeServer")
            .field("pipe_name", &self.shared.pipe_name)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
