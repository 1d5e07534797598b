//! Event stream shared by servers, clients and their connections.
//!
//! Every owner (client or server) holds one [`EventSender`]. Its connections
//! emit into it; the unbounded channel behind it only exists once the
//! application calls `take_events()`, and until then events are dropped.
//! Events from a single connection
//! arrive in order: `Connected`, then messages, then at most one
//! `Disconnected`.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{PipeError, Result};
use crate::ipc::connection::PipeConnection;

/// Something that happened on a connection.
pub enum PipeEvent<T> {
    /// A connection finished its connect hook and its read loop is about to start.
    Connected(Arc<PipeConnection<T>>),
    /// One decoded message. `None` is the "no value" message.
    Message {
        connection: Arc<PipeConnection<T>>,
        message: Option<T>,
    },
    /// The connection closed. Emitted at most once per connection.
    Disconnected(Arc<PipeConnection<T>>),
    /// A failure the owner could not surface as a return value.
    Error {
        connection: Option<Arc<PipeConnection<T>>>,
        error: Arc<PipeError>,
    },
}

impl<T> PipeEvent<T> {
    /// The connection this event concerns, if any.
    pub fn connection(&self) -> Option<&Arc<PipeConnection<T>>> {
        match self {
            PipeEvent::Connected(c) | PipeEvent::Disconnected(c) => Some(c),
            PipeEvent::Message { connection, .. } => Some(connection),
            PipeEvent::Error { connection, .. } => connection.as_ref(),
        }
    }
}

impl<T> Clone for PipeEvent<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        match self {
            PipeEvent::Connected(c) => PipeEvent::Connected(c.clone()),
            PipeEvent::Message {
                connection,
                message,
            } => PipeEvent::Message {
                connection: connection.clone(),
                message: message.clone(),
            },
            PipeEvent::Disconnected(c) => PipeEvent::Disconnected(c.clone()),
            PipeEvent::Error { connection, error } => PipeEvent::Error {
                connection: connection.clone(),
                error: error.clone(),
            },
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PipeEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeEvent::Connected(c) => f.debug_tuple("Connected").field(&c.pipe_name()).finish(),
            PipeEvent::Message {
                connection,
                message,
            } => f
                .debug_struct("Message")
                .field("connection", &connection.pipe_name())
                .field("message", message)
                .finish(),
            PipeEvent::Disconnected(c) => {
                f.debug_tuple("Disconnected").field(&c.pipe_name()).finish()
            }
            PipeEvent::Error { connection, error } => f
                .debug_struct("Error")
                .field("connection", &connection.as_ref().map(|c| c.pipe_name()))
                .field("error", error)
                .finish(),
        }
    }
}

/// Sending side of an owner's event stream.
///
/// Sends never block and never fail loudly: before a receiver has been
/// taken, and after the application drops its [`PipeEvents`], events are
/// discarded.
pub struct EventSender<T> {
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<PipeEvent<T>>>>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> EventSender<T> {
    /// A sender with no receiver yet.
    pub fn detached() -> Self {
        Self {
            tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Attach the receiving side. Returns `None` after the first call.
    pub fn subscribe(&self) -> Option<PipeEvents<T>> {
        let mut slot = match self.tx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(PipeEvents { rx })
    }

    /// Whether a live receiver is attached.
    pub fn is_subscribed(&self) -> bool {
        let slot = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, event: PipeEvent<T>) {
        let slot = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn connected(&self, connection: Arc<PipeConnection<T>>) {
        self.send(PipeEvent::Connected(connection));
    }

    pub fn message(&self, connection: Arc<PipeConnection<T>>, message: Option<T>) {
        self.send(PipeEvent::Message {
            connection,
            message,
        });
    }

    pub fn disconnected(&self, connection: Arc<PipeConnection<T>>) {
        self.send(PipeEvent::Disconnected(connection));
    }

    pub fn error(&self, connection: Option<Arc<PipeConnection<T>>>, error: PipeError) {
        self.send(PipeEvent::Error {
            connection,
            error: Arc::new(error),
        });
    }
}

impl<T> fmt::Debug for EventSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

/// Receiving side of an owner's event stream.
pub struct PipeEvents<T> {
    rx: mpsc::UnboundedReceiver<PipeEvent<T>>,
}

/// Create a connected sender/receiver pair.
pub fn channel<T>() -> (EventSender<T>, PipeEvents<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = EventSender {
        tx: Arc::new(RwLock::new(Some(tx))),
    };
    (sender, PipeEvents { rx })
}

impl<T> PipeEvents<T> {
    /// Next event, or `None` once the owner and all its connections are gone.
    pub async fn recv(&mut self) -> Option<PipeEvent<T>> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PipeEvent<T>> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next message accepted by `predicate`, skipping every other event.
    pub async fn wait_message<F>(
        &mut self,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<(Arc<PipeConnection<T>>, Option<T>)>
    where
        F: FnMut(Option<&T>) -> bool,
    {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if let PipeEvent::Message {
                    connection,
                    message,
                } = event
                {
                    if predicate(message.as_ref()) {
                        return Ok((connection, message));
                    }
                }
            }
            Err(PipeError::Other("event stream closed".into()))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PipeError::Timeout(timeout))?
    }

    /// Wait for the next `Connected` event, skipping every other event.
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<Arc<PipeConnection<T>>> {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if let PipeEvent::Connected(connection) = event {
                    return Ok(connection);
                }
            }
            Err(PipeError::Other("event stream closed".into()))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PipeError::Timeout(timeout))?
    }
}

impl<T> fmt::Debug for PipeEvents<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEvents").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_without_connection() {
        let (tx, mut rx) = channel::<String>();
        tx.error(None, PipeError::Integrity);

        match rx.try_recv() {
            Some(PipeEvent::Error { connection, error }) => {
                assert!(connection.is_none());
                assert!(matches!(*error, PipeError::Integrity));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_silent() {
        let (tx, rx) = channel::<String>();
        drop(rx);
        tx.error(None, PipeError::Cancelled);
    }

    #[tokio::test]
    async fn test_detached_sender_drops_events_until_subscribed() {
        let tx = EventSender::<String>::detached();
        assert!(!tx.is_subscribed());
        tx.error(None, PipeError::Integrity);

        let mut rx = tx.subscribe().unwrap();
        assert!(tx.subscribe().is_none());
        assert!(tx.is_subscribed());
        assert!(rx.try_recv().is_none());

        tx.error(None, PipeError::Cancelled);
        assert!(matches!(
            rx.try_recv(),
            Some(PipeEvent::Error { ref error, .. }) if matches!(**error, PipeError::Cancelled)
        ));

        drop(rx);
        assert!(!tx.is_subscribed());
        tx.error(None, PipeError::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_connected_times_out() {
        let (_tx, mut rx) = channel::<String>();
        let result = rx.wait_connected(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PipeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_message_reports_closed_stream() {
        let (tx, mut rx) = channel::<String>();
        tx.error(None, PipeError::Cancelled);
        drop(tx);
        let result = rx.wait_message(|_| true, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PipeError::Other(_))));
    }
}
