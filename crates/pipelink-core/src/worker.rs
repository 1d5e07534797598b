//! Cancellable background tasks.
//!
//! Every long-running loop in the transport (connection read loops, server
//! accept loops, the client reconnect timer) runs inside a [`Worker`]. A
//! worker owns its task: `stop()` cancels it and waits for it to actually
//! finish, and dropping the worker cancels it. Tasks are never detached.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::cancel::CancellationToken;
use crate::error::{PipeError, Result};

/// Handle to a running background task.
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn `task` immediately on the tokio runtime.
    ///
    /// The task receives the worker's cancellation token. A `Cancelled`
    /// result is the expected outcome of `stop()` and is discarded; any other
    /// error, or a panic, is handed to `on_error`.
    pub fn spawn<F, Fut, E>(name: impl Into<String>, task: F, on_error: E) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
        E: Fn(PipeError) + Send + Sync + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let future = task(token.clone());

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::spawn(future).await;
            match outcome {
                Ok(Ok(())) => debug!("Worker {} finished", task_name),
                Ok(Err(e)) if e.is_cancelled() => debug!("Worker {} cancelled", task_name),
                Ok(Err(e)) => on_error(e),
                Err(join_error) if join_error.is_cancelled() => {
                    debug!("Worker {} aborted", task_name)
                }
                Err(join_error) => {
                    error!("Worker {} panicked: {}", task_name, join_error);
                    on_error(PipeError::Other(format!(
                        "worker {} panicked: {}",
                        task_name, join_error
                    )));
                }
            }
        });

        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Name given at spawn time, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|h| !h.is_finished()),
            Err(_) => false,
        }
    }

    /// Request cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the task and wait for it to finish.
    ///
    /// Calling `stop` again after the first call returns immediately.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("Worker {} join failed: {}", self.name, e);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_handler() -> (Arc<AtomicUsize>, impl Fn(PipeError) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = count.clone();
        (count, move |_e: PipeError| {
            handler_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_stop_cancels_and_waits() {
        let finished = Arc::new(AtomicUsize::new(0));
        let (errors, on_error) = counting_handler();

        let worker = {
            let finished = finished.clone();
            Worker::spawn(
                "loop",
                move |token| async move {
                    token.cancelled().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Err(PipeError::Cancelled)
                },
                on_error,
            )
        };

        assert!(worker.is_running());
        worker.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_errors, on_error) = counting_handler();
        let worker = Worker::spawn("idle", |token| async move {
            token.cancelled().await;
            Ok(())
        }, on_error);

        worker.stop().await;
        tokio::time::timeout(Duration::from_millis(100), worker.stop())
            .await
            .expect("second stop should return immediately");
    }

    #[tokio::test]
    async fn test_errors_are_forwarded() {
        let (errors, on_error) = counting_handler();
        let worker = Worker::spawn(
            "failing",
            |_token| async move { Err(PipeError::Other("boom".into())) },
            on_error,
        );

        worker.stop().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panics_are_forwarded() {
        let (errors, on_error) = counting_handler();
        let worker = Worker::spawn(
            "panicking",
            |_token| async move {
                if true {
                    panic!("worker exploded");
                }
                Ok(())
            },
            on_error,
        );

        worker.stop().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_cancels_task() {
        let (_errors, on_error) = counting_handler();
        let token_seen = Arc::new(std::sync::Mutex::new(None));

        let worker = {
            let token_seen = token_seen.clone();
            Worker::spawn(
                "dropped",
                move |token| {
                    *token_seen.lock().unwrap() = Some(token.clone());
                    async move {
                        token.cancelled().await;
                        Ok(())
                    }
                },
                on_error,
            )
        };
        drop(worker);

        let token = token_seen.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }
}
