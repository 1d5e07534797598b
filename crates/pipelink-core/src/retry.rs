//! Backoff delays for transiently busy endpoints.
//!
//! Used when a public name is still claimed (`wait_free_pipe`), when an
//! accept fails, and while a client waits for an endpoint to appear.

use rand::Rng;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};

/// Growth curve for a sequence of retry delays.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// No delay exceeds this, jitter included.
    pub max_delay: Duration,
    /// Factor applied per attempt.
    pub growth: f64,
}

impl Default for RetryConfig {
    /// Waiting on a busy name or a failing accept.
    fn default() -> Self {
        Self {
            base_delay: PipeConfig::BUSY_RETRY_DELAY,
            max_delay: PipeConfig::BUSY_RETRY_MAX_DELAY,
            growth: 2.0,
        }
    }
}

impl RetryConfig {
    /// Polling for an endpoint that does not exist yet.
    pub fn connect_poll() -> Self {
        Self {
            base_delay: PipeConfig::CONNECT_POLL_INTERVAL,
            max_delay: PipeConfig::CONNECT_POLL_MAX_DELAY,
            growth: 1.5,
        }
    }

    /// Undithered delay for `attempt` (0-indexed).
    fn nominal_delay(&self, attempt: u32) -> f64 {
        let grown = self.base_delay.as_secs_f64() * self.growth.powi(attempt.min(32) as i32);
        grown.min(self.max_delay.as_secs_f64())
    }

    /// Delay for `attempt`, dithered to 50..150% so waiters racing for the
    /// same name spread out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let dither: f64 = rand::rng().random_range(0.5..1.5);
        let secs = (self.nominal_delay(attempt) * dither).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Start a fresh backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            attempt: 0,
        }
    }
}

/// Stateful walk through a [`RetryConfig`]'s delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Sleep for the next delay, returning `Cancelled` if the token fires first.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<()> {
        let delay = self.next_delay();
        tokio::select! {
            _ = token.cancelled() => Err(PipeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Sleep for the next delay.
    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
