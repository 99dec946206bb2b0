//! Reconnection timing with a fixed delay

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Counts relay connection attempts and spaces them by a fixed delay
#[derive(Debug, Clone)]
pub struct RetryTimer {
    delay: Duration,
    attempt: u64,
}

impl RetryTimer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, attempt: 0 }
    }

    /// Start an attempt and return its number (1-based)
    pub fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }

    /// Wait before the next attempt
    pub async fn wait(&self) {
        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.delay,
            self.attempt + 1
        );
        sleep(self.delay).await;
    }

    /// Reset the counter (call after a successful identify)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
