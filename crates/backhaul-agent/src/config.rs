use std::time::Duration;

/// Delay between relay connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay endpoint (a `ws://` or `wss://` URL for WebSocket)
    pub relay_url: String,

    /// Backend endpoint dialed once per client
    pub backend_url: String,

    /// Fixed pause before every reconnection attempt
    pub retry_delay: Duration,
}

impl AgentConfig {
    pub fn new(relay_url: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            backend_url: backend_url.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}
