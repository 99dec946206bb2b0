//! WebSocket transport configuration

use backhaul_transport::{TransportError, TransportResult};
use std::time::Duration;

/// How long a client may take to complete its upgrade request
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Request path the listener upgrades. `/` accepts every path.
    pub path: String,
    /// Connections that have not finished the upgrade by then are dropped
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl WebSocketConfig {
    /// Only upgrade requests on `path`
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "WebSocket handshake timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a request for `request_path` should be upgraded
    pub fn accepts_path(&self, request_path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        let expected = self.path.trim_end_matches('/');
        request_path == expected || request_path.trim_end_matches('/') == expected
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider before the first `wss://` handshake
pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
