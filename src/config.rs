//! Configuration file format and merging with command-line values

use anyhow::{Context, Result};
use backhaul_agent::{AgentConfig, DEFAULT_RETRY_DELAY};
use backhaul_transport_websocket::{parse_url, WebSocketConfig};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration file format
///
/// ```yaml
/// relay:
///   listen: 0.0.0.0:8765
///   path: /tunnel
/// agent:
///   relay: wss://relay.example.com/tunnel
///   backend: ws://127.0.0.1:8000
///   retry_delay: 5
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    pub listen: Option<SocketAddr>,
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    pub relay: Option<String>,
    pub backend: Option<String>,
    /// Seconds
    pub retry_delay: Option<u64>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Resolved relay settings
#[derive(Debug)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub websocket: WebSocketConfig,
}

/// Merge relay flags with the config file, giving precedence to flags
pub fn relay_settings(
    listen: Option<SocketAddr>,
    path: Option<String>,
    file: Option<&ConfigFile>,
) -> Result<RelaySettings> {
    let section = file.map(|f| &f.relay);

    let listen = listen
        .or_else(|| section.and_then(|s| s.listen))
        .context("Listen address is required (use --listen or config file)")?;

    let path = path.or_else(|| section.and_then(|s| s.path.clone()));
    let websocket = match path {
        Some(path) => WebSocketConfig::default().with_path(path),
        None => WebSocketConfig::default(),
    };
    websocket.validate().context("Invalid WebSocket path")?;

    Ok(RelaySettings { listen, websocket })
}

/// Merge agent flags with the config file, giving precedence to flags
pub fn agent_config(
    relay: Option<String>,
    backend: Option<String>,
    retry_delay: Option<u64>,
    file: Option<&ConfigFile>,
) -> Result<AgentConfig> {
    let section = file.map(|f| &f.agent);

    let relay = relay
        .or_else(|| section.and_then(|s| s.relay.clone()))
        .context("Relay URL is required (use --relay or config file)")?;
    let backend = backend
        .or_else(|| section.and_then(|s| s.backend.clone()))
        .context("Backend URL is required (use --backend or config file)")?;

    validate_url(&relay, "relay")?;
    validate_url(&backend, "backend")?;

    let retry_delay = retry_delay
        .or_else(|| section.and_then(|s| s.retry_delay))
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_DELAY);
    if retry_delay.is_zero() {
        anyhow::bail!("Retry delay must be at least one second");
    }

    Ok(AgentConfig::new(relay, backend).with_retry_delay(retry_delay))
}

/// Validate a WebSocket endpoint (ws:// or wss:// with a host)
fn validate_url(url: &str, kind: &str) -> Result<()> {
    parse_url(url).with_context(|| format!("Invalid {} URL: '{}'", kind, url))?;
    Ok(())
}
