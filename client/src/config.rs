//! Configuration for Outpost tunnels
//!
//! `TunnelConfig` is the immutable per-tunnel configuration handed to
//! [`TunnelClient::start`](crate::TunnelClient::start). `OutpostConfig`
//! is the outpost.yml file format, which can describe several devices
//! sharing one domain.

use anyhow::{Context, Result};
use outpost_shared::protocol::Visibility;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RELAY: &str = "ws://localhost:8080/tunnel";
pub const DEFAULT_DEVICE: &str = "default";
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Reconnect intervals at or below this value disable reconnecting
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Immutable configuration of a single tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Relay WebSocket URL (ws:// or wss://)
    pub relay: String,
    pub domain: String,
    pub secret: String,
    /// Device name, used as path prefix when this device is not primary
    pub device: String,
    pub visibility: Visibility,
    pub local_host: String,
    pub local_port: u16,
    /// Heartbeat period; zero disables the heartbeat
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
    /// Write request chunks that arrive during an exchange straight to the
    /// open local connection instead of queueing them
    pub stream_requests: bool,
    /// Log payload previews
    pub debug: bool,
}

impl TunnelConfig {
    pub fn new(relay: impl Into<String>, domain: impl Into<String>, secret: impl Into<String>, local_port: u16) -> Self {
        Self {
            relay: relay.into(),
            domain: domain.into(),
            secret: secret.into(),
            device: DEFAULT_DEVICE.to_string(),
            visibility: Visibility::Public,
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            local_port,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            stream_requests: false,
            debug: false,
        }
    }

    /// Externally reachable address for this device
    pub fn public_url(&self, primary: bool) -> String {
        if primary {
            format!("https://{}/", self.domain)
        } else {
            format!("https://{}/{}/", self.domain, self.device)
        }
    }

    /// Heartbeat period, `None` when the heartbeat is disabled
    pub fn heartbeat(&self) -> Option<Duration> {
        (!self.ping_interval.is_zero()).then_some(self.ping_interval)
    }

    /// Whether a dropped connection should be retried
    pub fn reconnects(&self) -> bool {
        self.reconnect_interval > MIN_RECONNECT_INTERVAL
    }
}

/// Root configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutpostConfig {
    /// Relay server URL
    #[serde(default = "default_relay")]
    pub relay: String,

    pub domain: Option<String>,

    pub secret: Option<String>,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// 0 disables reconnecting
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    #[serde(default)]
    pub debug: bool,

    /// Devices exposed under the domain
    #[serde(default)]
    pub tunnels: Vec<DeviceConfig>,
}

/// Single device definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device")]
    pub device: String,

    /// Local port to forward traffic to
    pub local_port: u16,

    #[serde(default = "default_true")]
    pub public: bool,

    /// Local hostname to forward to (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Streamed request bodies
    #[serde(default)]
    pub stream: bool,
}

fn default_relay() -> String {
    DEFAULT_RELAY.to_string()
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

impl OutpostConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate YAML configuration
    pub fn parse(content: &str) -> Result<Self> {
        let config: OutpostConfig =
            serde_yaml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.domain.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("`domain` is required");
        }
        if self.secret.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("`secret` is required");
        }
        if self.tunnels.is_empty() {
            anyhow::bail!("No tunnels defined in configuration");
        }

        let mut seen = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.device.is_empty() {
                anyhow::bail!("Device name cannot be empty");
            }
            if !seen.insert(tunnel.device.as_str()) {
                anyhow::bail!("Duplicate device '{}'", tunnel.device);
            }
            if tunnel.local_port == 0 {
                anyhow::bail!("Invalid port 0 for device '{}'", tunnel.device);
            }
        }

        Ok(())
    }

    /// Expand into one `TunnelConfig` per device
    pub fn tunnel_configs(&self) -> Vec<TunnelConfig> {
        let domain = self.domain.clone().unwrap_or_default();
        let secret = self.secret.clone().unwrap_or_default();

        self.tunnels
            .iter()
            .map(|t| TunnelConfig {
                relay: self.relay.clone(),
                domain: domain.clone(),
                secret: secret.clone(),
                device: t.device.clone(),
                visibility: if t.public { Visibility::Public } else { Visibility::Private },
                local_host: t.local_host.clone(),
                local_port: t.local_port,
                ping_interval: Duration::from_millis(self.ping_interval_ms),
                reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
                stream_requests: t.stream,
                debug: self.debug,
            })
            .collect()
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "outpost.yml",
            "outpost.yaml",
            ".outpost.yml",
            ".outpost.yaml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
