//! Multi-tunnel manager
//!
//! Starts one independent tunnel per device defined in the configuration
//! file and closes all of them on Ctrl+C.

use crate::config::OutpostConfig;
use crate::tunnel::TunnelClient;
use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::info;

/// Manages the tunnels of several devices sharing one domain
pub struct TunnelManager {
    config: OutpostConfig,
    tunnels: Vec<TunnelClient>,
}

impl TunnelManager {
    pub fn new(config: OutpostConfig) -> Self {
        Self {
            config,
            tunnels: Vec::new(),
        }
    }

    /// Start all tunnels defined in the configuration
    pub fn start_all(&mut self) {
        info!(
            "Starting {} tunnel(s) via {}",
            self.config.tunnels.len(),
            self.config.relay
        );

        for tunnel_conf in self.config.tunnel_configs() {
            info!(
                "  {} -> {}:{}",
                tunnel_conf.device, tunnel_conf.local_host, tunnel_conf.local_port
            );
            self.tunnels.push(TunnelClient::start(tunnel_conf));
        }
    }

    pub fn tunnels(&self) -> &[TunnelClient] {
        &self.tunnels
    }

    /// Close every tunnel and wait for them to stop
    pub async fn close_all(&self) {
        for tunnel in &self.tunnels {
            tunnel.close();
        }
        join_all(self.tunnels.iter().map(|t| t.closed())).await;
    }

    /// Wait for Ctrl+C, then shut everything down
    pub async fn wait_for_shutdown(self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Shutting down all tunnels...");
        self.close_all().await;
        info!("All tunnels stopped");
        Ok(())
    }
}
