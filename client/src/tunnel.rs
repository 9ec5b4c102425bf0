//! Public handle of a running tunnel

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::TunnelConfig;
use crate::forward::{self, Forwarder};
use crate::link::{Command, TunnelLink};
use crate::local::LocalLink;
use crate::queue::request_queue;
use crate::session::LinkState;

/// A tunnel between the relay and a local server.
///
/// The tunnel starts connecting as soon as it is created and keeps
/// reconnecting until [`close`](Self::close) is called or the handle is
/// dropped. Must be created inside a Tokio runtime.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LinkState>,
}

impl TunnelClient {
    pub fn start(config: TunnelConfig) -> Self {
        let config = Arc::new(config);
        let (queue_tx, queue_rx) = request_queue();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        let local = LocalLink::new(config.local_host.clone(), config.local_port);
        let forwarder = Forwarder::new(local, queue_rx, outbound_tx, epoch_rx)
            .streaming(config.stream_requests)
            .debug(config.debug);
        forward::spawn(forwarder);

        let link = TunnelLink::new(
            config.clone(),
            queue_tx,
            outbound_rx,
            commands_rx,
            shutdown_rx,
            epoch_tx,
            state_tx,
        );
        tokio::spawn(link.run());

        Self {
            config,
            commands: commands_tx,
            shutdown: shutdown_tx,
            state: state_rx,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Stop the tunnel for good. Calling it again has no effect.
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!("[{}] Close requested", self.config.device);
    }

    /// Ask the relay to stop forwarding new requests
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Ask the relay to resume forwarding
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Wait until the tunnel has stopped and will not reconnect
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }

    /// Wait until the link reaches `target`
    pub async fn wait_for(&self, target: LinkState) -> bool {
        let mut state = self.state.clone();
        let ok = state.wait_for(|s| *s == target).await.is_ok();
        ok
    }

    fn send(&self, cmd: Command) {
        if !self.state().is_live() {
            debug!("[{}] Ignoring {:?}: handshake not complete", self.config.device, cmd);
            return;
        }
        let _ = self.commands.send(cmd);
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.close();
    }
}
