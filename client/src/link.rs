//! Relay connection lifecycle
//!
//! The link owns the WebSocket to the relay. Each connection attempt gets
//! a fresh [`Session`]; when the transport closes, errors or misses a
//! heartbeat, the session is torn down and a new attempt is scheduled
//! after the reconnect interval.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use outpost_shared::protocol::ClientMessage;
use outpost_shared::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::control::{self, Inbound};
use crate::forward::{preview, Outbound};
use crate::queue::{PendingRequest, RequestSender};
use crate::session::{LinkState, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Requests from the client handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    /// `close()` was called
    Requested,
    /// The relay closed the connection
    Remote,
    /// No pong since the previous heartbeat
    Liveness,
}

pub struct TunnelLink {
    config: Arc<TunnelConfig>,
    session: Session,
    queue: RequestSender,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    epoch: watch::Sender<u64>,
    state: watch::Sender<LinkState>,
}

impl TunnelLink {
    pub fn new(
        config: Arc<TunnelConfig>,
        queue: RequestSender,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: watch::Receiver<bool>,
        epoch: watch::Sender<u64>,
        state: watch::Sender<LinkState>,
    ) -> Self {
        let generation = *epoch.borrow();
        Self {
            config,
            session: Session::disconnected(generation),
            queue,
            outbound,
            commands,
            shutdown,
            epoch,
            state,
        }
    }

    /// Connect, serve and reconnect until shut down or reconnecting is
    /// disabled
    pub async fn run(mut self) {
        loop {
            if shutdown_requested(&self.shutdown) {
                break;
            }

            match self.connect_and_serve().await {
                Ok(Closure::Requested) => info!("[{}] Tunnel closed", self.config.device),
                Ok(Closure::Remote) => warn!("[{}] Relay closed the connection", self.config.device),
                Ok(Closure::Liveness) => warn!("[{}] Relay missed a heartbeat, dropping connection", self.config.device),
                Err(e) => error!("[{}] Tunnel error: {}", self.config.device, e),
            }
            self.teardown();

            // a closed tunnel never reconnects, whatever the interval
            if shutdown_requested(&self.shutdown) || !self.config.reconnects() {
                debug!("[{}] Reconnect disabled", self.config.device);
                break;
            }
            let interval = self.config.reconnect_interval;

            info!("[{}] Reconnecting in {:?}...", self.config.device, interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            }
        }

        self.set_state(LinkState::Disconnected);
    }

    async fn connect_and_serve(&mut self) -> Result<Closure> {
        self.session = Session::new(self.next_generation());
        self.set_state(LinkState::Connecting);

        // commands issued while disconnected are not carried over
        while self.commands.try_recv().is_ok() {}

        info!("[{}] Connecting to relay: {}", self.config.device, self.config.relay);
        let ws = tokio::select! {
            result = connect_async(self.config.relay.as_str()) => {
                result.map_err(|e| Error::Connection(format!("{}: {}", self.config.relay, e)))?.0
            }
            _ = wait_for_shutdown(&mut self.shutdown) => return Ok(Closure::Requested),
        };

        self.session.state = LinkState::AwaitingGreeting;
        self.set_state(self.session.state);
        let (mut write, mut read) = ws.split();
        let mut heartbeat: Option<Interval> = None;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    return Ok(Closure::Requested);
                }
                msg = read.next() => match msg {
                    Some(Ok(msg)) => self.on_message(msg, &mut write).await?,
                    Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                    None => return Ok(Closure::Remote),
                },
                Some(out) = self.outbound.recv() => self.on_outbound(out, &mut write).await?,
                Some(cmd) = self.commands.recv() => self.on_command(cmd, &mut write).await?,
                _ = tick(&mut heartbeat) => {
                    if !self.session.alive {
                        return Ok(Closure::Liveness);
                    }
                    self.session.alive = false;
                    write.send(Message::Ping(Vec::new())).await.map_err(ws_error)?;
                }
            }

            if heartbeat.is_none() && self.session.state.is_live() {
                if let Some(period) = self.config.heartbeat() {
                    let mut timer = interval_at(Instant::now() + period, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    heartbeat = Some(timer);
                    self.session.alive = true;
                }
            }
            self.set_state(self.session.state);
        }
    }

    async fn on_message(&mut self, msg: Message, write: &mut WsSink) -> Result<()> {
        match msg {
            Message::Text(text) => match control::classify_text(&text) {
                Inbound::Control(msg) => {
                    if let Some(reply) = control::on_control(&mut self.session, &self.config, msg) {
                        self.send_control(&reply, write).await?;
                    }
                }
                Inbound::Echo(text) => info!("[{}] Relay echo: {}", self.config.device, text),
                _ => {}
            },
            Message::Binary(payload) => {
                match control::classify_binary(payload, self.session.suspend.as_deref()) {
                    Inbound::Suspend => {
                        info!("[{}] Relay signalled suspend", self.config.device);
                        self.session.state = LinkState::Suspended;
                    }
                    Inbound::Request(payload) => self.enqueue(payload),
                    _ => {}
                }
            }
            Message::Ping(_) | Message::Pong(_) => self.session.alive = true,
            Message::Close(frame) => {
                debug!("[{}] Relay sent close: {:?}", self.config.device, frame);
            }
            Message::Frame(_) => {}
        }
        Ok(())
    }

    fn enqueue(&mut self, payload: Vec<u8>) {
        if self.config.debug {
            debug!("[{}] Inbound request ({} bytes): {}", self.config.device, payload.len(), preview(&payload));
        }
        let request = PendingRequest {
            generation: self.session.generation,
            payload,
        };
        if self.queue.push(request) {
            debug!("[{}] Request queued ({} pending)", self.config.device, self.queue.len());
        } else {
            warn!("[{}] Forwarder stopped, request dropped", self.config.device);
        }
    }

    async fn on_outbound(&mut self, out: Outbound, write: &mut WsSink) -> Result<()> {
        let Outbound::Response { generation, mut payload } = out;
        if generation != self.session.generation {
            debug!("Dropping response for closed session {} ({} bytes)", generation, payload.len());
            return Ok(());
        }
        let Some(eof) = self.session.eof.as_deref() else {
            error!(
                "[{}] Response ready before the relay sent its eof marker, dropping {} bytes",
                self.config.device,
                payload.len()
            );
            return Ok(());
        };

        payload.extend_from_slice(eof);
        debug!("[{}] Sending response ({} bytes)", self.config.device, payload.len());
        write.send(Message::Binary(payload)).await.map_err(ws_error)
    }

    async fn on_command(&mut self, cmd: Command, write: &mut WsSink) -> Result<()> {
        if !self.session.state.is_live() {
            debug!("Ignoring {:?}: handshake not complete", cmd);
            return Ok(());
        }
        match cmd {
            Command::Pause => match self.session.suspend.clone() {
                Some(marker) => {
                    info!("[{}] Asking relay to suspend forwarding", self.config.device);
                    write.send(Message::Binary(marker)).await.map_err(ws_error)?;
                }
                None => debug!("Ignoring pause: no suspend marker yet"),
            },
            Command::Resume => {
                info!("[{}] Asking relay to resume forwarding", self.config.device);
                let start = ClientMessage::Start { usage: self.config.visibility };
                self.send_control(&start, write).await?;
            }
        }
        Ok(())
    }

    async fn send_control(&self, msg: &ClientMessage, write: &mut WsSink) -> Result<()> {
        write.send(Message::Text(msg.to_json()?)).await.map_err(ws_error)
    }

    /// Release all per-session state
    fn teardown(&mut self) {
        self.session = Session::disconnected(self.next_generation());
        self.set_state(LinkState::Disconnected);
    }

    /// Advance the session epoch. The forwarder drops local state and
    /// stale requests when it changes.
    fn next_generation(&self) -> u64 {
        self.epoch.send_modify(|generation| *generation += 1);
        *self.epoch.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("[{}] {:?} -> {:?}", self.config.device, current, state);
            *current = state;
            true
        });
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::Connection(e.to_string())
}

/// Next heartbeat tick; pending forever while no heartbeat runs
async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// True once `close()` was called or the client handle was dropped
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    if shutdown.has_changed().is_err() {
        return true;
    }
    *shutdown.borrow()
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
