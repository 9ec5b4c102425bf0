//! Single-flight forwarding of queued requests to the local server
//!
//! Requests are taken from the queue one at a time. Each is written to the
//! local connection and the response is accumulated until the local server
//! closes its write side, then handed back to the tunnel link. A failed
//! exchange drops the local connection and the loop moves on to the next
//! request.

use outpost_shared::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::local::LocalLink;
use crate::queue::{PendingRequest, RequestReceiver};

/// Messages from the forwarder to the tunnel link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A complete response, not yet terminated by the eof marker
    Response { generation: u64, payload: Vec<u8> },
}

pub struct Forwarder {
    local: LocalLink,
    queue: RequestReceiver,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Generation of the live relay session
    epoch: watch::Receiver<u64>,
    streaming: bool,
    debug: bool,
}

impl Forwarder {
    pub fn new(
        local: LocalLink,
        queue: RequestReceiver,
        outbound: mpsc::UnboundedSender<Outbound>,
        epoch: watch::Receiver<u64>,
    ) -> Self {
        Self {
            local,
            queue,
            outbound,
            epoch,
            streaming: false,
            debug: false,
        }
    }

    /// Write request chunks that arrive mid-exchange through to the open
    /// local connection
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Run until the queue's sender is dropped and the queue is drained
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.queue.recv() => match request {
                    Some(request) => self.forward(request).await,
                    None => break,
                },
                changed = self.epoch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // session changed, local state belongs to the old one
                    self.local.invalidate();
                }
            }
        }

        self.local.invalidate();
        debug!("Forwarder stopped");
    }

    async fn forward(&mut self, request: PendingRequest) {
        let current = *self.epoch.borrow();
        if request.generation != current {
            debug!(
                "Dropping request from closed session {} ({} bytes)",
                request.generation,
                request.payload.len()
            );
            return;
        }

        if self.debug {
            debug!("Request ({} bytes): {}", request.payload.len(), preview(&request.payload));
        }

        match self.exchange(&request.payload).await {
            Ok(payload) => {
                debug!("Local response complete ({} bytes)", payload.len());
                let response = Outbound::Response {
                    generation: request.generation,
                    payload,
                };
                if self.outbound.send(response).is_err() {
                    debug!("Tunnel link gone, response discarded");
                }
            }
            Err(e) => {
                warn!(
                    "Local exchange failed ({} byte request): {}",
                    request.payload.len(),
                    e
                );
                self.local.invalidate();
            }
        }
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let stream = self.local.acquire().await?;
        stream.write_all(request).await?;

        let mut response = Vec::new();
        let mut tmp = [0u8; 8192];
        loop {
            tokio::select! {
                n = stream.read(&mut tmp) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    response.extend_from_slice(&tmp[..n]);
                }
                Some(chunk) = self.queue.recv(), if self.streaming => {
                    if chunk.generation == *self.epoch.borrow() {
                        debug!("Streaming {} more request bytes", chunk.payload.len());
                        stream.write_all(&chunk.payload).await?;
                    }
                }
            }
        }

        // peer closed its write side, the connection cannot carry another response
        self.local.invalidate();
        Ok(response)
    }
}

/// Truncated, lossy rendering of a payload for debug logs
pub fn preview(payload: &[u8]) -> String {
    const MAX: usize = 64;
    let text = String::from_utf8_lossy(&payload[..payload.len().min(MAX)]);
    let text = text.escape_debug();
    if payload.len() > MAX {
        format!("{}...", text)
    } else {
        text.to_string()
    }
}

/// Spawn a forwarder task
pub fn spawn(forwarder: Forwarder) -> tokio::task::JoinHandle<()> {
    debug!("Starting forwarder (streaming: {})", forwarder.streaming);
    tokio::spawn(forwarder.run())
}
