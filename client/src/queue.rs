//! Ordered queue of inbound requests awaiting the local server
//!
//! Single producer (the tunnel link) and single consumer (the forwarder).
//! The queue is unbounded: back-pressure is the relay's concern.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One inbound HTTP exchange initiated by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Session the request arrived on
    pub generation: u64,
    pub payload: Vec<u8>,
}

/// Create a connected sender/receiver pair
pub fn request_queue() -> (RequestSender, RequestReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        RequestSender { tx, depth: depth.clone() },
        RequestReceiver { rx, depth },
    )
}

pub struct RequestSender {
    tx: mpsc::UnboundedSender<PendingRequest>,
    depth: Arc<AtomicUsize>,
}

impl RequestSender {
    /// Enqueue a request. Returns false if the consumer is gone.
    pub fn push(&self, request: PendingRequest) -> bool {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(request).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Number of requests not yet taken by the consumer
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RequestReceiver {
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    depth: Arc<AtomicUsize>,
}

impl RequestReceiver {
    /// Next request in arrival order, or `None` once the sender is dropped
    /// and the queue is drained. Cancel safe.
    pub async fn recv(&mut self) -> Option<PendingRequest> {
        let request = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
