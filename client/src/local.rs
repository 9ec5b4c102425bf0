//! Connection to the local application server

use outpost_shared::{Error, Result};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Idle time before keep-alive probes start on the local connection
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Lazily established, single TCP connection to the local server
pub struct LocalLink {
    host: String,
    port: u16,
    conn: Option<TcpStream>,
}

impl LocalLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            conn: None,
        }
    }

    /// Reuse the open connection or establish a new one
    pub async fn acquire(&mut self) -> Result<&mut TcpStream> {
        let stream = match self.conn.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        Ok(self.conn.insert(stream))
    }

    /// Drop the cached connection so the next exchange starts fresh
    pub fn invalidate(&mut self) {
        if self.conn.take().is_some() {
            debug!("Local connection to {}:{} released", self.host, self.port);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::LocalLink(format!("connect to {} failed: {}", addr, e)))?;

        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;

        debug!("Connected to local server at {}", addr);
        Ok(stream)
    }
}
