use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub type UpstreamConnection = BufReader<TcpStream>;

/// Per-client-connection handle on the loopback upstream. A drained
/// keep-alive connection is parked here and reused for the next request on
/// the same client connection.
pub struct UpstreamPool {
    addr: SocketAddr,
    connect_timeout: Duration,
    idle: Option<UpstreamConnection>,
}

impl UpstreamPool {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
            idle: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn acquire(&mut self) -> Result<UpstreamConnection> {
        if let Some(conn) = self.idle.take() {
            return Ok(conn);
        }

        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("upstream {} did not accept in time", self.addr))?
            .with_context(|| format!("could not reach upstream {}", self.addr))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %self.addr, error = %err, "could not enable TCP_NODELAY for the upstream socket");
        }
        Ok(BufReader::new(stream))
    }

    /// Parks a connection whose response was fully consumed; anything else
    /// is dropped on the floor.
    pub fn release(&mut self, conn: UpstreamConnection, reusable: bool) {
        if reusable {
            self.idle = Some(conn);
        }
    }
}
