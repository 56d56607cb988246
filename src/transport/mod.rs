//! Transport abstraction.
//!
//! A uniform stream seam over the protocols a proxy role can carry.
//! Stream transports (tcp) hand back ordered byte streams; datagram
//! transports (udp) are message oriented — one `read` returns one
//! datagram. Reliable-datagram transports (rudp/ricmp) plug in behind
//! the same traits and take the congestion preset from `NetOptions`;
//! this build does not ship them.

mod tcp;
mod udp;

pub use tcp::{TcpConn, TcpListener};
pub use udp::{UdpConn, UdpListener};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::frame::ProxyProto;

/// Options applied when constructing a transport.
#[derive(Debug, Clone)]
pub struct NetOptions {
    /// Dial deadline.
    pub connect_timeout: Duration,
    /// Congestion preset for reliable-datagram transports.
    pub congestion: String,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            congestion: "bb".to_string(),
        }
    }
}

/// One bidirectional connection.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read some bytes (stream) or one datagram (message transports).
    /// `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer; a short write is an error.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);

    /// Human-readable endpoint description for logs.
    fn info(&self) -> String;

    /// Transport name: `tcp`, `udp`, `rudp` or `ricmp`.
    fn name(&self) -> &'static str;
}

/// A bound listening socket.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Arc<dyn Conn>>;

    /// Local address the listener is bound to, as `host:port`.
    fn local_addr(&self) -> String;

    fn name(&self) -> &'static str;
}

/// Dial `addr` over the given transport.
pub async fn dial(proto: ProxyProto, addr: &str, opts: &NetOptions) -> Result<Arc<dyn Conn>> {
    match proto {
        ProxyProto::Tcp => TcpConn::dial(addr, opts.connect_timeout).await,
        ProxyProto::Udp => UdpConn::dial(addr).await,
        ProxyProto::Rudp | ProxyProto::Ricmp => Err(Error::config(format!(
            "transport {} not available in this build",
            proto.as_str()
        ))),
    }
}

/// Bind a listener on `addr` for the given transport.
pub async fn listen(proto: ProxyProto, addr: &str) -> Result<Arc<dyn Listener>> {
    match proto {
        ProxyProto::Tcp => TcpListener::bind(addr).await,
        ProxyProto::Udp => UdpListener::bind(addr).await,
        ProxyProto::Rudp | ProxyProto::Ricmp => Err(Error::config(format!(
            "transport {} not available in this build",
            proto.as_str()
        ))),
    }
}

/// Read exactly `buf.len()` bytes from a stream transport.
pub async fn read_full(conn: &dyn Conn, buf: &mut [u8]) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let n = conn.read(&mut buf[off..]).await?;
        if n == 0 {
            return Err(Error::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-read",
            )));
        }
        off += n;
    }
    Ok(())
}
