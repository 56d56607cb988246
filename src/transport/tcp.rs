//! TCP stream transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Duration;

use crate::error::{Error, Result};

use super::{Conn, Listener};

/// A TCP connection, split so the recv and send pumps can run in
/// parallel without contending on one lock.
pub struct TcpConn {
    rd: tokio::sync::Mutex<OwnedReadHalf>,
    wr: tokio::sync::Mutex<OwnedWriteHalf>,
    desc: String,
}

impl TcpConn {
    fn from_stream(stream: TcpStream) -> Result<Arc<dyn Conn>> {
        stream.set_nodelay(true)?;
        let desc = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(l), Ok(p)) => format!("tcp {}->{}", l, p),
            _ => "tcp".to_string(),
        };
        let (rd, wr) = stream.into_split();
        Ok(Arc::new(Self {
            rd: tokio::sync::Mutex::new(rd),
            wr: tokio::sync::Mutex::new(wr),
            desc,
        }))
    }

    /// Connect to `addr` within the deadline.
    pub async fn dial(addr: &str, connect_timeout: Duration) -> Result<Arc<dyn Conn>> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Network(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timeout", addr),
                ))
            })??;
        Self::from_stream(stream)
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.rd.lock().await.read(buf).await?;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.wr.lock().await.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) {
        let _ = self.wr.lock().await.shutdown().await;
    }

    fn info(&self) -> String {
        self.desc.clone()
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A bound TCP listener.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    local: String,
}

impl TcpListener {
    pub async fn bind(addr: &str) -> Result<Arc<dyn Listener>> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let local = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Arc::new(Self { inner, local }))
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Arc<dyn Conn>> {
        let (stream, _) = self.inner.accept().await?;
        TcpConn::from_stream(stream)
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
