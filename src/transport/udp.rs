//! UDP datagram transport.
//!
//! Dialed sockets map straight onto a connected `UdpSocket`. The
//! listener side fakes accept semantics: datagrams are demultiplexed by
//! source address, the first datagram from a new peer yields a virtual
//! connection, and later datagrams are queued onto it while `accept`
//! is being polled.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::Result;

use super::{Conn, Listener};

/// Largest datagram the demux will carry.
const MAX_DATAGRAM: usize = 65536;

/// Queue depth per virtual peer connection.
const PEER_BACKLOG: usize = 128;

/// A dialed (connected) UDP socket.
pub struct UdpConn {
    socket: UdpSocket,
    desc: String,
}

impl UdpConn {
    pub async fn dial(addr: &str) -> Result<Arc<dyn Conn>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let desc = match (socket.local_addr(), socket.peer_addr()) {
            (Ok(l), Ok(p)) => format!("udp {}->{}", l, p),
            _ => format!("udp {}", addr),
        };
        Ok(Arc::new(Self { socket, desc }))
    }
}

#[async_trait]
impl Conn for UdpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.socket.recv(buf).await?;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = self.socket.send(buf).await?;
        Ok(n)
    }

    async fn close(&self) {}

    fn info(&self) -> String {
        self.desc.clone()
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// One remote peer seen by a `UdpListener`, exposed as a connection.
struct UdpChildConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    peers: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    desc: String,
}

#[async_trait]
impl Conn for UdpChildConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.rx.lock().await.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            // Listener gone; treat like a closed stream.
            None => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = self.socket.send_to(buf, self.peer).await?;
        Ok(n)
    }

    async fn close(&self) {
        // Forget the peer so a later datagram starts a fresh conn.
        self.peers.remove(&self.peer);
    }

    fn info(&self) -> String {
        self.desc.clone()
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// UDP listener with per-source-address demultiplexing.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    local: String,
}

impl UdpListener {
    pub async fn bind(addr: &str) -> Result<Arc<dyn Listener>> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers: Arc::new(DashMap::new()),
            local,
        }))
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&self) -> Result<Arc<dyn Conn>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;

            if let Some(tx) = self.peers.get(&peer) {
                // Known peer: queue onto its conn. Datagram semantics —
                // drop when the queue is full or the conn is gone.
                if tx.try_send(buf[..n].to_vec()).is_err() && tx.is_closed() {
                    drop(tx);
                    self.peers.remove(&peer);
                }
                continue;
            }

            let (tx, rx) = mpsc::channel(PEER_BACKLOG);
            let _ = tx.try_send(buf[..n].to_vec());
            self.peers.insert(peer, tx);
            return Ok(Arc::new(UdpChildConn {
                socket: Arc::clone(&self.socket),
                peer,
                rx: tokio::sync::Mutex::new(rx),
                peers: Arc::clone(&self.peers),
                desc: format!("udp {}<-{}", self.local, peer),
            }));
        }
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}
