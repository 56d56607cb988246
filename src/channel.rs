//! Bounded frame channel with explicit close semantics.
//!
//! A thin wrapper over `tokio::sync::mpsc` that adds what the pumps
//! need: a blocking send that reports closure instead of erroring, a
//! timed send for the downstream DATA handoff, and a `close()` that
//! unblocks both ends. Receivers see `None` once the channel is closed
//! and treat it as a clean exit.
//!
//! Bounded capacity is the only flow-control mechanism on the data
//! path; producers block when the peer stops draining.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// A bounded channel shared by reference between pump tasks.
///
/// Cloning is cheap; all clones refer to the same queue. Exactly one
/// task consumes at a time (the receiver sits behind an async mutex).
pub struct Channel<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    closed: CancellationToken,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            closed: self.closed.clone(),
        }
    }
}

impl<T: Send> Channel<T> {
    /// Create a channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Blocking send. Returns `false` if the channel is closed.
    pub async fn send(&self, value: T) -> bool {
        tokio::select! {
            _ = self.closed.cancelled() => false,
            res = self.tx.send(value) => res.is_ok(),
        }
    }

    /// Send with a deadline. Returns `false` on timeout or closure.
    pub async fn send_timeout(&self, value: T, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.closed.cancelled() => false,
            res = self.tx.send_timeout(value, timeout) => res.is_ok(),
        }
    }

    /// Receive the next value; `None` once the channel is closed.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            v = rx.recv() => v,
        }
    }

    /// Receive with a deadline; `Ok(None)` means closed, `Err(())`
    /// means the deadline passed with nothing queued.
    pub async fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Option<T>, ()> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(v) => Ok(v),
            Err(_) => Err(()),
        }
    }

    /// Close the channel, unblocking all pending senders and receivers.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
