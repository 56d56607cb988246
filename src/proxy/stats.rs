//! Pump counters and the deadlock watchdog.
//!
//! Counters are process-wide aggregates, mirrored into the log once a
//! minute. The deadlock watchdog samples the send/recv in-flight flags
//! and complains when either stays raised for more than five seconds;
//! it is diagnostic only and never intervenes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use tokio::time::Duration;

use crate::error::Result;
use crate::group::Group;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start.
pub fn now_ms() -> u64 {
    START.elapsed().as_millis() as u64
}

/// Process-wide pump counters.
pub struct Stats {
    pub recv_frames: AtomicU64,
    pub send_frames: AtomicU64,
    pub recv_sonny_frames: AtomicU64,
    pub send_sonny_frames: AtomicU64,
    pub copy_frames: AtomicU64,
    pub check_frames: AtomicU64,

    pub main_recv_num: AtomicU64,
    pub main_send_num: AtomicU64,
    pub main_recv_size: AtomicU64,
    pub main_send_size: AtomicU64,
    pub recv_num: AtomicU64,
    pub send_num: AtomicU64,
    pub recv_size: AtomicU64,
    pub send_size: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            recv_frames: AtomicU64::new(0),
            send_frames: AtomicU64::new(0),
            recv_sonny_frames: AtomicU64::new(0),
            send_sonny_frames: AtomicU64::new(0),
            copy_frames: AtomicU64::new(0),
            check_frames: AtomicU64::new(0),
            main_recv_num: AtomicU64::new(0),
            main_send_num: AtomicU64::new(0),
            main_recv_size: AtomicU64::new(0),
            main_send_size: AtomicU64::new(0),
            recv_num: AtomicU64::new(0),
            send_num: AtomicU64::new(0),
            recv_size: AtomicU64::new(0),
            send_size: AtomicU64::new(0),
        }
    }

    /// Drain all counters into a snapshot.
    pub fn take_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recv_frames: self.recv_frames.swap(0, Ordering::Relaxed),
            send_frames: self.send_frames.swap(0, Ordering::Relaxed),
            recv_sonny_frames: self.recv_sonny_frames.swap(0, Ordering::Relaxed),
            send_sonny_frames: self.send_sonny_frames.swap(0, Ordering::Relaxed),
            copy_frames: self.copy_frames.swap(0, Ordering::Relaxed),
            check_frames: self.check_frames.swap(0, Ordering::Relaxed),
            main_recv_num: self.main_recv_num.swap(0, Ordering::Relaxed),
            main_send_num: self.main_send_num.swap(0, Ordering::Relaxed),
            main_recv_size: self.main_recv_size.swap(0, Ordering::Relaxed),
            main_send_size: self.main_send_size.swap(0, Ordering::Relaxed),
            recv_num: self.recv_num.swap(0, Ordering::Relaxed),
            send_num: self.send_num.swap(0, Ordering::Relaxed),
            recv_size: self.recv_size.swap(0, Ordering::Relaxed),
            send_size: self.send_size.swap(0, Ordering::Relaxed),
        }
    }
}

pub static STATS: Stats = Stats::new();

/// One minute's worth of counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub recv_frames: u64,
    pub send_frames: u64,
    pub recv_sonny_frames: u64,
    pub send_sonny_frames: u64,
    pub copy_frames: u64,
    pub check_frames: u64,
    pub main_recv_num: u64,
    pub main_send_num: u64,
    pub main_recv_size: u64,
    pub main_send_size: u64,
    pub recv_num: u64,
    pub send_num: u64,
    pub recv_size: u64,
    pub send_size: u64,
}

/// In-flight flags sampled by the deadlock watchdog.
pub struct DeadlockWatch {
    sending: AtomicBool,
    send_at_ms: AtomicU64,
    recving: AtomicBool,
    recv_at_ms: AtomicU64,
}

impl DeadlockWatch {
    const fn new() -> Self {
        Self {
            sending: AtomicBool::new(false),
            send_at_ms: AtomicU64::new(0),
            recving: AtomicBool::new(false),
            recv_at_ms: AtomicU64::new(0),
        }
    }

    pub fn begin_send(&self) {
        self.send_at_ms.store(now_ms(), Ordering::Relaxed);
        self.sending.store(true, Ordering::Relaxed);
    }

    pub fn end_send(&self) {
        self.sending.store(false, Ordering::Relaxed);
    }

    pub fn begin_recv(&self) {
        self.recv_at_ms.store(now_ms(), Ordering::Relaxed);
        self.recving.store(true, Ordering::Relaxed);
    }

    pub fn end_recv(&self) {
        self.recving.store(false, Ordering::Relaxed);
    }

    fn stuck_send_ms(&self) -> Option<u64> {
        if self.sending.load(Ordering::Relaxed) {
            let dur = now_ms().saturating_sub(self.send_at_ms.load(Ordering::Relaxed));
            if dur > STUCK_AFTER_MS {
                return Some(dur);
            }
        }
        None
    }

    fn stuck_recv_ms(&self) -> Option<u64> {
        if self.recving.load(Ordering::Relaxed) {
            let dur = now_ms().saturating_sub(self.recv_at_ms.load(Ordering::Relaxed));
            if dur > STUCK_AFTER_MS {
                return Some(dur);
            }
        }
        None
    }
}

pub static DEADLOCK: DeadlockWatch = DeadlockWatch::new();

const STUCK_AFTER_MS: u64 = 5000;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(300);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Log a counter snapshot once a minute until the group exits.
pub async fn show_state(group: Arc<Group>) -> Result<()> {
    tracing::info!("state reporter start");
    while group.pause(SNAPSHOT_INTERVAL).await {
        tracing::info!("state {:?}", STATS.take_snapshot());
    }
    tracing::info!("state reporter end");
    Ok(())
}

/// Sample the in-flight flags and complain about stuck pumps.
pub async fn check_deadlock(group: Arc<Group>) -> Result<()> {
    tracing::info!("deadlock watchdog start");
    while group.pause(SAMPLE_INTERVAL).await {
        if let Some(ms) = DEADLOCK.stuck_send_ms() {
            tracing::error!("send stuck for {}ms", ms);
        }
        if let Some(ms) = DEADLOCK.stuck_recv_ms() {
            tracing::error!("recv stuck for {}ms", ms);
        }
    }
    tracing::info!("deadlock watchdog end");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_drains() {
        STATS.recv_frames.fetch_add(3, Ordering::Relaxed);
        let snap = STATS.take_snapshot();
        assert!(snap.recv_frames >= 3);
        // A second snapshot starts from zero again (modulo other tests).
        let snap = STATS.take_snapshot();
        assert!(snap.recv_frames < 3);
    }

    #[test]
    fn test_deadlock_flags() {
        let watch = DeadlockWatch::new();
        assert!(watch.stuck_send_ms().is_none());
        watch.begin_send();
        // Just started, not stuck yet.
        assert!(watch.stuck_send_ms().is_none());
        watch.send_at_ms
            .store(now_ms().saturating_sub(STUCK_AFTER_MS + 1), Ordering::Relaxed);
        assert!(watch.stuck_send_ms().is_some());
        watch.end_send();
        assert!(watch.stuck_send_ms().is_none());
    }
}
