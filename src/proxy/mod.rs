//! The multiplexing core: configuration, per-connection state, and the
//! pump tasks shared by both ends of the control channel.
//!
//! A control connection runs five tasks under one supervisor group:
//! recv loop, send loop, ping watchdog, close watchdog and dispatcher.
//! Each child stream runs five more: recv-from-sonny, send-to-sonny,
//! idle watchdog, close watchdog and the upstream copier. Everything
//! communicates through bounded channels and the few atomics declared
//! on `ProxyConn`/`PingState`.

pub mod client;
pub mod inputer;
pub mod outputer;
pub mod server;
pub mod stats;

pub use client::Client;
pub use inputer::Inputer;
pub use outputer::Outputer;
pub use server::Server;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use dashmap::DashMap;
use tokio::time::Duration;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::frame::{self, DataFrame, Frame, MAX_FRAME_OVERHEAD, MAX_INDEX};
use crate::group::Group;
use crate::transport::{self, Conn, NetOptions};

use stats::{DEADLOCK, STATS};

/// Poll interval for the cooperative watchdog loops.
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables shared by client and server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest DATA payload carried in one frame.
    pub max_msg_size: usize,
    /// Control-channel queue depth.
    pub main_buffer: usize,
    /// Per-child queue depth.
    pub conn_buffer: usize,
    /// Handshake deadline for control and child conns.
    pub established_timeout: Duration,
    /// Interval between pings on the control channel.
    pub ping_inter: Duration,
    /// Unanswered pings tolerated before the control conn dies.
    pub ping_timeout_inter: u32,
    /// Idle window after which a silent child is torn down.
    pub conn_timeout: Duration,
    /// Dial deadline.
    pub connect_timeout: Duration,
    /// Shared login key.
    pub key: String,
    /// RC4 key for DATA payloads; empty disables encryption.
    pub encrypt: String,
    /// Compression threshold in bytes; 0 disables compression.
    pub compress: usize,
    /// Log ping round trips.
    pub show_ping: bool,
    /// SOCKS5 username; empty selects NoAuth.
    pub username: String,
    /// SOCKS5 password.
    pub password: String,
    /// Control connections a server accepts.
    pub max_client: usize,
    /// Child streams per control connection.
    pub max_sonny: usize,
    /// Deadline for handing a DATA frame down to a child queue.
    pub main_write_channel_timeout: Duration,
    /// Congestion preset for reliable-datagram transports.
    pub congestion: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_msg_size: 1024 * 1024,
            main_buffer: 64,
            conn_buffer: 16,
            established_timeout: Duration::from_secs(10),
            ping_inter: Duration::from_secs(1),
            ping_timeout_inter: 30,
            conn_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            key: "123456".to_string(),
            encrypt: "default".to_string(),
            compress: 128,
            show_ping: false,
            username: String::new(),
            password: String::new(),
            max_client: 8,
            max_sonny: 128,
            main_write_channel_timeout: Duration::from_millis(1000),
            congestion: "bb".to_string(),
        }
    }
}

impl Config {
    pub fn net_options(&self) -> NetOptions {
        NetOptions {
            connect_timeout: self.connect_timeout,
            congestion: self.congestion.clone(),
        }
    }
}

/// Fast-path flags the ping watchdog and PING handler share with the
/// send loop, so liveness frames skip the queue.
pub struct PingState {
    pub pingflag: AtomicU32,
    pub pongflag: AtomicU32,
    /// Echoed timestamp; written before `pongflag` is raised.
    pub pongtime: AtomicI64,
}

impl PingState {
    pub fn new() -> Self {
        Self {
            pingflag: AtomicU32::new(0),
            pongflag: AtomicU32::new(0),
            pongtime: AtomicI64::new(0),
        }
    }
}

impl Default for PingState {
    fn default() -> Self {
        Self::new()
    }
}

/// State for one control or child connection.
pub struct ProxyConn {
    conn: OnceLock<Arc<dyn Conn>>,
    pub sendch: Channel<Frame>,
    pub recvch: Channel<Frame>,
    established: AtomicBool,
    actived: AtomicU32,
    pinged: AtomicU32,
    id: String,
    needclose: AtomicBool,
}

impl ProxyConn {
    /// Create a conn. Child conns get an id; control conns pass `""`.
    /// The transport may be attached later (outputer dials after OPEN).
    pub fn new(conn: Option<Arc<dyn Conn>>, id: impl Into<String>, buffer: usize) -> Arc<Self> {
        let slot = OnceLock::new();
        if let Some(c) = conn {
            let _ = slot.set(c);
        }
        Arc::new(Self {
            conn: slot,
            sendch: Channel::new(buffer),
            recvch: Channel::new(buffer),
            established: AtomicBool::new(false),
            actived: AtomicU32::new(0),
            pinged: AtomicU32::new(0),
            id: id.into(),
            needclose: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conn(&self) -> Option<&Arc<dyn Conn>> {
        self.conn.get()
    }

    pub fn set_conn(&self, conn: Arc<dyn Conn>) {
        let _ = self.conn.set(conn);
    }

    pub fn info(&self) -> String {
        match self.conn.get() {
            Some(c) => c.info(),
            None => self.id.clone(),
        }
    }

    pub fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub fn set_established(&self) {
        self.established.store(true, Ordering::SeqCst);
    }

    pub fn need_close(&self) -> bool {
        self.needclose.load(Ordering::SeqCst)
    }

    /// Monotonic: once raised the close watchdog tears the conn down.
    pub fn mark_need_close(&self) {
        self.needclose.store(true, Ordering::SeqCst);
    }

    /// Count one unit of traffic toward the idle watchdog.
    pub fn touch(&self) {
        self.actived.fetch_add(1, Ordering::SeqCst);
    }

    fn take_actived(&self) -> u32 {
        self.actived.swap(0, Ordering::SeqCst)
    }

    pub fn pinged(&self) -> u32 {
        self.pinged.load(Ordering::SeqCst)
    }

    fn inc_pinged(&self) {
        self.pinged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn clear_pinged(&self) {
        self.pinged.store(0, Ordering::SeqCst);
    }

    /// Close the transport and both channels. Only the owning group's
    /// exit hook calls this.
    pub async fn shutdown(&self) {
        if let Some(c) = self.conn.get() {
            c.close().await;
        }
        self.sendch.close();
        self.recvch.close();
    }
}

/// Unique id for a child stream on its control channel.
pub fn unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Transport -> recvch. Fatal on any read, length or decode error.
pub(crate) async fn recv_loop(
    group: Arc<Group>,
    recvch: Channel<Frame>,
    conn: Arc<dyn Conn>,
    max_msg_size: usize,
    encrypt: String,
) -> Result<()> {
    tracing::info!("recv loop start {}", conn.info());
    let mut lenbuf = [0u8; 4];
    let mut body = vec![0u8; max_msg_size + MAX_FRAME_OVERHEAD];

    loop {
        if group.is_exiting() {
            break;
        }
        STATS.recv_frames.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = group.cancelled() => break,
            r = transport::read_full(conn.as_ref(), &mut lenbuf) => r?,
        }

        let msglen = u32::from_le_bytes(lenbuf) as usize;
        if msglen == 0 || msglen > max_msg_size + MAX_FRAME_OVERHEAD {
            return Err(Error::Framing(format!(
                "recv len fail: {} {}",
                conn.info(),
                msglen
            )));
        }

        DEADLOCK.begin_recv();
        tokio::select! {
            _ = group.cancelled() => break,
            r = transport::read_full(conn.as_ref(), &mut body[..msglen]) => r?,
        }

        let f = frame::decode(&body[..msglen], &encrypt)?;
        if frame::debug_checks() {
            if let Frame::Data(d) = &f {
                if d.crc != 0 && d.crc != frame::crc32(&d.data) {
                    return Err(Error::protocol(format!("recv crc error {}", conn.info())));
                }
            }
        }

        let delivered = tokio::select! {
            _ = group.cancelled() => break,
            ok = recvch.send(f) => ok,
        };
        if !delivered {
            break;
        }

        STATS.main_recv_num.fetch_add(1, Ordering::Relaxed);
        STATS
            .main_recv_size
            .fetch_add(msglen as u64 + 4, Ordering::Relaxed);
        DEADLOCK.end_recv();
    }
    tracing::info!("recv loop end {}", conn.info());
    Ok(())
}

/// sendch -> transport, with the ping/pong fast path ahead of queued
/// frames. A closed sendch ends the loop cleanly.
pub(crate) async fn send_loop(
    group: Arc<Group>,
    sendch: Channel<Frame>,
    conn: Arc<dyn Conn>,
    compress: usize,
    max_msg_size: usize,
    encrypt: String,
    ping: Arc<PingState>,
) -> Result<()> {
    tracing::info!("send loop start {}", conn.info());
    loop {
        if group.is_exiting() {
            break;
        }
        STATS.send_frames.fetch_add(1, Ordering::Relaxed);

        let f = if ping.pingflag.swap(0, Ordering::SeqCst) > 0 {
            Frame::Ping { time: now_nanos() }
        } else if ping.pongflag.swap(0, Ordering::SeqCst) > 0 {
            Frame::Pong {
                time: ping.pongtime.load(Ordering::SeqCst),
            }
        } else {
            let next = tokio::select! {
                _ = group.cancelled() => break,
                r = sendch.recv_timeout(Duration::from_secs(1)) => r,
            };
            match next {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(()) => continue,
            }
        };

        let body = frame::encode(f, compress, &encrypt)?;
        let msglen = body.len();
        if msglen == 0 || msglen > max_msg_size + MAX_FRAME_OVERHEAD {
            return Err(Error::Framing(format!(
                "send len fail: {} {}",
                conn.info(),
                msglen
            )));
        }

        DEADLOCK.begin_send();
        tokio::select! {
            _ = group.cancelled() => break,
            r = async {
                conn.write(&(msglen as u32).to_le_bytes()).await?;
                conn.write(&body).await
            } => {
                r?;
            }
        }

        STATS.main_send_num.fetch_add(1, Ordering::Relaxed);
        STATS
            .main_send_size
            .fetch_add(msglen as u64 + 4, Ordering::Relaxed);
        DEADLOCK.end_send();
    }
    tracing::info!("send loop end {}", conn.info());
    Ok(())
}

/// Local socket -> child recvch as DATA frames with a wrapping index.
pub(crate) async fn recv_from_sonny(
    group: Arc<Group>,
    recvch: Channel<Frame>,
    conn: Arc<dyn Conn>,
    max_msg_size: usize,
) -> Result<()> {
    tracing::info!("recv sonny start {}", conn.info());
    let mut buf = vec![0u8; max_msg_size];
    let mut index: u32 = 0;

    loop {
        if group.is_exiting() {
            break;
        }
        STATS.recv_sonny_frames.fetch_add(1, Ordering::Relaxed);

        let n = tokio::select! {
            _ = group.cancelled() => break,
            r = conn.read(&mut buf) => r?,
        };
        if n == 0 {
            // Local peer closed; a clean end of this child.
            break;
        }

        let data = buf[..n].to_vec();
        let crc = if frame::debug_checks() {
            frame::crc32(&data)
        } else {
            0
        };
        index = (index + 1) % MAX_INDEX;
        let f = Frame::Data(DataFrame {
            id: String::new(),
            data,
            compress: false,
            index,
            crc,
        });

        let delivered = tokio::select! {
            _ = group.cancelled() => break,
            ok = recvch.send(f) => ok,
        };
        if !delivered {
            break;
        }

        STATS.recv_num.fetch_add(1, Ordering::Relaxed);
        STATS.recv_size.fetch_add(n as u64, Ordering::Relaxed);
    }
    tracing::info!("recv sonny end {}", conn.info());
    Ok(())
}

/// Child sendch -> local socket, verifying ordering and payload sanity.
/// A CLOSE frame queued by the peer ends the child with an error so the
/// group unwinds.
pub(crate) async fn send_to_sonny(
    group: Arc<Group>,
    sendch: Channel<Frame>,
    conn: Arc<dyn Conn>,
    max_msg_size: usize,
) -> Result<()> {
    tracing::info!("send sonny start {}", conn.info());
    let mut index: u32 = 0;

    loop {
        if group.is_exiting() {
            break;
        }
        STATS.send_sonny_frames.fetch_add(1, Ordering::Relaxed);

        let f = tokio::select! {
            _ = group.cancelled() => break,
            f = sendch.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };

        let d = match f {
            Frame::Close { .. } => {
                tracing::info!("send sonny close by remote: {}", conn.info());
                return Err(Error::protocol("close by remote"));
            }
            Frame::Data(d) => d,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} in sonny queue",
                    other.tag_name()
                )))
            }
        };

        if d.compress {
            return Err(Error::protocol(format!("compressed data {}", conn.info())));
        }
        if d.data.is_empty() || d.data.len() > max_msg_size {
            return Err(Error::protocol(format!(
                "data len error {} {}",
                conn.info(),
                d.data.len()
            )));
        }
        if frame::debug_checks() && d.crc != 0 && d.crc != frame::crc32(&d.data) {
            return Err(Error::protocol(format!("data crc error {}", conn.info())));
        }

        index = (index + 1) % MAX_INDEX;
        if d.index != index {
            return Err(Error::protocol(format!(
                "index error {} {} {}",
                conn.info(),
                d.index,
                index
            )));
        }

        tokio::select! {
            _ = group.cancelled() => break,
            r = conn.write(&d.data) => {
                r?;
            }
        }

        STATS.send_num.fetch_add(1, Ordering::Relaxed);
        STATS
            .send_size
            .fetch_add(d.data.len() as u64, Ordering::Relaxed);
    }
    tracing::info!("send sonny end {}", conn.info());
    Ok(())
}

/// Control-channel liveness: enforce the establishment deadline, then
/// ping on a timer and die after too many unanswered pings.
pub(crate) async fn check_ping_active(
    group: Arc<Group>,
    pc: Arc<ProxyConn>,
    ping: Arc<PingState>,
    established_timeout: Duration,
    ping_inter: Duration,
    ping_timeout_inter: u32,
    show_ping: bool,
) -> Result<()> {
    tracing::info!("ping watchdog start {}", pc.info());

    let begin = Instant::now();
    loop {
        if group.is_exiting() {
            return Ok(());
        }
        STATS.check_frames.fetch_add(1, Ordering::Relaxed);
        if pc.established() {
            break;
        }
        if begin.elapsed() > established_timeout {
            tracing::info!("established timeout {}", pc.info());
            return Err(Error::EstablishedTimeout);
        }
        if !group.pause(CHECK_INTERVAL).await {
            return Ok(());
        }
    }

    let mut begin = Instant::now();
    loop {
        if group.is_exiting() {
            break;
        }
        STATS.check_frames.fetch_add(1, Ordering::Relaxed);

        if begin.elapsed() > ping_inter {
            begin = Instant::now();

            if pc.pinged() > ping_timeout_inter {
                tracing::info!("ping pong timeout {}", pc.info());
                return Err(Error::PingTimeout);
            }

            ping.pingflag.fetch_add(1, Ordering::SeqCst);
            pc.inc_pinged();
            if show_ping {
                tracing::info!("ping {}", pc.info());
            }
        }
        if !group.pause(CHECK_INTERVAL).await {
            break;
        }
    }
    tracing::info!("ping watchdog end {}", pc.info());
    Ok(())
}

/// Poll the close flag; turning it into an error lets the supervisor
/// unwind the whole connection.
pub(crate) async fn check_need_close(group: Arc<Group>, pc: Arc<ProxyConn>) -> Result<()> {
    loop {
        if group.is_exiting() {
            break;
        }
        STATS.check_frames.fetch_add(1, Ordering::Relaxed);
        if pc.need_close() {
            tracing::info!("needclose {}", pc.info());
            return Err(Error::NeedClose);
        }
        if !group.pause(CHECK_INTERVAL).await {
            break;
        }
    }
    Ok(())
}

/// Child liveness: establishment deadline, then an idle window that
/// must see at least one unit of traffic.
pub(crate) async fn check_sonny_active(
    group: Arc<Group>,
    pc: Arc<ProxyConn>,
    established_timeout: Duration,
    conn_timeout: Duration,
) -> Result<()> {
    tracing::info!("sonny watchdog start {}", pc.info());

    let begin = Instant::now();
    loop {
        if group.is_exiting() {
            return Ok(());
        }
        STATS.check_frames.fetch_add(1, Ordering::Relaxed);
        if pc.established() {
            break;
        }
        if begin.elapsed() > established_timeout {
            tracing::error!("sonny established timeout {}", pc.info());
            return Err(Error::EstablishedTimeout);
        }
        if !group.pause(CHECK_INTERVAL).await {
            return Ok(());
        }
    }

    let mut begin = Instant::now();
    loop {
        if group.is_exiting() {
            break;
        }
        STATS.check_frames.fetch_add(1, Ordering::Relaxed);

        if begin.elapsed() > conn_timeout {
            if pc.take_actived() == 0 {
                tracing::error!("sonny idle timeout {}", pc.info());
                return Err(Error::ConnIdleTimeout);
            }
            begin = Instant::now();
        }
        if !group.pause(CHECK_INTERVAL).await {
            break;
        }
    }
    tracing::info!("sonny watchdog end {}", pc.info());
    Ok(())
}

/// Drain the child's recvch, stamp the child id, and forward each DATA
/// frame up into the control channel. Blocks when the control queue is
/// full — that backpressure is what stalls an overactive child.
pub(crate) async fn copy_sonny_recv(
    group: Arc<Group>,
    recvch: Channel<Frame>,
    sonny: Arc<ProxyConn>,
    father: Arc<ProxyConn>,
) -> Result<()> {
    tracing::info!("copy sonny start {}", sonny.info());
    loop {
        if group.is_exiting() {
            break;
        }
        STATS.copy_frames.fetch_add(1, Ordering::Relaxed);

        let f = tokio::select! {
            _ = group.cancelled() => break,
            f = recvch.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };

        let mut d = match f {
            Frame::Data(d) => d,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} from sonny",
                    other.tag_name()
                )))
            }
        };
        if d.compress {
            return Err(Error::protocol(format!("compressed data {}", sonny.info())));
        }
        if frame::debug_checks() && d.crc != 0 && d.crc != frame::crc32(&d.data) {
            return Err(Error::protocol(format!("copy crc error {}", sonny.info())));
        }

        d.id = sonny.id().to_string();
        sonny.touch();

        let delivered = tokio::select! {
            _ = group.cancelled() => break,
            ok = father.sendch.send(Frame::Data(d)) => ok,
        };
        if !delivered {
            break;
        }
    }
    tracing::info!("copy sonny end {}", sonny.info());
    Ok(())
}

/// Tell the peer this child is gone. Skipped when the control channel
/// itself is already tearing down.
pub(crate) async fn close_remote_conn(father_group: &Group, sonny: &ProxyConn, father: &ProxyConn) {
    let close = Frame::Close {
        id: sonny.id().to_string(),
    };
    tokio::select! {
        _ = father_group.cancelled() => {}
        _ = father.sendch.send(close) => {}
    }
    tracing::info!("close conn {}", sonny.id());
}

/// PING handler: stage the echo for the send loop's fast path.
pub(crate) fn process_ping(time: i64, ping: &PingState) {
    ping.pongtime.store(time, Ordering::SeqCst);
    ping.pongflag.fetch_add(1, Ordering::SeqCst);
}

/// PONG handler: the control channel is alive.
pub(crate) fn process_pong(time: i64, pc: &ProxyConn, show_ping: bool) {
    pc.clear_pinged();
    if show_ping {
        let elapsed = Duration::from_nanos(now_nanos().saturating_sub(time).max(0) as u64);
        tracing::info!("pong {} {:?}", pc.info(), elapsed);
    }
}

/// Deliver a DATA frame to the addressed child, with the bounded
/// handoff that protects the control channel from one stuck child.
pub(crate) async fn route_data_frame(
    sonny_map: &DashMap<String, Arc<ProxyConn>>,
    d: DataFrame,
    write_timeout: Duration,
) {
    let Some(sonny) = sonny_map.get(&d.id).map(|e| Arc::clone(e.value())) else {
        tracing::debug!("data frame for unknown sonny {} {}", d.id, d.data.len());
        return;
    };
    let id = d.id.clone();
    let len = d.data.len();
    if !sonny.sendch.send_timeout(Frame::Data(d), write_timeout).await {
        sonny.mark_need_close();
        tracing::error!("data frame handoff timeout {} {}", id, len);
    }
    sonny.touch();
}

/// Forward a CLOSE to the addressed child so its send pump exits.
pub(crate) async fn route_close_frame(sonny_map: &DashMap<String, Arc<ProxyConn>>, id: String) {
    let Some(sonny) = sonny_map.get(&id).map(|e| Arc::clone(e.value())) else {
        tracing::info!("close frame for unknown sonny {}", id);
        return;
    };
    sonny.sendch.send(Frame::Close { id }).await;
}

/// Spawn the five tasks every established child stream runs.
pub(crate) fn spawn_sonny_pumps(
    wg: &Arc<Group>,
    sonny: &Arc<ProxyConn>,
    father: &Arc<ProxyConn>,
    conn: Arc<dyn Conn>,
    config: &Config,
) {
    let info = conn.info();

    wg.spawn(
        format!("recvFromSonny {}", info),
        recv_from_sonny(
            Arc::clone(wg),
            sonny.recvch.clone(),
            Arc::clone(&conn),
            config.max_msg_size,
        ),
    );
    wg.spawn(
        format!("sendToSonny {}", info),
        send_to_sonny(
            Arc::clone(wg),
            sonny.sendch.clone(),
            Arc::clone(&conn),
            config.max_msg_size,
        ),
    );
    wg.spawn(
        format!("checkSonnyActive {}", info),
        check_sonny_active(
            Arc::clone(wg),
            Arc::clone(sonny),
            config.established_timeout,
            config.conn_timeout,
        ),
    );
    wg.spawn(
        format!("checkNeedClose {}", info),
        check_need_close(Arc::clone(wg), Arc::clone(sonny)),
    );
    wg.spawn(
        format!("copySonnyRecv {}", info),
        copy_sonny_recv(
            Arc::clone(wg),
            sonny.recvch.clone(),
            Arc::clone(sonny),
            Arc::clone(father),
        ),
    );
}
