//! Server orchestrator.
//!
//! Accepts control connections on every configured listener, processes
//! LOGIN, and builds the server half of the tunnel role: an Outputer
//! for forward modes, an Inputer for reverse modes.

use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::frame::{ClientType, Frame, LoginFrame, ProxyProto};
use crate::group::Group;
use crate::transport::{self, Conn, Listener};

use super::{
    check_need_close, check_ping_active, process_ping, process_pong, recv_loop, send_loop, stats,
    Config, Inputer, Outputer, PingState, ProxyConn,
};

/// Server-side view of one logged-in (or logging-in) client.
pub struct ClientConn {
    pub(crate) pc: Arc<ProxyConn>,
    login: parking_lot::Mutex<Option<LoginFrame>>,
    input: OnceLock<Arc<Inputer>>,
    output: OnceLock<Arc<Outputer>>,
}

impl ClientConn {
    fn new(pc: Arc<ProxyConn>) -> Arc<Self> {
        Arc::new(Self {
            pc,
            login: parking_lot::Mutex::new(None),
            input: OnceLock::new(),
            output: OnceLock::new(),
        })
    }

    fn login_name(&self) -> Option<String> {
        self.login.lock().as_ref().map(|l| l.name.clone())
    }
}

/// The proxy server.
pub struct Server {
    config: Arc<Config>,
    group: Arc<Group>,
    clients: Arc<DashMap<String, Arc<ClientConn>>>,
    listen_addrs: Vec<String>,
}

impl Server {
    /// Bind every listener and start accepting clients.
    pub async fn new(
        config: Config,
        protos: Vec<ProxyProto>,
        listenaddrs: Vec<String>,
    ) -> Result<Arc<Self>> {
        if protos.is_empty() || protos.len() != listenaddrs.len() {
            return Err(Error::config("proto/listen len mismatch"));
        }

        let mut listeners: Vec<Arc<dyn Listener>> = Vec::with_capacity(protos.len());
        for (proto, addr) in protos.iter().zip(listenaddrs.iter()) {
            listeners.push(transport::listen(*proto, addr).await?);
        }
        let listen_addrs: Vec<String> = listeners.iter().map(|l| l.local_addr()).collect();

        let group = Group::new("server", None, None);
        group.spawn("server state", stats::show_state(Arc::clone(&group)));
        group.spawn("server check deadlock", stats::check_deadlock(Arc::clone(&group)));

        let server = Arc::new(Self {
            config: Arc::new(config),
            group,
            clients: Arc::new(DashMap::new()),
            listen_addrs,
        });

        for listener in listeners {
            let me = Arc::clone(&server);
            let name = format!("server listen {}", listener.local_addr());
            server
                .group
                .spawn(name, async move { me.listen(listener).await });
        }

        Ok(server)
    }

    /// Resolved local addresses, one per configured listener.
    pub fn listen_addrs(&self) -> &[String] {
        &self.listen_addrs
    }

    /// Logged-in client count.
    pub fn client_size(&self) -> usize {
        self.clients.len()
    }

    /// Block until the server stops.
    pub async fn wait(&self) -> Result<()> {
        self.group.wait().await
    }

    /// Stop all clients and listeners.
    pub async fn close(&self) {
        let _ = self.group.stop_and_wait().await;
    }

    async fn listen(self: Arc<Self>, listener: Arc<dyn Listener>) -> Result<()> {
        tracing::info!("server listen start {}", listener.local_addr());

        loop {
            if self.group.is_exiting() {
                break;
            }

            let conn = tokio::select! {
                _ = self.group.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::info!("server accept fail {}", e);
                        if !self.group.pause(super::CHECK_INTERVAL).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            if self.clients.len() >= self.config.max_client {
                tracing::info!("server max client {} {}", conn.info(), self.clients.len());
                conn.close().await;
                continue;
            }

            let cc = ClientConn::new(ProxyConn::new(Some(conn), "", self.config.main_buffer));
            let me = Arc::clone(&self);
            self.group.spawn(
                format!("server serveClient {}", cc.pc.info()),
                async move { me.serve_client(cc).await },
            );
        }

        tracing::info!("server listen end {}", listener.local_addr());
        Ok(())
    }

    /// Drive one client control connection until it dies, then drop its
    /// registration.
    async fn serve_client(self: Arc<Self>, cc: Arc<ClientConn>) -> Result<()> {
        let pc = Arc::clone(&cc.pc);
        tracing::info!("serve client {}", pc.info());

        let exit_cc = Arc::clone(&cc);
        let wg = Group::new(
            format!("server serveClient {}", pc.info()),
            Some(&self.group),
            Some(Box::pin(async move { exit_cc.pc.shutdown().await })),
        );

        let ping = Arc::new(PingState::new());
        let conn = match pc.conn().cloned() {
            Some(c) => c,
            None => return Ok(()),
        };

        wg.spawn(
            format!("server recvFrom {}", pc.info()),
            recv_loop(
                Arc::clone(&wg),
                pc.recvch.clone(),
                Arc::clone(&conn),
                self.config.max_msg_size,
                self.config.encrypt.clone(),
            ),
        );
        wg.spawn(
            format!("server sendTo {}", pc.info()),
            send_loop(
                Arc::clone(&wg),
                pc.sendch.clone(),
                Arc::clone(&conn),
                self.config.compress,
                self.config.max_msg_size,
                self.config.encrypt.clone(),
                Arc::clone(&ping),
            ),
        );
        wg.spawn(
            format!("server checkPingActive {}", pc.info()),
            check_ping_active(
                Arc::clone(&wg),
                Arc::clone(&pc),
                Arc::clone(&ping),
                self.config.established_timeout,
                self.config.ping_inter,
                self.config.ping_timeout_inter,
                self.config.show_ping,
            ),
        );
        wg.spawn(
            format!("server checkNeedClose {}", pc.info()),
            check_need_close(Arc::clone(&wg), Arc::clone(&pc)),
        );

        let me = Arc::clone(&self);
        let dispatch_wg = Arc::clone(&wg);
        let dispatch_cc = Arc::clone(&cc);
        let dispatch_ping = Arc::clone(&ping);
        wg.spawn(format!("server process {}", pc.info()), async move {
            me.dispatch(dispatch_wg, dispatch_cc, dispatch_ping).await
        });

        let _ = wg.wait().await;

        if cc.pc.established() {
            if let Some(name) = cc.login_name() {
                self.clients.remove(&name);
            }
        }

        tracing::info!("serve client close {}", pc.info());
        Ok(())
    }

    async fn dispatch(
        self: Arc<Self>,
        wg: Arc<Group>,
        cc: Arc<ClientConn>,
        ping: Arc<PingState>,
    ) -> Result<()> {
        tracing::info!("process start {}", cc.pc.info());

        loop {
            if wg.is_exiting() {
                break;
            }
            let f = tokio::select! {
                _ = wg.cancelled() => break,
                f = cc.pc.recvch.recv() => match f {
                    Some(f) => f,
                    None => break,
                },
            };

            match f {
                Frame::Login(login) => {
                    self.process_login(&wg, &cc, login).await;
                }
                Frame::Ping { time } => process_ping(time, &ping),
                Frame::Pong { time } => process_pong(time, &cc.pc, self.config.show_ping),
                Frame::Data(d) => {
                    if let Some(input) = cc.input.get() {
                        input.process_data_frame(d).await;
                    } else if let Some(output) = cc.output.get() {
                        output.process_data_frame(d).await;
                    }
                }
                Frame::Open { id, toaddr } => {
                    if let Some(output) = cc.output.get() {
                        Arc::clone(output).process_open_frame(id, toaddr).await;
                    }
                }
                Frame::OpenRsp { id, ret, .. } => {
                    if let Some(input) = cc.input.get() {
                        input.process_open_rsp_frame(&id, ret);
                    }
                }
                Frame::Close { id } => {
                    if let Some(input) = cc.input.get() {
                        input.process_close_frame(id).await;
                    } else if let Some(output) = cc.output.get() {
                        output.process_close_frame(id).await;
                    }
                }
                Frame::LoginRsp { .. } => {
                    tracing::error!("unexpected LOGINRSP on server {}", cc.pc.info());
                }
            }
        }

        tracing::info!("process end {}", cc.pc.info());
        Ok(())
    }

    async fn reply_login(&self, wg: &Group, cc: &ClientConn, ret: bool, msg: &str) {
        let rsp = Frame::LoginRsp {
            ret,
            msg: msg.to_string(),
        };
        tokio::select! {
            _ = wg.cancelled() => {}
            _ = cc.pc.sendch.send(rsp) => {}
        }
    }

    async fn process_login(&self, wg: &Arc<Group>, cc: &Arc<ClientConn>, login: LoginFrame) {
        tracing::info!("process login from {} {:?}", cc.pc.info(), login);

        *cc.login.lock() = Some(login.clone());

        if login.key != self.config.key {
            self.reply_login(wg, cc, false, "key error").await;
            tracing::error!("login key error {}", cc.pc.info());
            return;
        }

        if cc.pc.established() {
            self.reply_login(wg, cc, false, "has established before").await;
            tracing::error!("login but established before {}", cc.pc.info());
            return;
        }

        match self.clients.entry(login.name.clone()) {
            Entry::Occupied(_) => {
                let msg = format!("{} has login before", login.name);
                self.reply_login(wg, cc, false, &msg).await;
                tracing::error!("login fail {} {}", msg, cc.pc.info());
                return;
            }
            Entry::Vacant(v) => {
                v.insert(Arc::clone(cc));
            }
        }

        if let Err(e) = self.ini_service(wg, cc, &login).await {
            self.clients.remove(&login.name);
            self.reply_login(wg, cc, false, "ini service fail").await;
            tracing::error!("login ini service fail {} {}", cc.pc.info(), e);
            return;
        }

        cc.pc.set_established();
        self.reply_login(wg, cc, true, "ok").await;

        tracing::info!("login ok {} {}", login.name, cc.pc.info());
    }

    /// Build the server half of the role requested at LOGIN.
    async fn ini_service(
        &self,
        wg: &Arc<Group>,
        cc: &Arc<ClientConn>,
        login: &LoginFrame,
    ) -> Result<()> {
        let father = Arc::clone(&cc.pc);
        match login.clienttype {
            ClientType::Proxy | ClientType::Socks5 => {
                let output = Outputer::new(
                    wg,
                    login.proxyproto,
                    login.clienttype,
                    Arc::clone(&self.config),
                    father,
                );
                let _ = cc.output.set(output);
            }
            ClientType::ReverseProxy => {
                let input = Inputer::new(
                    wg,
                    login.proxyproto,
                    &login.fromaddr,
                    login.clienttype,
                    Arc::clone(&self.config),
                    father,
                    login.toaddr.clone(),
                )
                .await?;
                let _ = cc.input.set(input);
            }
            ClientType::ReverseSocks5 => {
                let input = Inputer::new_socks5(
                    wg,
                    login.proxyproto,
                    &login.fromaddr,
                    login.clienttype,
                    Arc::clone(&self.config),
                    father,
                )
                .await?;
                let _ = cc.input.set(input);
            }
            ClientType::SsProxy => {
                let output = Outputer::new_ss(
                    wg,
                    login.proxyproto,
                    login.clienttype,
                    Arc::clone(&self.config),
                    father,
                );
                let _ = cc.output.set(output);
            }
        }
        Ok(())
    }
}
