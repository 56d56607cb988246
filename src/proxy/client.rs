//! Client orchestrator.
//!
//! Keeps one control connection per configured proxyproto alive,
//! logging in after every (re)connect and building the local role —
//! Inputer for forward modes, Outputer for reverse modes — once the
//! server accepts the login.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::frame::{ClientType, Frame, LoginFrame, ProxyProto};
use crate::group::Group;
use crate::transport;

use super::{
    check_need_close, check_ping_active, process_ping, process_pong, recv_loop, send_loop, stats,
    Config, Inputer, Outputer, PingState, ProxyConn,
};

/// Client-side view of one control connection.
pub struct ServerConn {
    pub(crate) pc: Arc<ProxyConn>,
    input: OnceLock<Arc<Inputer>>,
    output: OnceLock<Arc<Outputer>>,
}

impl ServerConn {
    fn new(pc: Arc<ProxyConn>) -> Arc<Self> {
        Arc::new(Self {
            pc,
            input: OnceLock::new(),
            output: OnceLock::new(),
        })
    }

    /// The local Inputer, once the login round trip created it.
    pub fn input(&self) -> Option<&Arc<Inputer>> {
        self.input.get()
    }

    /// The local Outputer, once the login round trip created it.
    pub fn output(&self) -> Option<&Arc<Outputer>> {
        self.output.get()
    }
}

/// The proxy client: dials the server and keeps every configured
/// tunnel role alive.
pub struct Client {
    config: Arc<Config>,
    proto: ProxyProto,
    server: String,
    name: String,
    clienttype: ClientType,
    proxyproto: Vec<ProxyProto>,
    fromaddr: Vec<String>,
    toaddr: Vec<String>,
    group: Arc<Group>,
}

impl Client {
    /// Validate the address table and start one connect loop per
    /// proxyproto entry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        proto: ProxyProto,
        server: String,
        name: String,
        clienttype: ClientType,
        proxyproto: Vec<ProxyProto>,
        fromaddr: Vec<String>,
        toaddr: Vec<String>,
    ) -> Result<Arc<Self>> {
        if proxyproto.is_empty() {
            return Err(Error::config("no proxyproto configured"));
        }
        if fromaddr.len() != proxyproto.len() {
            return Err(Error::config("fromaddr/proxyproto len mismatch"));
        }
        let needs_toaddr = matches!(
            clienttype,
            ClientType::Proxy | ClientType::ReverseProxy | ClientType::SsProxy
        );
        if needs_toaddr && toaddr.len() != proxyproto.len() {
            return Err(Error::config("toaddr/proxyproto len mismatch"));
        }

        let group = Group::new(format!("client {}", clienttype.as_str()), None, None);
        group.spawn("client state", stats::show_state(Arc::clone(&group)));
        group.spawn("client check deadlock", stats::check_deadlock(Arc::clone(&group)));

        let client = Arc::new(Self {
            config: Arc::new(config),
            proto,
            server,
            name,
            clienttype,
            proxyproto,
            fromaddr,
            toaddr,
            group,
        });

        for index in 0..client.proxyproto.len() {
            let me = Arc::clone(&client);
            client.group.spawn(
                format!("client connect {}", client.fromaddr[index]),
                async move { me.connect(index).await },
            );
        }

        Ok(client)
    }

    /// Block until the client stops.
    pub async fn wait(&self) -> Result<()> {
        self.group.wait().await
    }

    /// Stop every tunnel and control connection.
    pub async fn close(&self) {
        let _ = self.group.stop_and_wait().await;
    }

    /// Reconnect loop for one proxyproto index.
    async fn connect(self: Arc<Self>, index: usize) -> Result<()> {
        tracing::info!("connect start {} {}", index, self.server);
        let opts = self.config.net_options();

        while !self.group.is_exiting() {
            let dialed = tokio::select! {
                _ = self.group.cancelled() => break,
                r = transport::dial(self.proto, &self.server, &opts) => r,
            };
            match dialed {
                Ok(conn) => {
                    let serverconn = ServerConn::new(ProxyConn::new(
                        Some(conn),
                        "",
                        self.config.main_buffer,
                    ));
                    Arc::clone(&self).use_server(index, serverconn).await;
                }
                Err(e) => {
                    tracing::error!("connect dial fail: {} {}", self.server, e);
                }
            }
            if !self.group.pause(Duration::from_secs(1)).await {
                break;
            }
        }

        tracing::info!("connect end {}", self.server);
        Ok(())
    }

    /// Drive one control connection until it dies.
    async fn use_server(self: Arc<Self>, index: usize, serverconn: Arc<ServerConn>) {
        let pc = Arc::clone(&serverconn.pc);
        tracing::info!("use server {}", pc.info());

        let exit_sc = Arc::clone(&serverconn);
        let wg = Group::new(
            format!("client useServer {}", pc.info()),
            Some(&self.group),
            Some(Box::pin(async move { exit_sc.pc.shutdown().await })),
        );

        self.login(index, &pc).await;

        let ping = Arc::new(PingState::new());
        let conn = match pc.conn().cloned() {
            Some(c) => c,
            None => return,
        };

        wg.spawn(
            format!("client recvFrom {}", pc.info()),
            recv_loop(
                Arc::clone(&wg),
                pc.recvch.clone(),
                Arc::clone(&conn),
                self.config.max_msg_size,
                self.config.encrypt.clone(),
            ),
        );
        wg.spawn(
            format!("client sendTo {}", pc.info()),
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
            format!("client checkPingActive {}", pc.info()),
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
            format!("client checkNeedClose {}", pc.info()),
            check_need_close(Arc::clone(&wg), Arc::clone(&pc)),
        );

        let me = Arc::clone(&self);
        let dispatch_wg = Arc::clone(&wg);
        let dispatch_sc = Arc::clone(&serverconn);
        let dispatch_ping = Arc::clone(&ping);
        wg.spawn(format!("client process {}", pc.info()), async move {
            me.dispatch(dispatch_wg, index, dispatch_sc, dispatch_ping)
                .await
        });

        if let Err(e) = wg.wait().await {
            tracing::info!("use server close {} {}", self.server, e);
        } else {
            tracing::info!("use server close {}", self.server);
        }
    }

    /// Queue the LOGIN frame; it leaves before anything else because
    /// nothing else is queued yet.
    async fn login(&self, index: usize, pc: &ProxyConn) {
        let login = LoginFrame {
            proxyproto: self.proxyproto[index],
            clienttype: self.clienttype,
            fromaddr: self.fromaddr[index].clone(),
            toaddr: self.toaddr.get(index).cloned().unwrap_or_default(),
            name: format!("{}_{}", self.name, index),
            key: self.config.key.clone(),
        };
        tracing::info!("start login {} {} {:?}", index, self.server, login);
        pc.sendch.send(Frame::Login(login)).await;
    }

    async fn dispatch(
        self: Arc<Self>,
        wg: Arc<Group>,
        index: usize,
        serverconn: Arc<ServerConn>,
        ping: Arc<PingState>,
    ) -> Result<()> {
        tracing::info!("process start {}", serverconn.pc.info());

        loop {
            if wg.is_exiting() {
                break;
            }
            let f = tokio::select! {
                _ = wg.cancelled() => break,
                f = serverconn.pc.recvch.recv() => match f {
                    Some(f) => f,
                    None => break,
                },
            };

            match f {
                Frame::LoginRsp { ret, msg } => {
                    self.process_login_rsp(&wg, index, &serverconn, ret, msg)
                        .await;
                }
                Frame::Ping { time } => process_ping(time, &ping),
                Frame::Pong { time } => {
                    process_pong(time, &serverconn.pc, self.config.show_ping)
                }
                Frame::Data(d) => {
                    if let Some(input) = serverconn.input.get() {
                        input.process_data_frame(d).await;
                    } else if let Some(output) = serverconn.output.get() {
                        output.process_data_frame(d).await;
                    }
                }
                Frame::Open { id, toaddr } => {
                    if let Some(output) = serverconn.output.get() {
                        Arc::clone(output).process_open_frame(id, toaddr).await;
                    }
                }
                Frame::OpenRsp { id, ret, .. } => {
                    if let Some(input) = serverconn.input.get() {
                        input.process_open_rsp_frame(&id, ret);
                    }
                }
                Frame::Close { id } => {
                    if let Some(input) = serverconn.input.get() {
                        input.process_close_frame(id).await;
                    } else if let Some(output) = serverconn.output.get() {
                        output.process_close_frame(id).await;
                    }
                }
                Frame::Login(_) => {
                    tracing::error!("unexpected LOGIN on client {}", serverconn.pc.info());
                }
            }
        }

        tracing::info!("process end {}", serverconn.pc.info());
        Ok(())
    }

    async fn process_login_rsp(
        &self,
        wg: &Arc<Group>,
        index: usize,
        serverconn: &Arc<ServerConn>,
        ret: bool,
        msg: String,
    ) {
        if !ret {
            serverconn.pc.mark_need_close();
            tracing::error!("login rsp fail {} {}", self.server, msg);
            return;
        }

        tracing::info!("login rsp ok {}", self.server);

        match self.ini_service(wg, index, serverconn).await {
            Ok(()) => serverconn.pc.set_established(),
            Err(e) => {
                tracing::error!("login rsp ini service fail {} {}", self.server, e);
            }
        }
    }

    /// Build the local half of the tunnel role. The client side runs
    /// the opposite end of whatever the server built.
    async fn ini_service(
        &self,
        wg: &Arc<Group>,
        index: usize,
        serverconn: &Arc<ServerConn>,
    ) -> Result<()> {
        let proto = self.proxyproto[index];
        let father = Arc::clone(&serverconn.pc);
        match self.clienttype {
            ClientType::Proxy | ClientType::SsProxy => {
                let input = Inputer::new(
                    wg,
                    proto,
                    &self.fromaddr[index],
                    self.clienttype,
                    Arc::clone(&self.config),
                    father,
                    self.toaddr[index].clone(),
                )
                .await?;
                let _ = serverconn.input.set(input);
            }
            ClientType::ReverseProxy | ClientType::ReverseSocks5 => {
                let output = Outputer::new(
                    wg,
                    proto,
                    self.clienttype,
                    Arc::clone(&self.config),
                    father,
                );
                let _ = serverconn.output.set(output);
            }
            ClientType::Socks5 => {
                let input = Inputer::new_socks5(
                    wg,
                    proto,
                    &self.fromaddr[index],
                    self.clienttype,
                    Arc::clone(&self.config),
                    father,
                )
                .await?;
                let _ = serverconn.input.set(input);
            }
        }
        Ok(())
    }
}
