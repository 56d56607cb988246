//! Listener side of a proxy role.
//!
//! Accepts local connections (optionally running the SOCKS5 handshake
//! first), assigns each child a stable id, asks the peer to OPEN a
//! matching stream, and pumps bytes both ways until either side closes.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::frame::{ClientType, DataFrame, Frame, ProxyProto};
use crate::group::Group;
use crate::socks5;
use crate::transport::{self, Conn, Listener};

use super::{
    close_remote_conn, route_close_frame, route_data_frame, spawn_sonny_pumps, unique_id, Config,
    ProxyConn,
};

/// Owns a listening socket; every accepted conn becomes a child stream
/// tunneled through the father control connection.
pub struct Inputer {
    clienttype: ClientType,
    config: Arc<Config>,
    addr: String,
    father: Arc<ProxyConn>,
    group: Arc<Group>,
    sonny: DashMap<String, Arc<ProxyConn>>,
}

impl Inputer {
    /// Plain forwarding listener: every accepted conn is tunneled to
    /// `target_addr`.
    pub async fn new(
        group: &Arc<Group>,
        proto: ProxyProto,
        addr: &str,
        clienttype: ClientType,
        config: Arc<Config>,
        father: Arc<ProxyConn>,
        target_addr: String,
    ) -> Result<Arc<Self>> {
        let listener = transport::listen(proto, addr).await?;
        let inputer = Arc::new(Self {
            clienttype,
            config,
            addr: listener.local_addr(),
            father,
            group: Arc::clone(group),
            sonny: DashMap::new(),
        });

        let me = Arc::clone(&inputer);
        group.spawn(format!("inputer listen {}", inputer.addr), async move {
            me.listen(listener, Some(target_addr)).await
        });

        tracing::info!("new inputer ok {}", inputer.addr);
        Ok(inputer)
    }

    /// SOCKS5 listener: the target comes out of each conn's handshake.
    pub async fn new_socks5(
        group: &Arc<Group>,
        proto: ProxyProto,
        addr: &str,
        clienttype: ClientType,
        config: Arc<Config>,
        father: Arc<ProxyConn>,
    ) -> Result<Arc<Self>> {
        let listener = transport::listen(proto, addr).await?;
        let inputer = Arc::new(Self {
            clienttype,
            config,
            addr: listener.local_addr(),
            father,
            group: Arc::clone(group),
            sonny: DashMap::new(),
        });

        let me = Arc::clone(&inputer);
        group.spawn(format!("inputer listen socks5 {}", inputer.addr), async move {
            me.listen(listener, None).await
        });

        tracing::info!("new socks5 inputer ok {}", inputer.addr);
        Ok(inputer)
    }

    /// Local address the listener bound to.
    pub fn local_addr(&self) -> &str {
        &self.addr
    }

    pub fn clienttype(&self) -> ClientType {
        self.clienttype
    }

    /// Live child count.
    pub fn sonny_size(&self) -> usize {
        self.sonny.len()
    }

    async fn listen(
        self: Arc<Self>,
        listener: Arc<dyn Listener>,
        target: Option<String>,
    ) -> Result<()> {
        tracing::info!("inputer start listen {}", self.addr);

        loop {
            if self.group.is_exiting() {
                break;
            }

            let conn = tokio::select! {
                _ = self.group.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::info!("inputer accept fail {} {}", self.addr, e);
                        if !self.group.pause(super::CHECK_INTERVAL).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            if self.sonny.len() >= self.config.max_sonny {
                tracing::info!("inputer max sonny {} {}", conn.info(), self.sonny.len());
                conn.close().await;
                continue;
            }

            let sonny = ProxyConn::new(Some(conn), unique_id(), self.config.conn_buffer);
            let me = Arc::clone(&self);
            match &target {
                Some(t) => {
                    let t = t.clone();
                    self.group.spawn(
                        format!("inputer processProxyConn {}", sonny.info()),
                        async move { me.process_proxy_conn(sonny, t).await },
                    );
                }
                None => {
                    self.group.spawn(
                        format!("inputer processSocks5Conn {}", sonny.info()),
                        async move { me.process_socks5_conn(sonny).await },
                    );
                }
            }
        }

        tracing::info!("inputer end listen {}", self.addr);
        Ok(())
    }

    /// Run the SOCKS5 handshake in a short-lived nested group, then
    /// treat the conn like any other child with the negotiated target.
    async fn process_socks5_conn(self: Arc<Self>, sonny: Arc<ProxyConn>) -> Result<()> {
        tracing::info!("socks5 conn start {}", sonny.info());

        let Some(conn) = sonny.conn().cloned() else {
            return Ok(());
        };

        if conn.name() != "tcp" {
            tracing::error!("socks5 needs tcp, got {} {}", conn.name(), conn.info());
            sonny.shutdown().await;
            return Ok(());
        }

        let wg = Group::new(
            format!("inputer socks5 {}", conn.info()),
            Some(&self.group),
            None,
        );
        let target = Arc::new(parking_lot::Mutex::new(String::new()));

        let username = self.config.username.clone();
        let password = self.config.password.clone();
        let hs_conn = Arc::clone(&conn);
        let hs_target = Arc::clone(&target);
        let hs_group = Arc::clone(&wg);
        wg.spawn(format!("inputer socks5 handshake {}", conn.info()), async move {
            let negotiate = async {
                socks5::handshake(hs_conn.as_ref(), &username, &password).await?;
                let addr = socks5::read_request(hs_conn.as_ref()).await?;
                // Reply success right away; a failed upstream dial shows
                // up as a reset on this conn.
                hs_conn.write(&socks5::CONNECT_REPLY).await?;
                *hs_target.lock() = addr;
                Ok(())
            };
            tokio::select! {
                _ = hs_group.cancelled() => Err(crate::error::Error::NeedClose),
                r = negotiate => r,
            }
        });

        if wg.wait().await.is_err() {
            sonny.shutdown().await;
            return Ok(());
        }

        let target_addr = target.lock().clone();
        if target_addr.is_empty() {
            sonny.shutdown().await;
            return Ok(());
        }
        tracing::info!("socks5 conn ok {} {}", sonny.info(), target_addr);
        self.process_proxy_conn(sonny, target_addr).await
    }

    async fn process_proxy_conn(
        self: Arc<Self>,
        sonny: Arc<ProxyConn>,
        target_addr: String,
    ) -> Result<()> {
        let id = sonny.id().to_string();
        tracing::info!(
            "inputer child start {} {} {}",
            id,
            sonny.info(),
            target_addr
        );

        match self.sonny.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::error!("inputer child id collision {}", id);
                sonny.shutdown().await;
                return Ok(());
            }
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&sonny));
            }
        }

        self.open_conn(&sonny, &target_addr).await;

        let exit_sonny = Arc::clone(&sonny);
        let wg = Group::new(
            format!("inputer child {}", sonny.info()),
            Some(&self.group),
            Some(Box::pin(async move { exit_sonny.shutdown().await })),
        );

        // The conn is present here: inputer children are built from
        // accepted connections.
        if let Some(conn) = sonny.conn().cloned() {
            spawn_sonny_pumps(&wg, &sonny, &self.father, conn, &self.config);
        }

        let _ = wg.wait().await;
        self.sonny.remove(&id);

        close_remote_conn(&self.group, &sonny, &self.father).await;

        tracing::info!("inputer child end {} {}", id, target_addr);
        Ok(())
    }

    async fn open_conn(&self, sonny: &ProxyConn, target_addr: &str) {
        let open = Frame::Open {
            id: sonny.id().to_string(),
            toaddr: target_addr.to_string(),
        };
        tokio::select! {
            _ = self.group.cancelled() => {}
            _ = self.father.sendch.send(open) => {}
        }
        tracing::info!("inputer open {} {}", sonny.id(), target_addr);
    }

    /// DATA from the peer: hand down to the addressed child.
    pub async fn process_data_frame(&self, d: DataFrame) {
        route_data_frame(&self.sonny, d, self.config.main_write_channel_timeout).await;
    }

    /// OPENRSP from the peer: the child's dial either worked or not.
    pub fn process_open_rsp_frame(&self, id: &str, ret: bool) {
        let Some(sonny) = self.sonny.get(id).map(|e| Arc::clone(e.value())) else {
            tracing::info!("openrsp for unknown sonny {}", id);
            return;
        };
        if ret {
            sonny.set_established();
            tracing::info!("openrsp ok {} {}", id, sonny.info());
        } else {
            sonny.mark_need_close();
            tracing::info!("openrsp fail {} {}", id, sonny.info());
        }
    }

    /// CLOSE from the peer: let the child's send pump exit.
    pub async fn process_close_frame(&self, id: String) {
        route_close_frame(&self.sonny, id).await;
    }
}
