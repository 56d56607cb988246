//! Dialer side of a proxy role.
//!
//! Waits for OPEN frames, dials the requested target on the peer's
//! behalf, reports the outcome with OPENRSP, and pumps bytes for every
//! stream it managed to open.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::frame::{ClientType, DataFrame, Frame, ProxyProto};
use crate::group::Group;
use crate::transport::{self, Conn};

use super::{
    close_remote_conn, route_close_frame, route_data_frame, spawn_sonny_pumps, Config, ProxyConn,
};

/// Dials targets in response to OPEN frames from the peer.
pub struct Outputer {
    clienttype: ClientType,
    config: Arc<Config>,
    proto: ProxyProto,
    father: Arc<ProxyConn>,
    group: Arc<Group>,
    sonny: DashMap<String, Arc<ProxyConn>>,
    ss: bool,
}

impl Outputer {
    pub fn new(
        group: &Arc<Group>,
        proto: ProxyProto,
        clienttype: ClientType,
        config: Arc<Config>,
        father: Arc<ProxyConn>,
    ) -> Arc<Self> {
        let outputer = Arc::new(Self {
            clienttype,
            config,
            proto,
            father,
            group: Arc::clone(group),
            sonny: DashMap::new(),
            ss: false,
        });
        tracing::info!("new outputer ok {}", proto.as_str());
        outputer
    }

    /// SS variant: the dial target is taken from the local shadowsocks
    /// environment instead of the OPEN frame.
    pub fn new_ss(
        group: &Arc<Group>,
        proto: ProxyProto,
        clienttype: ClientType,
        config: Arc<Config>,
        father: Arc<ProxyConn>,
    ) -> Arc<Self> {
        let outputer = Arc::new(Self {
            clienttype,
            config,
            proto,
            father,
            group: Arc::clone(group),
            sonny: DashMap::new(),
            ss: true,
        });
        tracing::info!("new ss outputer ok {}", proto.as_str());
        outputer
    }

    pub fn clienttype(&self) -> ClientType {
        self.clienttype
    }

    /// Live child count.
    pub fn sonny_size(&self) -> usize {
        self.sonny.len()
    }

    async fn reply_open_rsp(&self, id: &str, ret: bool, msg: &str) {
        let rsp = Frame::OpenRsp {
            id: id.to_string(),
            ret,
            msg: msg.to_string(),
        };
        tokio::select! {
            _ = self.group.cancelled() => {}
            _ = self.father.sendch.send(rsp) => {}
        }
    }

    /// OPEN from the peer: register a placeholder child and start the
    /// dial. Every failure is answered with an OPENRSP so the peer can
    /// drop its end.
    pub async fn process_open_frame(self: Arc<Self>, id: String, toaddr: String) {
        let mut target = toaddr;

        if self.ss {
            let host = std::env::var("SS_LOCAL_HOST").unwrap_or_default();
            let port = std::env::var("SS_LOCAL_PORT").unwrap_or_default();
            if host.is_empty() || port.is_empty() {
                self.reply_open_rsp(&id, false, "ss no env").await;
                tracing::info!("outputer ss env missing");
                return;
            }
            target = format!("{}:{}", host, port);
        }

        if self.sonny.len() >= self.config.max_sonny {
            self.reply_open_rsp(&id, false, "max sonny").await;
            tracing::info!("outputer max sonny {} {}", id, self.sonny.len());
            return;
        }

        let sonny = ProxyConn::new(None, id.clone(), self.config.conn_buffer);
        sonny.set_established();

        match self.sonny.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.reply_open_rsp(&id, false, "conn id fail").await;
                tracing::error!("outputer open id collision {} {}", target, id);
                return;
            }
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&sonny));
            }
        }

        let me = Arc::clone(&self);
        self.group.spawn(
            format!("outputer processProxyConn {}", target),
            async move { me.process_proxy_conn(sonny, target).await },
        );
    }

    /// Dial under a nested group so the parent can cancel it, and
    /// answer the peer either way.
    async fn open(&self, sonny: &Arc<ProxyConn>, target_addr: &str) -> bool {
        let id = sonny.id();
        tracing::info!("outputer open start {} {}", id, target_addr);

        let wg = Group::new(
            format!("outputer open {}", target_addr),
            Some(&self.group),
            None,
        );

        let slot: Arc<parking_lot::Mutex<Option<Arc<dyn Conn>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let dial_slot = Arc::clone(&slot);
        let dial_group = Arc::clone(&wg);
        let proto = self.proto;
        let opts = self.config.net_options();
        let addr = target_addr.to_string();
        wg.spawn(format!("outputer dial {}", target_addr), async move {
            tokio::select! {
                _ = dial_group.cancelled() => Ok(()),
                r = transport::dial(proto, &addr, &opts) => {
                    *dial_slot.lock() = Some(r?);
                    Ok(())
                }
            }
        });

        let res = wg.wait().await;
        let conn = slot.lock().take();
        match (res, conn) {
            (Ok(()), Some(conn)) => {
                tracing::info!("outputer open ok {} {}", id, target_addr);
                sonny.set_conn(conn);
                self.reply_open_rsp(id, true, "ok").await;
                true
            }
            (Err(e), _) => {
                tracing::error!("outputer dial fail {} {}", target_addr, e);
                self.reply_open_rsp(id, false, &format!("dial fail {}", target_addr))
                    .await;
                false
            }
            (Ok(()), None) => {
                // Cancelled before the dial resolved.
                self.reply_open_rsp(id, false, &format!("dial cancelled {}", target_addr))
                    .await;
                false
            }
        }
    }

    async fn process_proxy_conn(
        self: Arc<Self>,
        sonny: Arc<ProxyConn>,
        target_addr: String,
    ) -> Result<()> {
        let id = sonny.id().to_string();
        tracing::info!("outputer child start {} {}", id, target_addr);

        if !self.open(&sonny, &target_addr).await {
            sonny.sendch.close();
            sonny.recvch.close();
            self.sonny.remove(&id);
            return Ok(());
        }

        let exit_sonny = Arc::clone(&sonny);
        let wg = Group::new(
            format!("outputer child {}", sonny.info()),
            Some(&self.group),
            Some(Box::pin(async move { exit_sonny.shutdown().await })),
        );

        if let Some(conn) = sonny.conn().cloned() {
            spawn_sonny_pumps(&wg, &sonny, &self.father, conn, &self.config);
        }

        let _ = wg.wait().await;
        self.sonny.remove(&id);

        close_remote_conn(&self.group, &sonny, &self.father).await;

        tracing::info!("outputer child end {} {}", id, sonny.info());
        Ok(())
    }

    /// DATA from the peer: hand down to the addressed child.
    pub async fn process_data_frame(&self, d: DataFrame) {
        route_data_frame(&self.sonny, d, self.config.main_write_channel_timeout).await;
    }

    /// CLOSE from the peer: let the child's send pump exit.
    pub async fn process_close_frame(&self, id: String) {
        route_close_frame(&self.sonny, id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn test_setup(max_sonny: usize) -> (Arc<Group>, Arc<ProxyConn>, Arc<Config>) {
        let group = Group::new("t", None, None);
        let father = ProxyConn::new(None, "", 8);
        let config = Arc::new(Config {
            max_sonny,
            ..Config::default()
        });
        (group, father, config)
    }

    async fn next_open_rsp(sendch: &Channel<Frame>) -> (String, bool, String) {
        match sendch.recv().await {
            Some(Frame::OpenRsp { id, ret, msg }) => (id, ret, msg),
            other => panic!("expected OPENRSP, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_rejected_at_capacity() {
        let (group, father, config) = test_setup(0);
        let outputer = Outputer::new(
            &group,
            ProxyProto::Tcp,
            ClientType::Proxy,
            config,
            Arc::clone(&father),
        );

        Arc::clone(&outputer)
            .process_open_frame("id1".into(), "127.0.0.1:1".into())
            .await;
        let (id, ret, msg) = next_open_rsp(&father.sendch).await;
        assert_eq!(id, "id1");
        assert!(!ret);
        assert_eq!(msg, "max sonny");
        assert_eq!(outputer.sonny_size(), 0);
    }

    #[tokio::test]
    async fn test_open_dial_failure_reports_and_unregisters() {
        let (group, father, config) = test_setup(8);
        let outputer = Outputer::new(
            &group,
            ProxyProto::Tcp,
            ClientType::Proxy,
            Arc::new(Config {
                connect_timeout: tokio::time::Duration::from_millis(300),
                ..(*config).clone()
            }),
            Arc::clone(&father),
        );

        // Nothing listens on this port; the dial fails fast.
        Arc::clone(&outputer)
            .process_open_frame("id2".into(), "127.0.0.1:1".into())
            .await;
        let (id, ret, _) = next_open_rsp(&father.sendch).await;
        assert_eq!(id, "id2");
        assert!(!ret);

        // The failed child must not linger in the registry.
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        assert_eq!(outputer.sonny_size(), 0);
        group.stop();
        let _ = group.wait().await;
    }

    #[tokio::test]
    async fn test_duplicate_open_id_rejected() {
        let (group, father, config) = test_setup(8);
        let outputer = Outputer::new(
            &group,
            ProxyProto::Tcp,
            ClientType::Proxy,
            config,
            Arc::clone(&father),
        );

        let sonny = ProxyConn::new(None, "dup", 4);
        outputer.sonny.insert("dup".into(), sonny);

        Arc::clone(&outputer)
            .process_open_frame("dup".into(), "127.0.0.1:1".into())
            .await;
        let (_, ret, msg) = next_open_rsp(&father.sendch).await;
        assert!(!ret);
        assert_eq!(msg, "conn id fail");
        group.stop();
        let _ = group.wait().await;
    }
}
