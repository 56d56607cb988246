//! SOCKS5 boundary for listening proxy roles.
//!
//! Implements the server side of RFC 1928 method negotiation (plus the
//! RFC 1929 username/password subnegotiation) and the CONNECT request
//! parse, producing the canonical `host:port` the tunnel should dial.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::transport::{read_full, Conn};

const SOCKS_VER5: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const USER_AUTH_VER: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Canned CONNECT success reply with a dummy bound address. Sent
/// immediately after the request parse; a failed upstream dial surfaces
/// to the client as a later connection reset.
pub const CONNECT_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x43];

/// Run method negotiation on a freshly accepted connection.
///
/// With empty credentials the server selects NoAuth; otherwise it
/// requires the username/password subnegotiation and verifies against
/// the configured strings.
pub async fn handshake(conn: &dyn Conn, username: &str, password: &str) -> Result<()> {
    let mut head = [0u8; 2];
    read_full(conn, &mut head).await?;
    if head[0] != SOCKS_VER5 {
        return Err(Error::protocol(format!("socks version {}", head[0])));
    }
    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    read_full(conn, &mut methods).await?;

    if username.is_empty() && password.is_empty() {
        conn.write(&[SOCKS_VER5, METHOD_NO_AUTH]).await?;
        return Ok(());
    }

    conn.write(&[SOCKS_VER5, METHOD_USER_PASS]).await?;

    let mut head = [0u8; 2];
    read_full(conn, &mut head).await?;
    if head[0] != USER_AUTH_VER {
        return Err(Error::protocol(format!("socks auth version {}", head[0])));
    }
    let mut user = vec![0u8; head[1] as usize];
    read_full(conn, &mut user).await?;

    let mut plen = [0u8; 1];
    read_full(conn, &mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    read_full(conn, &mut pass).await?;

    if user == username.as_bytes() && pass == password.as_bytes() {
        conn.write(&[USER_AUTH_VER, AUTH_SUCCESS]).await?;
        Ok(())
    } else {
        conn.write(&[USER_AUTH_VER, AUTH_FAILURE]).await?;
        Err(Error::AuthFailed("socks user/pass mismatch".into()))
    }
}

/// Parse the CONNECT request and return the target as `host:port`.
pub async fn read_request(conn: &dyn Conn) -> Result<String> {
    let mut head = [0u8; 4];
    read_full(conn, &mut head).await?;
    if head[0] != SOCKS_VER5 {
        return Err(Error::protocol(format!("socks version {}", head[0])));
    }
    if head[1] != CMD_CONNECT {
        return Err(Error::protocol(format!("socks command {}", head[1])));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            read_full(conn, &mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port).to_string())
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            read_full(conn, &mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(SocketAddr::new(IpAddr::V6(ip), port).to_string())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_full(conn, &mut len).await?;
            let mut raw = vec![0u8; len[0] as usize + 2];
            read_full(conn, &mut raw).await?;
            let domain = std::str::from_utf8(&raw[..len[0] as usize])
                .map_err(|_| Error::protocol("socks domain not utf-8"))?;
            let port = u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
            Ok(format!("{}:{}", domain, port))
        }
        other => Err(Error::protocol(format!("socks addr type {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ProxyProto;
    use crate::transport::{dial, listen, NetOptions};

    async fn pair() -> (std::sync::Arc<dyn Conn>, std::sync::Arc<dyn Conn>) {
        let listener = listen(ProxyProto::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let client = dial(ProxyProto::Tcp, &addr, &NetOptions::default()).await.unwrap();
        let server = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_noauth_connect_ipv4() {
        let (client, server) = pair().await;

        let task = tokio::spawn(async move {
            handshake(server.as_ref(), "", "").await.unwrap();
            read_request(server.as_ref()).await.unwrap()
        });

        client.write(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        read_full(client.as_ref(), &mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        client
            .write(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_domain_request() {
        let (client, server) = pair().await;
        let task = tokio::spawn(async move {
            handshake(server.as_ref(), "", "").await.unwrap();
            read_request(server.as_ref()).await.unwrap()
        });

        client.write(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        read_full(client.as_ref(), &mut buf).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write(&req).await.unwrap();
        assert_eq!(task.await.unwrap(), "example.com:443");
    }

    #[tokio::test]
    async fn test_userpass_auth() {
        let (client, server) = pair().await;
        let task = tokio::spawn(async move { handshake(server.as_ref(), "bob", "pw").await });

        client.write(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut buf = [0u8; 2];
        read_full(client.as_ref(), &mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x02]);

        let mut auth = vec![0x01, 3];
        auth.extend_from_slice(b"bob");
        auth.push(2);
        auth.extend_from_slice(b"pw");
        client.write(&auth).await.unwrap();

        read_full(client.as_ref(), &mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x00]);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_userpass_rejected() {
        let (client, server) = pair().await;
        let task = tokio::spawn(async move { handshake(server.as_ref(), "bob", "pw").await });

        client.write(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut buf = [0u8; 2];
        read_full(client.as_ref(), &mut buf).await.unwrap();

        let mut auth = vec![0x01, 3];
        auth.extend_from_slice(b"bob");
        auth.push(3);
        auth.extend_from_slice(b"bad");
        client.write(&auth).await.unwrap();

        read_full(client.as_ref(), &mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x01]);
        assert!(matches!(task.await.unwrap(), Err(Error::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let (client, server) = pair().await;
        let task = tokio::spawn(async move { read_request(server.as_ref()).await });
        client.write(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
    }
}
