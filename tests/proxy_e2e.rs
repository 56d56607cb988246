//! End-to-end scenarios over loopback: a real server, a real client,
//! and plain sockets on both ends of the tunnel.

use spp::frame::{self, Frame, LoginFrame};
use spp::{Client, ClientType, Config, ProxyProto, Server};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Duration};

fn test_config() -> Config {
    Config {
        key: "k".to_string(),
        encrypt: String::new(),
        compress: 128,
        ..Config::default()
    }
}

/// TCP echo server; returns its address.
async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP echo server; returns its address.
async fn spawn_udp_echo() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// Grab a port that is almost certainly free to bind right after.
fn free_addr() -> String {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().to_string()
}

/// Connect to an address that a tunnel role is still in the middle of
/// binding.
async fn connect_retry(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(s) = TcpStream::connect(addr).await {
            return s;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("could not connect to {}", addr);
}

async fn write_frame(stream: &mut TcpStream, f: Frame) {
    let body = frame::encode(f, 0, "").unwrap();
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut lenbuf = [0u8; 4];
    stream.read_exact(&mut lenbuf).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(lenbuf) as usize];
    stream.read_exact(&mut body).await.unwrap();
    frame::decode(&body, "").unwrap()
}

#[tokio::test]
async fn forward_tcp_proxy_echoes() {
    let echo = spawn_echo().await;
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let from = free_addr();
    let client = Client::new(
        test_config(),
        ProxyProto::Tcp,
        saddr,
        "c1".to_string(),
        ClientType::Proxy,
        vec![ProxyProto::Tcp],
        vec![from.clone()],
        vec![echo],
    )
    .unwrap();

    let mut stream = connect_retry(&from).await;
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"hello");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn reverse_tcp_proxy_echoes() {
    let echo = spawn_echo().await;
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    // The server listens on `from` once the login lands; the client
    // dials the echo target.
    let from = free_addr();
    let client = Client::new(
        test_config(),
        ProxyProto::Tcp,
        saddr,
        "c1".to_string(),
        ClientType::ReverseProxy,
        vec![ProxyProto::Tcp],
        vec![from.clone()],
        vec![echo],
    )
    .unwrap();

    let mut stream = connect_retry(&from).await;
    stream.write_all(b"reverse").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"reverse");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn udp_forward_proxy_echoes() {
    let echo = spawn_udp_echo().await;
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let from = free_addr();
    let client = Client::new(
        test_config(),
        ProxyProto::Tcp,
        saddr,
        "c1".to_string(),
        ClientType::Proxy,
        vec![ProxyProto::Udp],
        vec![from.clone()],
        vec![echo],
    )
    .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(&from).await.unwrap();

    // The local udp listener binds after the login round trip; keep
    // probing until a datagram makes it through the tunnel and back.
    let mut buf = [0u8; 64];
    let mut echoed = None;
    for _ in 0..50 {
        let _ = socket.send(b"ping-udp").await;
        if let Ok(Ok(n)) = timeout(Duration::from_millis(300), socket.recv(&mut buf)).await {
            echoed = Some(buf[..n].to_vec());
            break;
        }
    }
    assert_eq!(echoed.as_deref(), Some(&b"ping-udp"[..]));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn socks5_client_tunnels_connect() {
    let echo = spawn_echo().await;
    let echo_addr: std::net::SocketAddr = echo.parse().unwrap();
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let from = free_addr();
    let client = Client::new(
        test_config(),
        ProxyProto::Tcp,
        saddr,
        "c1".to_string(),
        ClientType::Socks5,
        vec![ProxyProto::Tcp],
        vec![from.clone()],
        vec![],
    )
    .unwrap();

    let mut stream = connect_retry(&from).await;

    // Method negotiation: NoAuth.
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0x00]);

    // CONNECT to the echo server by IPv4.
    let std::net::IpAddr::V4(ip) = echo_addr.ip() else {
        panic!("expected v4 echo addr");
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(&echo_addr.port().to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x43]
    );

    stream.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"abc");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn duplicate_login_name_rejected() {
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let login = || {
        Frame::Login(LoginFrame {
            proxyproto: ProxyProto::Tcp,
            clienttype: ClientType::Proxy,
            fromaddr: "127.0.0.1:1".to_string(),
            toaddr: "127.0.0.1:1".to_string(),
            name: "c_0".to_string(),
            key: "k".to_string(),
        })
    };

    let mut first = TcpStream::connect(&saddr).await.unwrap();
    write_frame(&mut first, login()).await;
    match read_frame(&mut first).await {
        Frame::LoginRsp { ret, msg } => {
            assert!(ret, "first login refused: {}", msg);
        }
        other => panic!("expected LOGINRSP, got {:?}", other),
    }

    let mut second = TcpStream::connect(&saddr).await.unwrap();
    write_frame(&mut second, login()).await;
    match read_frame(&mut second).await {
        Frame::LoginRsp { ret, msg } => {
            assert!(!ret);
            assert!(msg.contains("has login before"), "msg: {}", msg);
        }
        other => panic!("expected LOGINRSP, got {:?}", other),
    }

    drop(first);
    server.close().await;
}

#[tokio::test]
async fn bad_key_rejected() {
    let server = Server::new(
        test_config(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let mut conn = TcpStream::connect(&saddr).await.unwrap();
    write_frame(
        &mut conn,
        Frame::Login(LoginFrame {
            proxyproto: ProxyProto::Tcp,
            clienttype: ClientType::Proxy,
            fromaddr: "127.0.0.1:1".to_string(),
            toaddr: "127.0.0.1:1".to_string(),
            name: "c_0".to_string(),
            key: "wrong".to_string(),
        }),
    )
    .await;
    match read_frame(&mut conn).await {
        Frame::LoginRsp { ret, msg } => {
            assert!(!ret);
            assert_eq!(msg, "key error");
        }
        other => panic!("expected LOGINRSP, got {:?}", other),
    }

    server.close().await;
}

#[tokio::test]
async fn idle_child_torn_down_control_survives() {
    let echo = spawn_echo().await;
    let mut cfg = test_config();
    cfg.conn_timeout = Duration::from_secs(2);

    let server = Server::new(
        cfg.clone(),
        vec![ProxyProto::Tcp],
        vec!["127.0.0.1:0".to_string()],
    )
    .await
    .unwrap();
    let saddr = server.listen_addrs()[0].clone();

    let from = free_addr();
    let client = Client::new(
        cfg,
        ProxyProto::Tcp,
        saddr,
        "c1".to_string(),
        ClientType::Proxy,
        vec![ProxyProto::Tcp],
        vec![from.clone()],
        vec![echo],
    )
    .unwrap();

    // Prove the tunnel works once.
    let mut stream = connect_retry(&from).await;
    stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();

    // Then go silent past the idle window; both ends drop the child.
    let n = timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("child was not torn down");
    assert!(matches!(n, Ok(0) | Err(_)));

    // The control channel survives: a fresh conn still tunnels.
    let mut stream = connect_retry(&from).await;
    stream.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("tunnel did not survive child teardown")
        .unwrap();
    assert_eq!(&buf, b"again");

    client.close().await;
    server.close().await;
}
