//! spp command-line entry point.
//!
//! One binary, five modes: `server`, `proxy_client`,
//! `reverse_proxy_client`, `socks5_client`, `reverse_socks5_client`
//! (plus `ss_proxy_client` for the shadowsocks plugin deployment).

use anyhow::{bail, Context};
use clap::Parser;

use spp::{Client, ClientType, Config, ProxyProto, Server};

#[derive(Parser, Debug)]
#[command(name = "spp", version, about = "multiplexed port-forwarding proxy")]
struct Args {
    /// server/proxy_client/reverse_proxy_client/socks5_client/reverse_socks5_client/ss_proxy_client
    #[arg(long = "type")]
    mode: String,

    /// Control-channel proto (repeatable on the server): tcp/rudp/ricmp
    #[arg(long, default_value = "tcp")]
    proto: Vec<String>,

    /// Server listen addr (repeatable, one per --proto)
    #[arg(long)]
    listen: Vec<String>,

    /// Client name
    #[arg(long, default_value = "client")]
    name: String,

    /// Server addr
    #[arg(long, default_value = "")]
    server: String,

    /// Proxied transport per tunnel (repeatable): tcp/udp/rudp/ricmp
    #[arg(long)]
    proxyproto: Vec<String>,

    /// Local listen addr per tunnel (repeatable)
    #[arg(long)]
    fromaddr: Vec<String>,

    /// Target addr per tunnel (repeatable)
    #[arg(long)]
    toaddr: Vec<String>,

    /// Verify key
    #[arg(long, default_value = "123456")]
    key: String,

    /// Encrypt key, empty means off
    #[arg(long, default_value = "default")]
    encrypt: String,

    /// Start compress size, 0 means off
    #[arg(long, default_value_t = 128)]
    compress: usize,

    /// Max client connections (server)
    #[arg(long, default_value_t = 8)]
    maxclient: usize,

    /// Max child connections per control channel
    #[arg(long, default_value_t = 128)]
    maxconn: usize,

    /// SOCKS5 username
    #[arg(long, default_value = "")]
    username: String,

    /// SOCKS5 password
    #[arg(long, default_value = "")]
    password: String,

    /// Show ping round trips
    #[arg(long, default_value_t = false)]
    ping: bool,

    /// Log level: trace/debug/info/warn/error
    #[arg(long, default_value = "info")]
    loglevel: String,
}

const CLIENT_MODES: &[&str] = &[
    "proxy_client",
    "reverse_proxy_client",
    "socks5_client",
    "reverse_socks5_client",
    "ss_proxy_client",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.loglevel.clone())),
        )
        .with_target(false)
        .init();

    tracing::info!("start...");

    let mut config = Config::default();
    config.compress = args.compress;
    config.key = args.key.clone();
    config.encrypt = args.encrypt.clone();
    config.show_ping = args.ping;
    config.username = args.username.clone();
    config.password = args.password.clone();
    config.max_client = args.maxclient;
    config.max_sonny = args.maxconn;

    if args.mode == "server" {
        run_server(args, config).await
    } else if CLIENT_MODES.contains(&args.mode.as_str()) {
        run_client(args, config).await
    } else {
        bail!(
            "[type] must be server/{}",
            CLIENT_MODES.join("/")
        );
    }
}

async fn run_server(args: Args, config: Config) -> anyhow::Result<()> {
    if args.listen.is_empty() {
        bail!("[server] need [listen]");
    }
    if args.listen.len() != args.proto.len() {
        bail!("[proto] [listen] len must be equal");
    }

    let mut protos = Vec::with_capacity(args.proto.len());
    for p in &args.proto {
        let proto = ProxyProto::from_name(p).context("[proto] must be tcp/rudp/ricmp")?;
        if proto == ProxyProto::Udp {
            bail!("[proto] must be tcp/rudp/ricmp");
        }
        protos.push(proto);
    }

    let server = Server::new(config, protos, args.listen.clone()).await?;
    tracing::info!("server start on {:?}", server.listen_addrs());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            server.close().await;
        }
        r = server.wait() => {
            r?;
        }
    }
    Ok(())
}

async fn run_client(args: Args, config: Config) -> anyhow::Result<()> {
    if args.server.is_empty() {
        bail!("[{}] need [server]", args.mode);
    }
    if args.proxyproto.is_empty() {
        bail!("[{}] need [proxyproto]", args.mode);
    }
    if args.fromaddr.len() != args.proxyproto.len() {
        bail!("[fromaddr] [proxyproto] len must be equal");
    }

    let needs_toaddr = matches!(
        args.mode.as_str(),
        "proxy_client" | "reverse_proxy_client" | "ss_proxy_client"
    );
    if needs_toaddr && args.toaddr.len() != args.proxyproto.len() {
        bail!("[fromaddr] [toaddr] [proxyproto] len must be equal");
    }

    let clienttype = ClientType::from_name(args.mode.trim_end_matches("_client"))?;

    let control_proto =
        ProxyProto::from_name(args.proto.first().map(String::as_str).unwrap_or("tcp"))?;
    if control_proto == ProxyProto::Udp {
        bail!("[proto] must be tcp/rudp/ricmp");
    }

    let mut proxyprotos = Vec::with_capacity(args.proxyproto.len());
    for p in &args.proxyproto {
        proxyprotos.push(ProxyProto::from_name(p)?);
    }

    let client = Client::new(
        config,
        control_proto,
        args.server.clone(),
        args.name.clone(),
        clienttype,
        proxyprotos,
        args.fromaddr.clone(),
        args.toaddr.clone(),
    )?;
    tracing::info!("client start, server {}", args.server);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            client.close().await;
        }
        r = client.wait() => {
            r?;
        }
    }
    Ok(())
}
