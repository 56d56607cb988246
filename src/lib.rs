//! # spp — multiplexed port-forwarding proxy
//!
//! A bidirectional TCP/UDP port-forwarding proxy that tunnels many
//! logical streams over a single framed control connection. A client
//! binds local listening sockets and tunnels accepted connections (or
//! SOCKS5 requests) to a server that dials the real target; reverse
//! modes swap who listens and who dials.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │        Orchestrators (client / server, LOGIN roles)      │
//! ├──────────────────────────────────────────────────────────┤
//! │   Inputer (accept + OPEN)    Outputer (dial + OPENRSP)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Control loop (recv / send / ping / close / dispatch)    │
//! ├──────────────────────────────────────────────────────────┤
//! │  Frame codec (length prefix, Snappy + RC4 on DATA)       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Transport seam (tcp streams, udp datagram demux)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every connection is owned by a supervisor group: the first failing
//! task tears down its siblings, the transport, and the channels, and
//! the peer learns about it through the closest semantic frame
//! (OPENRSP false, CLOSE, LOGINRSP false) or a plain close.

#![warn(rust_2018_idioms)]

pub mod channel;
pub mod error;
pub mod frame;
pub mod group;
pub mod proxy;
pub mod socks5;
pub mod transport;

pub use error::{Error, Result};
pub use frame::{ClientType, Frame, ProxyProto};
pub use proxy::{Client, Config, Server};
