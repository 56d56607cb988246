//! Control-channel frames and their wire codec.
//!
//! Every message on the control channel is one tagged frame, sent as
//! `u32 LE length || tag(1) || fields`. DATA payloads are Snappy
//! compressed above the configured threshold and RC4 encrypted when an
//! encrypt key is set — compression first, then encryption.

use bytes::{Buf, BufMut};
use rc4::{consts::U16, KeyInit, Rc4, StreamCipher};

use crate::error::{Error, Result};

/// Extra wire bytes allowed on top of the configured max payload size,
/// covering the frame header and field prefixes.
pub const MAX_FRAME_OVERHEAD: usize = 100;

/// DATA sequence numbers wrap at this modulus.
pub const MAX_INDEX: u32 = 1024;

const TAG_LOGIN: u8 = 0x01;
const TAG_LOGINRSP: u8 = 0x02;
const TAG_PING: u8 = 0x03;
const TAG_PONG: u8 = 0x04;
const TAG_OPEN: u8 = 0x05;
const TAG_OPENRSP: u8 = 0x06;
const TAG_DATA: u8 = 0x07;
const TAG_CLOSE: u8 = 0x08;

/// Proxied transport protocol carried in LOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyProto {
    Tcp = 0,
    Udp = 1,
    Rudp = 2,
    Ricmp = 3,
}

impl ProxyProto {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProto::Tcp => "tcp",
            ProxyProto::Udp => "udp",
            ProxyProto::Rudp => "rudp",
            ProxyProto::Ricmp => "ricmp",
        }
    }

    pub fn from_name(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProxyProto::Tcp),
            "udp" => Ok(ProxyProto::Udp),
            "rudp" => Ok(ProxyProto::Rudp),
            "ricmp" => Ok(ProxyProto::Ricmp),
            _ => Err(Error::config(format!("no PROXY_PROTO {}", s))),
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ProxyProto::Tcp),
            1 => Ok(ProxyProto::Udp),
            2 => Ok(ProxyProto::Rudp),
            3 => Ok(ProxyProto::Ricmp),
            _ => Err(Error::malformed(format!("unknown proxy proto: {}", v))),
        }
    }
}

/// Role requested by the client at LOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientType {
    Proxy = 0,
    ReverseProxy = 1,
    Socks5 = 2,
    ReverseSocks5 = 3,
    SsProxy = 4,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Proxy => "PROXY",
            ClientType::ReverseProxy => "REVERSE_PROXY",
            ClientType::Socks5 => "SOCKS5",
            ClientType::ReverseSocks5 => "REVERSE_SOCKS5",
            ClientType::SsProxy => "SS_PROXY",
        }
    }

    pub fn from_name(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PROXY" => Ok(ClientType::Proxy),
            "REVERSE_PROXY" => Ok(ClientType::ReverseProxy),
            "SOCKS5" => Ok(ClientType::Socks5),
            "REVERSE_SOCKS5" => Ok(ClientType::ReverseSocks5),
            "SS_PROXY" => Ok(ClientType::SsProxy),
            _ => Err(Error::config(format!("no CLIENT_TYPE {}", s))),
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ClientType::Proxy),
            1 => Ok(ClientType::ReverseProxy),
            2 => Ok(ClientType::Socks5),
            3 => Ok(ClientType::ReverseSocks5),
            4 => Ok(ClientType::SsProxy),
            _ => Err(Error::malformed(format!("unknown client type: {}", v))),
        }
    }
}

/// LOGIN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFrame {
    pub proxyproto: ProxyProto,
    pub clienttype: ClientType,
    pub fromaddr: String,
    pub toaddr: String,
    pub name: String,
    pub key: String,
}

/// DATA payload for one child stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub id: String,
    pub data: Vec<u8>,
    pub compress: bool,
    pub index: u32,
    pub crc: u32,
}

/// One control-channel frame. The payload variant is the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Login(LoginFrame),
    LoginRsp { ret: bool, msg: String },
    Ping { time: i64 },
    Pong { time: i64 },
    Open { id: String, toaddr: String },
    OpenRsp { id: String, ret: bool, msg: String },
    Data(DataFrame),
    Close { id: String },
}

impl Frame {
    /// Short tag name for logging.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Frame::Login(_) => "LOGIN",
            Frame::LoginRsp { .. } => "LOGINRSP",
            Frame::Ping { .. } => "PING",
            Frame::Pong { .. } => "PONG",
            Frame::Open { .. } => "OPEN",
            Frame::OpenRsp { .. } => "OPENRSP",
            Frame::Data(_) => "DATA",
            Frame::Close { .. } => "CLOSE",
        }
    }
}

/// CRC32 of a DATA payload, stamped and verified only when debug
/// logging is enabled.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

/// Whether debug-level diagnostics (CRC stamping and checks) are on.
pub fn debug_checks() -> bool {
    tracing::enabled!(tracing::Level::DEBUG)
}

fn rc4_apply(key: &str, data: &mut [u8]) {
    // RC4 wants a fixed-size key; both ends derive it the same way.
    let digest = md5::compute(key.as_bytes());
    let mut cipher = Rc4::<U16>::new(rc4::Key::<U16>::from_slice(&digest.0));
    cipher.apply_keystream(data);
}

/// Serialize a frame, applying compression and encryption to DATA.
///
/// Compression only sticks if it made the payload strictly shorter.
/// A `compress_min` of 0 disables compression, an empty `encrypt` key
/// disables the RC4 pass.
pub fn encode(mut frame: Frame, compress_min: usize, encrypt: &str) -> Result<Vec<u8>> {
    if let Frame::Data(ref mut d) = frame {
        if compress_min > 0 && !d.compress && d.data.len() > compress_min {
            let packed = snap::raw::Encoder::new()
                .compress_vec(&d.data)
                .map_err(|e| Error::malformed(format!("compress fail: {}", e)))?;
            if packed.len() < d.data.len() {
                tracing::trace!("compressed {} -> {}", d.data.len(), packed.len());
                d.data = packed;
                d.compress = true;
            }
        }
        if !encrypt.is_empty() {
            rc4_apply(encrypt, &mut d.data);
        }
    }

    let mut buf = Vec::with_capacity(64);
    match &frame {
        Frame::Login(l) => {
            buf.put_u8(TAG_LOGIN);
            buf.put_u8(l.proxyproto as u8);
            buf.put_u8(l.clienttype as u8);
            put_string(&mut buf, &l.fromaddr)?;
            put_string(&mut buf, &l.toaddr)?;
            put_string(&mut buf, &l.name)?;
            put_string(&mut buf, &l.key)?;
        }
        Frame::LoginRsp { ret, msg } => {
            buf.put_u8(TAG_LOGINRSP);
            buf.put_u8(*ret as u8);
            put_string(&mut buf, msg)?;
        }
        Frame::Ping { time } => {
            buf.put_u8(TAG_PING);
            buf.put_i64_le(*time);
        }
        Frame::Pong { time } => {
            buf.put_u8(TAG_PONG);
            buf.put_i64_le(*time);
        }
        Frame::Open { id, toaddr } => {
            buf.put_u8(TAG_OPEN);
            put_string(&mut buf, id)?;
            put_string(&mut buf, toaddr)?;
        }
        Frame::OpenRsp { id, ret, msg } => {
            buf.put_u8(TAG_OPENRSP);
            put_string(&mut buf, id)?;
            buf.put_u8(*ret as u8);
            put_string(&mut buf, msg)?;
        }
        Frame::Data(d) => {
            buf.put_u8(TAG_DATA);
            put_string(&mut buf, &d.id)?;
            buf.put_u8(d.compress as u8);
            buf.put_u32_le(d.index);
            buf.put_u32_le(d.crc);
            buf.put_u32_le(d.data.len() as u32);
            buf.put_slice(&d.data);
        }
        Frame::Close { id } => {
            buf.put_u8(TAG_CLOSE);
            put_string(&mut buf, id)?;
        }
    }
    Ok(buf)
}

/// Deserialize a frame, undoing encryption and compression on DATA.
pub fn decode(buf: &[u8], encrypt: &str) -> Result<Frame> {
    let mut buf = buf;
    let tag = get_u8(&mut buf)?;
    let frame = match tag {
        TAG_LOGIN => Frame::Login(LoginFrame {
            proxyproto: ProxyProto::from_u8(get_u8(&mut buf)?)?,
            clienttype: ClientType::from_u8(get_u8(&mut buf)?)?,
            fromaddr: get_string(&mut buf)?,
            toaddr: get_string(&mut buf)?,
            name: get_string(&mut buf)?,
            key: get_string(&mut buf)?,
        }),
        TAG_LOGINRSP => Frame::LoginRsp {
            ret: get_u8(&mut buf)? != 0,
            msg: get_string(&mut buf)?,
        },
        TAG_PING => Frame::Ping {
            time: get_i64(&mut buf)?,
        },
        TAG_PONG => Frame::Pong {
            time: get_i64(&mut buf)?,
        },
        TAG_OPEN => Frame::Open {
            id: get_string(&mut buf)?,
            toaddr: get_string(&mut buf)?,
        },
        TAG_OPENRSP => Frame::OpenRsp {
            id: get_string(&mut buf)?,
            ret: get_u8(&mut buf)? != 0,
            msg: get_string(&mut buf)?,
        },
        TAG_DATA => {
            let id = get_string(&mut buf)?;
            let compress = get_u8(&mut buf)? != 0;
            let index = get_u32(&mut buf)?;
            let crc = get_u32(&mut buf)?;
            let mut data = get_bytes(&mut buf)?;

            if !encrypt.is_empty() {
                rc4_apply(encrypt, &mut data);
            }
            if compress {
                data = snap::raw::Decoder::new()
                    .decompress_vec(&data)
                    .map_err(|e| Error::malformed(format!("decompress fail: {}", e)))?;
            }
            Frame::Data(DataFrame {
                id,
                data,
                compress: false,
                index,
                crc,
            })
        }
        TAG_CLOSE => Frame::Close {
            id: get_string(&mut buf)?,
        },
        _ => return Err(Error::malformed(format!("unknown tag: 0x{:02x}", tag))),
    };

    if buf.has_remaining() {
        return Err(Error::malformed(format!(
            "{} trailing bytes after {}",
            buf.remaining(),
            frame.tag_name()
        )));
    }
    Ok(frame)
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::malformed(format!("string field too long: {}", s.len())));
    }
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::malformed("truncated frame"));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::malformed("truncated frame"));
    }
    Ok(buf.get_u32_le())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::malformed("truncated frame"));
    }
    Ok(buf.get_i64_le())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::malformed("truncated frame"));
    }
    let n = buf.get_u16_le() as usize;
    if buf.remaining() < n {
        return Err(Error::malformed("truncated string field"));
    }
    let mut raw = vec![0u8; n];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| Error::malformed("string field not utf-8"))
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Error::malformed("truncated frame"));
    }
    let n = buf.get_u32_le() as usize;
    if buf.remaining() < n {
        return Err(Error::malformed("truncated data field"));
    }
    let mut raw = vec![0u8; n];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(payload: &[u8]) -> Frame {
        Frame::Data(DataFrame {
            id: "abc123".into(),
            data: payload.to_vec(),
            compress: false,
            index: 7,
            crc: crc32(payload),
        })
    }

    #[test]
    fn test_roundtrip_all_tags() {
        let frames = vec![
            Frame::Login(LoginFrame {
                proxyproto: ProxyProto::Tcp,
                clienttype: ClientType::ReverseSocks5,
                fromaddr: "127.0.0.1:8080".into(),
                toaddr: "".into(),
                name: "client_0".into(),
                key: "123456".into(),
            }),
            Frame::LoginRsp {
                ret: false,
                msg: "key error".into(),
            },
            Frame::Ping { time: 1234567890 },
            Frame::Pong { time: -5 },
            Frame::Open {
                id: "a".into(),
                toaddr: "1.2.3.4:80".into(),
            },
            Frame::OpenRsp {
                id: "a".into(),
                ret: true,
                msg: "ok".into(),
            },
            data_frame(b"hello"),
            Frame::Close { id: "a".into() },
        ];
        for f in frames {
            let wire = encode(f.clone(), 0, "").unwrap();
            assert_eq!(decode(&wire, "").unwrap(), f);
        }
    }

    #[test]
    fn test_roundtrip_encrypted() {
        let f = data_frame(b"attack at dawn");
        let wire = encode(f.clone(), 0, "secret").unwrap();
        // Ciphertext must differ from the plaintext on the wire.
        assert!(!wire.windows(14).any(|w| w == &b"attack at dawn"[..]));
        assert_eq!(decode(&wire, "secret").unwrap(), f);
    }

    #[test]
    fn test_wrong_key_corrupts_payload() {
        let f = data_frame(b"plaintext bytes");
        let wire = encode(f.clone(), 0, "key-a").unwrap();
        match decode(&wire, "key-b").unwrap() {
            Frame::Data(d) => assert_ne!(d.data, b"plaintext bytes"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_compression_only_when_shorter() {
        // Highly repetitive payload compresses well.
        let f = data_frame(&vec![b'x'; 4096]);
        let wire = encode(f.clone(), 128, "").unwrap();
        assert!(wire.len() < 4096);
        assert_eq!(decode(&wire, "").unwrap(), f);

        // Below the threshold the payload must pass through untouched.
        let small = data_frame(b"tiny");
        let wire = encode(small.clone(), 128, "").unwrap();
        assert_eq!(decode(&wire, "").unwrap(), small);
    }

    #[test]
    fn test_compress_then_encrypt_roundtrip() {
        let f = data_frame(&vec![b'z'; 2048]);
        let wire = encode(f.clone(), 64, "default").unwrap();
        assert_eq!(decode(&wire, "default").unwrap(), f);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(matches!(
            decode(&[0xff, 0x00], ""),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let wire = encode(data_frame(b"hello"), 0, "").unwrap();
        assert!(matches!(
            decode(&wire[..wire.len() - 2], ""),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut wire = encode(Frame::Close { id: "a".into() }, 0, "").unwrap();
        wire.push(0x00);
        assert!(matches!(decode(&wire, ""), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_proto_names() {
        assert_eq!(ProxyProto::from_name("TCP").unwrap(), ProxyProto::Tcp);
        assert_eq!(ClientType::from_name("reverse_proxy").unwrap(), ClientType::ReverseProxy);
        assert!(ProxyProto::from_name("quic").is_err());
        assert!(ClientType::from_name("SOCKS4").is_err());
    }
}
