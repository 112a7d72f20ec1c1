#![forbid(unsafe_code)]

//! `gauze-rtc-v1` protocol codec.
//!
//! This crate is the canonical definition of the message protocol spoken between the
//! sandboxed client (`gauze-rtc-sockets` / `gauze-rtc-service`) and the privileged
//! provider process that owns the real sockets. Each transport message carries exactly
//! one frame.
//!
//! Wire format (all integer fields big-endian):
//!
//! ```text
//! 0               1               9               13
//! +---------------+---------------+---------------+
//! | msg_type (u8) |   id (u64)    |  len (u32)    |  header (13 bytes)
//! +---------------+---------------+---------------+
//! | payload (len bytes)                           |
//! +----------------------------------------------+
//! ```
//!
//! `id` addresses the proxy socket or resolver the frame belongs to. Identifier 0 is
//! reserved as "no identifier" and never appears on the wire for a live object.

use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const RTC_SUBPROTOCOL: &str = "gauze-rtc-v1";

pub const FRAME_HEADER_LEN: usize = 13;

// Client → provider message types.
pub const MSG_CREATE_UDP_SOCKET: u8 = 1;
pub const MSG_CREATE_SERVER_TCP_SOCKET: u8 = 2;
pub const MSG_CREATE_CLIENT_TCP_SOCKET: u8 = 3;
pub const MSG_SEND_PACKET: u8 = 4;
pub const MSG_SET_OPTION: u8 = 5;
pub const MSG_CLOSE: u8 = 6;
pub const MSG_CREATE_RESOLVER: u8 = 7;

// Provider → client message types.
pub const MSG_OPENED: u8 = 128;
pub const MSG_CONNECTION_FAILED: u8 = 129;
pub const MSG_SENT_CONFIRMATION: u8 = 130;
pub const MSG_DATA_RECEIVED: u8 = 131;
pub const MSG_REMOTE_CLOSED: u8 = 132;
pub const MSG_RESOLVED: u8 = 133;
pub const MSG_RESOLUTION_FAILED: u8 = 134;

/// Address family byte for IPv4 socket/IP addresses.
pub const AF_IPV4: u8 = 4;
/// Address family byte for IPv6 socket/IP addresses.
pub const AF_IPV6: u8 = 6;

/// Default maximum frame payload size in bytes.
///
/// RTC packets are datagram-sized; this leaves generous headroom without letting a
/// misbehaving peer force unbounded allocations.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 256 * 1024;

/// Stable error codes carried inside `ConnectionFailed` / `ResolutionFailed` payloads.
///
/// Numeric values are part of the wire protocol and must not be changed once released.
pub const ERROR_CODE_PROTOCOL_ERROR: u16 = 1;
pub const ERROR_CODE_BIND_FAILED: u16 = 2;
pub const ERROR_CODE_CONNECTION_REFUSED: u16 = 3;
pub const ERROR_CODE_CONNECTION_RESET: u16 = 4;
pub const ERROR_CODE_NETWORK_UNREACHABLE: u16 = 5;
pub const ERROR_CODE_TIMED_OUT: u16 = 6;
pub const ERROR_CODE_NAME_NOT_RESOLVED: u16 = 7;
pub const ERROR_CODE_TRANSPORT_FAILURE: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Socket options a client may set on a proxy socket.
///
/// Wire values mirror the option set the real sockets understand; they are stable
/// protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    DontFragment,
    ReceiveBuffer,
    SendBuffer,
    NoDelay,
    Dscp,
    RtpSendTimeExtensionId,
}

impl SocketOption {
    pub fn to_wire(self) -> u8 {
        match self {
            SocketOption::DontFragment => 1,
            SocketOption::ReceiveBuffer => 2,
            SocketOption::SendBuffer => 3,
            SocketOption::NoDelay => 4,
            SocketOption::Dscp => 5,
            SocketOption::RtpSendTimeExtensionId => 6,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(SocketOption::DontFragment),
            2 => Some(SocketOption::ReceiveBuffer),
            3 => Some(SocketOption::SendBuffer),
            4 => Some(SocketOption::NoDelay),
            5 => Some(SocketOption::Dscp),
            6 => Some(SocketOption::RtpSendTimeExtensionId),
            _ => None,
        }
    }
}

/// A client → provider message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateUdpSocket {
        id: u64,
        bind: SocketAddr,
        min_port: u16,
        max_port: u16,
    },
    CreateServerTcpSocket {
        id: u64,
        bind: SocketAddr,
        min_port: u16,
        max_port: u16,
        options: u32,
    },
    CreateClientTcpSocket {
        id: u64,
        local: SocketAddr,
        remote: SocketAddr,
        options: u32,
    },
    SendPacket {
        id: u64,
        dest: Option<SocketAddr>,
        packet_id: u64,
        dscp: u8,
        payload: Vec<u8>,
    },
    SetOption {
        id: u64,
        option: SocketOption,
        value: i32,
    },
    Close {
        id: u64,
    },
    CreateResolver {
        id: u64,
        query: String,
    },
}

/// A provider → client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened {
        id: u64,
        local: SocketAddr,
    },
    ConnectionFailed {
        id: u64,
        code: u16,
        message: String,
    },
    SentConfirmation {
        id: u64,
        packet_id: u64,
        send_time_ms: u64,
    },
    DataReceived {
        id: u64,
        source: SocketAddr,
        timestamp_ms: u64,
        payload: Vec<u8>,
    },
    RemoteClosed {
        id: u64,
    },
    Resolved {
        id: u64,
        addresses: Vec<IpAddr>,
    },
    ResolutionFailed {
        id: u64,
        code: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    FrameTooLarge {
        len: usize,
        max: usize,
    },
    FrameTooShort {
        len: usize,
    },
    FrameTruncatedPayload {
        expected: usize,
        got: usize,
    },
    FrameTrailingBytes {
        trailing: usize,
    },

    TruncatedStreamHeader {
        pending: usize,
    },
    TruncatedStreamPayload {
        pending: usize,
        payload_len: usize,
    },

    ZeroIdentifier {
        msg_type: u8,
    },
    UnknownMessageType {
        msg_type: u8,
    },
    UnknownAddressFamily {
        context: &'static str,
        family: u8,
    },
    UnknownSocketOption {
        option: u8,
    },

    PayloadTooShort {
        context: &'static str,
        len: usize,
    },
    PayloadTrailingBytes {
        context: &'static str,
        trailing: usize,
    },
    InvalidUtf8 {
        context: &'static str,
    },
    StringTooLong {
        context: &'static str,
        len: usize,
        max: usize,
    },
    InvalidPortRange {
        min_port: u16,
        max_port: u16,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FrameTooLarge { len, max } => write!(f, "frame payload too large: {len} > {max}"),
            Error::FrameTooShort { len } => write!(
                f,
                "rtc frame too short: {len} < {FRAME_HEADER_LEN} (truncated header)"
            ),
            Error::FrameTruncatedPayload { expected, got } => write!(
                f,
                "rtc frame truncated payload: expected {expected} bytes, got {got}"
            ),
            Error::FrameTrailingBytes { trailing } => {
                write!(f, "rtc frame has trailing bytes: {trailing}")
            }

            Error::TruncatedStreamHeader { pending } => write!(
                f,
                "truncated rtc frame stream (truncated header: {pending} pending bytes)"
            ),
            Error::TruncatedStreamPayload {
                pending,
                payload_len,
            } => write!(
                f,
                "truncated rtc frame stream (truncated payload: {pending}/{payload_len} payload bytes)"
            ),

            Error::ZeroIdentifier { msg_type } => {
                write!(f, "message type 0x{msg_type:02x} carries reserved identifier 0")
            }
            Error::UnknownMessageType { msg_type } => {
                write!(f, "unknown message type: 0x{msg_type:02x}")
            }
            Error::UnknownAddressFamily { context, family } => {
                write!(f, "unknown address family in {context}: 0x{family:02x}")
            }
            Error::UnknownSocketOption { option } => {
                write!(f, "unknown socket option: {option}")
            }

            Error::PayloadTooShort { context, len } => {
                write!(f, "{context} payload too short: {len}")
            }
            Error::PayloadTrailingBytes { context, trailing } => {
                write!(f, "{context} payload has trailing bytes: {trailing}")
            }
            Error::InvalidUtf8 { context } => write!(f, "invalid UTF-8 in {context}"),
            Error::StringTooLong { context, len, max } => {
                write!(f, "{context} too long: {len} > {max}")
            }
            Error::InvalidPortRange { min_port, max_port } => {
                write!(f, "invalid port range: {min_port} > {max_port}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub fn encode_frame_with_limits(
    msg_type: u8,
    id: u64,
    payload: &[u8],
    limits: &Limits,
) -> Result<Vec<u8>, Error> {
    if payload.len() > limits.max_payload_len {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: limits.max_payload_len,
        });
    }

    // Length is encoded as u32.
    if payload.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(msg_type);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame(msg_type: u8, id: u64, payload: &[u8]) -> Result<Vec<u8>, Error> {
    encode_frame_with_limits(msg_type, id, payload, &Limits::default())
}

pub fn decode_frame_with_limits(buf: &[u8], limits: &Limits) -> Result<Frame, Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(Error::FrameTooShort { len: buf.len() });
    }

    let msg_type = buf[0];
    let id = u64::from_be_bytes([
        buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
    ]);
    let payload_len = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;

    if payload_len > limits.max_payload_len {
        return Err(Error::FrameTooLarge {
            len: payload_len,
            max: limits.max_payload_len,
        });
    }

    let expected_total = FRAME_HEADER_LEN
        .checked_add(payload_len)
        .ok_or(Error::FrameTooLarge {
            len: payload_len,
            max: limits.max_payload_len,
        })?;

    if buf.len() < expected_total {
        return Err(Error::FrameTruncatedPayload {
            expected: expected_total,
            got: buf.len(),
        });
    }

    if buf.len() > expected_total {
        return Err(Error::FrameTrailingBytes {
            trailing: buf.len() - expected_total,
        });
    }

    Ok(Frame {
        msg_type,
        id,
        payload: buf[FRAME_HEADER_LEN..].to_vec(),
    })
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame, Error> {
    decode_frame_with_limits(buf, &Limits::default())
}

/// Streaming parser for `gauze-rtc-v1` frames.
///
/// The parser is incremental and can accept arbitrary chunk boundaries, for transports
/// that deliver a byte stream instead of one frame per message. It only allocates up to
/// the configured `max_payload_len` per frame.
#[derive(Debug, Clone)]
pub struct FrameParser {
    limits: Limits,
    state: ParserState,
}

#[derive(Debug, Clone)]
enum ParserState {
    Header {
        buf: [u8; FRAME_HEADER_LEN],
        filled: usize,
    },
    Payload {
        msg_type: u8,
        id: u64,
        payload_len: usize,
        buf: Vec<u8>,
    },
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            state: ParserState::Header {
                buf: [0u8; FRAME_HEADER_LEN],
                filled: 0,
            },
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, Error> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match &mut self.state {
                ParserState::Header { buf, filled } => {
                    let need = FRAME_HEADER_LEN - *filled;
                    let take = need.min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];

                    if *filled < FRAME_HEADER_LEN {
                        continue;
                    }

                    let msg_type = buf[0];
                    let id = u64::from_be_bytes([
                        buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
                    ]);
                    let payload_len =
                        u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;

                    if payload_len > self.limits.max_payload_len {
                        return Err(Error::FrameTooLarge {
                            len: payload_len,
                            max: self.limits.max_payload_len,
                        });
                    }

                    // Reset header buffer for next time.
                    *filled = 0;

                    if payload_len == 0 {
                        frames.push(Frame {
                            msg_type,
                            id,
                            payload: Vec::new(),
                        });
                        continue;
                    }

                    self.state = ParserState::Payload {
                        msg_type,
                        id,
                        payload_len,
                        buf: Vec::with_capacity(payload_len),
                    };
                }
                ParserState::Payload {
                    msg_type,
                    id,
                    payload_len,
                    buf,
                } => {
                    let need = payload_len.saturating_sub(buf.len());
                    let take = need.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if buf.len() < *payload_len {
                        continue;
                    }

                    let payload = core::mem::take(buf);
                    let msg_type = *msg_type;
                    let id = *id;
                    self.state = ParserState::Header {
                        buf: [0u8; FRAME_HEADER_LEN],
                        filled: 0,
                    };
                    frames.push(Frame {
                        msg_type,
                        id,
                        payload,
                    });
                }
            }
        }

        Ok(frames)
    }

    pub fn finish(&self) -> Result<(), Error> {
        match &self.state {
            ParserState::Header { filled, .. } => {
                if *filled == 0 {
                    Ok(())
                } else {
                    Err(Error::TruncatedStreamHeader { pending: *filled })
                }
            }
            ParserState::Payload {
                payload_len, buf, ..
            } => Err(Error::TruncatedStreamPayload {
                pending: buf.len(),
                payload_len: *payload_len,
            }),
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn put_socket_address(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(AF_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(AF_IPV6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn read_socket_address(
    buf: &[u8],
    offset: &mut usize,
    context: &'static str,
) -> Result<SocketAddr, Error> {
    let ip = read_ip_addr(buf, offset, context)?;
    let port_bytes = buf
        .get(*offset..*offset + 2)
        .ok_or(Error::PayloadTooShort {
            context,
            len: buf.len(),
        })?;
    *offset += 2;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok(SocketAddr::new(ip, port))
}

fn put_ip_addr(out: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(ip) => {
            out.push(AF_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(AF_IPV6);
            out.extend_from_slice(&ip.octets());
        }
    }
}

fn read_ip_addr(buf: &[u8], offset: &mut usize, context: &'static str) -> Result<IpAddr, Error> {
    let family = *buf.get(*offset).ok_or(Error::PayloadTooShort {
        context,
        len: buf.len(),
    })?;
    *offset += 1;

    match family {
        AF_IPV4 => {
            let octets: [u8; 4] = buf
                .get(*offset..*offset + 4)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(Error::PayloadTooShort {
                    context,
                    len: buf.len(),
                })?;
            *offset += 4;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AF_IPV6 => {
            let octets: [u8; 16] = buf
                .get(*offset..*offset + 16)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(Error::PayloadTooShort {
                    context,
                    len: buf.len(),
                })?;
            *offset += 16;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(Error::UnknownAddressFamily { context, family }),
    }
}

fn read_u16(buf: &[u8], offset: &mut usize, context: &'static str) -> Result<u16, Error> {
    let bytes = buf
        .get(*offset..*offset + 2)
        .ok_or(Error::PayloadTooShort {
            context,
            len: buf.len(),
        })?;
    *offset += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], offset: &mut usize, context: &'static str) -> Result<u32, Error> {
    let bytes = buf
        .get(*offset..*offset + 4)
        .ok_or(Error::PayloadTooShort {
            context,
            len: buf.len(),
        })?;
    *offset += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(buf: &[u8], offset: &mut usize, context: &'static str) -> Result<u64, Error> {
    let bytes = buf
        .get(*offset..*offset + 8)
        .ok_or(Error::PayloadTooShort {
            context,
            len: buf.len(),
        })?;
    *offset += 8;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

fn read_u8(buf: &[u8], offset: &mut usize, context: &'static str) -> Result<u8, Error> {
    let byte = *buf.get(*offset).ok_or(Error::PayloadTooShort {
        context,
        len: buf.len(),
    })?;
    *offset += 1;
    Ok(byte)
}

fn expect_consumed(buf: &[u8], offset: usize, context: &'static str) -> Result<(), Error> {
    if offset != buf.len() {
        return Err(Error::PayloadTrailingBytes {
            context,
            trailing: buf.len() - offset,
        });
    }
    Ok(())
}

/// Encode a structured failure payload: `code (u16) | msg_len (u16) | msg (UTF-8)`.
///
/// The message is truncated on a char boundary as needed to fit `max_payload_bytes`.
pub fn encode_failure_payload(code: u16, message: &str, max_payload_bytes: usize) -> Vec<u8> {
    if max_payload_bytes < 4 {
        return Vec::new();
    }
    let max_msg_len = max_payload_bytes.saturating_sub(4).min(u16::MAX as usize);

    let msg_bytes = message.as_bytes();
    let mut msg_len = msg_bytes.len().min(max_msg_len);
    while msg_len > 0 && !message.is_char_boundary(msg_len) {
        msg_len -= 1;
    }
    let msg_bytes = &msg_bytes[..msg_len];

    let mut out = Vec::with_capacity(4 + msg_bytes.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&(msg_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(msg_bytes);
    out
}

fn decode_failure_payload(buf: &[u8], context: &'static str) -> Result<(u16, String), Error> {
    let mut offset = 0;
    let code = read_u16(buf, &mut offset, context)?;
    let msg_len = read_u16(buf, &mut offset, context)? as usize;
    let msg_bytes = buf
        .get(offset..offset + msg_len)
        .ok_or(Error::PayloadTooShort {
            context,
            len: buf.len(),
        })?;
    offset += msg_len;
    expect_consumed(buf, offset, context)?;
    let message = core::str::from_utf8(msg_bytes)
        .map_err(|_| Error::InvalidUtf8 { context })?
        .to_owned();
    Ok((code, message))
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::CreateUdpSocket { id, .. }
            | Request::CreateServerTcpSocket { id, .. }
            | Request::CreateClientTcpSocket { id, .. }
            | Request::SendPacket { id, .. }
            | Request::SetOption { id, .. }
            | Request::Close { id }
            | Request::CreateResolver { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.encode_with_limits(&Limits::default())
    }

    pub fn encode_with_limits(&self, limits: &Limits) -> Result<Vec<u8>, Error> {
        match self {
            Request::CreateUdpSocket {
                id,
                bind,
                min_port,
                max_port,
            } => {
                if min_port > max_port {
                    return Err(Error::InvalidPortRange {
                        min_port: *min_port,
                        max_port: *max_port,
                    });
                }
                let mut payload = Vec::new();
                put_socket_address(&mut payload, *bind);
                payload.extend_from_slice(&min_port.to_be_bytes());
                payload.extend_from_slice(&max_port.to_be_bytes());
                encode_frame_with_limits(MSG_CREATE_UDP_SOCKET, *id, &payload, limits)
            }
            Request::CreateServerTcpSocket {
                id,
                bind,
                min_port,
                max_port,
                options,
            } => {
                if min_port > max_port {
                    return Err(Error::InvalidPortRange {
                        min_port: *min_port,
                        max_port: *max_port,
                    });
                }
                let mut payload = Vec::new();
                put_socket_address(&mut payload, *bind);
                payload.extend_from_slice(&min_port.to_be_bytes());
                payload.extend_from_slice(&max_port.to_be_bytes());
                payload.extend_from_slice(&options.to_be_bytes());
                encode_frame_with_limits(MSG_CREATE_SERVER_TCP_SOCKET, *id, &payload, limits)
            }
            Request::CreateClientTcpSocket {
                id,
                local,
                remote,
                options,
            } => {
                let mut payload = Vec::new();
                put_socket_address(&mut payload, *local);
                put_socket_address(&mut payload, *remote);
                payload.extend_from_slice(&options.to_be_bytes());
                encode_frame_with_limits(MSG_CREATE_CLIENT_TCP_SOCKET, *id, &payload, limits)
            }
            Request::SendPacket {
                id,
                dest,
                packet_id,
                dscp,
                payload: data,
            } => {
                let mut payload = Vec::with_capacity(1 + 19 + 9 + data.len());
                match dest {
                    Some(addr) => {
                        payload.push(1);
                        put_socket_address(&mut payload, *addr);
                    }
                    None => payload.push(0),
                }
                payload.extend_from_slice(&packet_id.to_be_bytes());
                payload.push(*dscp);
                payload.extend_from_slice(data);
                encode_frame_with_limits(MSG_SEND_PACKET, *id, &payload, limits)
            }
            Request::SetOption { id, option, value } => {
                let mut payload = Vec::with_capacity(5);
                payload.push(option.to_wire());
                payload.extend_from_slice(&value.to_be_bytes());
                encode_frame_with_limits(MSG_SET_OPTION, *id, &payload, limits)
            }
            Request::Close { id } => encode_frame_with_limits(MSG_CLOSE, *id, &[], limits),
            Request::CreateResolver { id, query } => {
                let query_bytes = query.as_bytes();
                if query_bytes.len() > u16::MAX as usize {
                    return Err(Error::StringTooLong {
                        context: "resolver query",
                        len: query_bytes.len(),
                        max: u16::MAX as usize,
                    });
                }
                let mut payload = Vec::with_capacity(2 + query_bytes.len());
                payload.extend_from_slice(&(query_bytes.len() as u16).to_be_bytes());
                payload.extend_from_slice(query_bytes);
                encode_frame_with_limits(MSG_CREATE_RESOLVER, *id, &payload, limits)
            }
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        if frame.id == 0 {
            return Err(Error::ZeroIdentifier {
                msg_type: frame.msg_type,
            });
        }
        let buf = frame.payload.as_slice();
        let id = frame.id;
        match frame.msg_type {
            MSG_CREATE_UDP_SOCKET => {
                let context = "CreateUdpSocket";
                let mut offset = 0;
                let bind = read_socket_address(buf, &mut offset, context)?;
                let min_port = read_u16(buf, &mut offset, context)?;
                let max_port = read_u16(buf, &mut offset, context)?;
                expect_consumed(buf, offset, context)?;
                if min_port > max_port {
                    return Err(Error::InvalidPortRange { min_port, max_port });
                }
                Ok(Request::CreateUdpSocket {
                    id,
                    bind,
                    min_port,
                    max_port,
                })
            }
            MSG_CREATE_SERVER_TCP_SOCKET => {
                let context = "CreateServerTcpSocket";
                let mut offset = 0;
                let bind = read_socket_address(buf, &mut offset, context)?;
                let min_port = read_u16(buf, &mut offset, context)?;
                let max_port = read_u16(buf, &mut offset, context)?;
                let options = read_u32(buf, &mut offset, context)?;
                expect_consumed(buf, offset, context)?;
                if min_port > max_port {
                    return Err(Error::InvalidPortRange { min_port, max_port });
                }
                Ok(Request::CreateServerTcpSocket {
                    id,
                    bind,
                    min_port,
                    max_port,
                    options,
                })
            }
            MSG_CREATE_CLIENT_TCP_SOCKET => {
                let context = "CreateClientTcpSocket";
                let mut offset = 0;
                let local = read_socket_address(buf, &mut offset, context)?;
                let remote = read_socket_address(buf, &mut offset, context)?;
                let options = read_u32(buf, &mut offset, context)?;
                expect_consumed(buf, offset, context)?;
                Ok(Request::CreateClientTcpSocket {
                    id,
                    local,
                    remote,
                    options,
                })
            }
            MSG_SEND_PACKET => {
                let context = "SendPacket";
                let mut offset = 0;
                let has_dest = read_u8(buf, &mut offset, context)?;
                let dest = match has_dest {
                    0 => None,
                    _ => Some(read_socket_address(buf, &mut offset, context)?),
                };
                let packet_id = read_u64(buf, &mut offset, context)?;
                let dscp = read_u8(buf, &mut offset, context)?;
                let payload = buf[offset..].to_vec();
                Ok(Request::SendPacket {
                    id,
                    dest,
                    packet_id,
                    dscp,
                    payload,
                })
            }
            MSG_SET_OPTION => {
                let context = "SetOption";
                let mut offset = 0;
                let option_byte = read_u8(buf, &mut offset, context)?;
                let option = SocketOption::from_wire(option_byte)
                    .ok_or(Error::UnknownSocketOption { option: option_byte })?;
                let value = read_u32(buf, &mut offset, context)? as i32;
                expect_consumed(buf, offset, context)?;
                Ok(Request::SetOption { id, option, value })
            }
            MSG_CLOSE => {
                expect_consumed(buf, 0, "Close")?;
                Ok(Request::Close { id })
            }
            MSG_CREATE_RESOLVER => {
                let context = "CreateResolver";
                let mut offset = 0;
                let query_len = read_u16(buf, &mut offset, context)? as usize;
                let query_bytes = buf
                    .get(offset..offset + query_len)
                    .ok_or(Error::PayloadTooShort {
                        context,
                        len: buf.len(),
                    })?;
                offset += query_len;
                expect_consumed(buf, offset, context)?;
                let query = core::str::from_utf8(query_bytes)
                    .map_err(|_| Error::InvalidUtf8 { context })?
                    .to_owned();
                Ok(Request::CreateResolver { id, query })
            }
            other => Err(Error::UnknownMessageType { msg_type: other }),
        }
    }
}

impl Event {
    pub fn id(&self) -> u64 {
        match self {
            Event::Opened { id, .. }
            | Event::ConnectionFailed { id, .. }
            | Event::SentConfirmation { id, .. }
            | Event::DataReceived { id, .. }
            | Event::RemoteClosed { id }
            | Event::Resolved { id, .. }
            | Event::ResolutionFailed { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.encode_with_limits(&Limits::default())
    }

    pub fn encode_with_limits(&self, limits: &Limits) -> Result<Vec<u8>, Error> {
        match self {
            Event::Opened { id, local } => {
                let mut payload = Vec::new();
                put_socket_address(&mut payload, *local);
                encode_frame_with_limits(MSG_OPENED, *id, &payload, limits)
            }
            Event::ConnectionFailed { id, code, message } => {
                let payload = encode_failure_payload(*code, message, limits.max_payload_len);
                encode_frame_with_limits(MSG_CONNECTION_FAILED, *id, &payload, limits)
            }
            Event::SentConfirmation {
                id,
                packet_id,
                send_time_ms,
            } => {
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&packet_id.to_be_bytes());
                payload.extend_from_slice(&send_time_ms.to_be_bytes());
                encode_frame_with_limits(MSG_SENT_CONFIRMATION, *id, &payload, limits)
            }
            Event::DataReceived {
                id,
                source,
                timestamp_ms,
                payload: data,
            } => {
                let mut payload = Vec::with_capacity(19 + 8 + data.len());
                put_socket_address(&mut payload, *source);
                payload.extend_from_slice(&timestamp_ms.to_be_bytes());
                payload.extend_from_slice(data);
                encode_frame_with_limits(MSG_DATA_RECEIVED, *id, &payload, limits)
            }
            Event::RemoteClosed { id } => encode_frame_with_limits(MSG_REMOTE_CLOSED, *id, &[], limits),
            Event::Resolved { id, addresses } => {
                if addresses.len() > u16::MAX as usize {
                    return Err(Error::StringTooLong {
                        context: "resolved address list",
                        len: addresses.len(),
                        max: u16::MAX as usize,
                    });
                }
                let mut payload = Vec::new();
                payload.extend_from_slice(&(addresses.len() as u16).to_be_bytes());
                for addr in addresses {
                    put_ip_addr(&mut payload, *addr);
                }
                encode_frame_with_limits(MSG_RESOLVED, *id, &payload, limits)
            }
            Event::ResolutionFailed { id, code, message } => {
                let payload = encode_failure_payload(*code, message, limits.max_payload_len);
                encode_frame_with_limits(MSG_RESOLUTION_FAILED, *id, &payload, limits)
            }
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        if frame.id == 0 {
            return Err(Error::ZeroIdentifier {
                msg_type: frame.msg_type,
            });
        }
        let buf = frame.payload.as_slice();
        let id = frame.id;
        match frame.msg_type {
            MSG_OPENED => {
                let context = "Opened";
                let mut offset = 0;
                let local = read_socket_address(buf, &mut offset, context)?;
                expect_consumed(buf, offset, context)?;
                Ok(Event::Opened { id, local })
            }
            MSG_CONNECTION_FAILED => {
                let (code, message) = decode_failure_payload(buf, "ConnectionFailed")?;
                Ok(Event::ConnectionFailed { id, code, message })
            }
            MSG_SENT_CONFIRMATION => {
                let context = "SentConfirmation";
                let mut offset = 0;
                let packet_id = read_u64(buf, &mut offset, context)?;
                let send_time_ms = read_u64(buf, &mut offset, context)?;
                expect_consumed(buf, offset, context)?;
                Ok(Event::SentConfirmation {
                    id,
                    packet_id,
                    send_time_ms,
                })
            }
            MSG_DATA_RECEIVED => {
                let context = "DataReceived";
                let mut offset = 0;
                let source = read_socket_address(buf, &mut offset, context)?;
                let timestamp_ms = read_u64(buf, &mut offset, context)?;
                let payload = buf[offset..].to_vec();
                Ok(Event::DataReceived {
                    id,
                    source,
                    timestamp_ms,
                    payload,
                })
            }
            MSG_REMOTE_CLOSED => {
                expect_consumed(buf, 0, "RemoteClosed")?;
                Ok(Event::RemoteClosed { id })
            }
            MSG_RESOLVED => {
                let context = "Resolved";
                let mut offset = 0;
                let count = read_u16(buf, &mut offset, context)? as usize;
                let mut addresses = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    addresses.push(read_ip_addr(buf, &mut offset, context)?);
                }
                expect_consumed(buf, offset, context)?;
                Ok(Event::Resolved { id, addresses })
            }
            MSG_RESOLUTION_FAILED => {
                let (code, message) = decode_failure_payload(buf, "ResolutionFailed")?;
                Ok(Event::ResolutionFailed { id, code, message })
            }
            other => Err(Error::UnknownMessageType { msg_type: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn frame_header_round_trips() {
        let bytes = encode_frame(MSG_CLOSE, 7, &[]).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN);
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.msg_type, MSG_CLOSE);
        assert_eq!(frame.id, 7);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decode_frame_rejects_truncation_and_trailing_bytes() {
        let bytes = encode_frame(MSG_SEND_PACKET, 3, &[1, 2, 3, 4]).unwrap();

        assert_eq!(
            decode_frame(&bytes[..FRAME_HEADER_LEN - 1]),
            Err(Error::FrameTooShort {
                len: FRAME_HEADER_LEN - 1
            })
        );
        assert_eq!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(Error::FrameTruncatedPayload {
                expected: bytes.len(),
                got: bytes.len() - 1,
            })
        );

        let mut extended = bytes.clone();
        extended.push(0xff);
        assert_eq!(
            decode_frame(&extended),
            Err(Error::FrameTrailingBytes { trailing: 1 })
        );
    }

    #[test]
    fn decode_frame_enforces_payload_limit() {
        let limits = Limits { max_payload_len: 8 };
        let bytes = encode_frame(MSG_SEND_PACKET, 1, &[0u8; 16]).unwrap();
        assert_eq!(
            decode_frame_with_limits(&bytes, &limits),
            Err(Error::FrameTooLarge { len: 16, max: 8 })
        );
        assert_eq!(
            encode_frame_with_limits(MSG_SEND_PACKET, 1, &[0u8; 16], &limits),
            Err(Error::FrameTooLarge { len: 16, max: 8 })
        );
    }

    #[test]
    fn parser_handles_arbitrary_chunk_boundaries() {
        let first = Request::SendPacket {
            id: 10,
            dest: Some(v4(192, 0, 2, 1, 3478)),
            packet_id: 42,
            dscp: 0,
            payload: b"hello".to_vec(),
        }
        .encode()
        .unwrap();
        let second = Request::Close { id: 11 }.encode().unwrap();

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        // Feed one byte at a time.
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(parser.push(std::slice::from_ref(byte)).unwrap());
        }
        parser.finish().unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(Request::decode(&frames[0]).unwrap().id(), 10);
        assert_eq!(
            Request::decode(&frames[1]).unwrap(),
            Request::Close { id: 11 }
        );

        // A truncated tail is reported by finish().
        let mut parser = FrameParser::new();
        parser.push(&stream[..stream.len() - 3]).unwrap();
        assert!(parser.finish().is_err());
    }

    #[test]
    fn send_packet_round_trips_without_destination() {
        let req = Request::SendPacket {
            id: 9,
            dest: None,
            packet_id: 77,
            dscp: 46,
            payload: vec![0xde, 0xad],
        };
        let frame = decode_frame(&req.encode().unwrap()).unwrap();
        assert_eq!(Request::decode(&frame).unwrap(), req);
    }

    #[test]
    fn create_client_tcp_socket_round_trips_with_ipv6() {
        let req = Request::CreateClientTcpSocket {
            id: 2,
            local: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
            remote: SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 443),
            options: 0x11,
        };
        let frame = decode_frame(&req.encode().unwrap()).unwrap();
        assert_eq!(Request::decode(&frame).unwrap(), req);
    }

    #[test]
    fn requests_reject_inverted_port_ranges() {
        let req = Request::CreateUdpSocket {
            id: 1,
            bind: v4(0, 0, 0, 0, 0),
            min_port: 200,
            max_port: 100,
        };
        assert_eq!(
            req.encode(),
            Err(Error::InvalidPortRange {
                min_port: 200,
                max_port: 100
            })
        );
    }

    #[test]
    fn decode_rejects_unknown_address_family() {
        let mut payload = Vec::new();
        payload.push(9); // not AF_IPV4/AF_IPV6
        payload.extend_from_slice(&[0; 6]);
        let bytes = encode_frame(MSG_OPENED, 5, &payload).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            Event::decode(&frame),
            Err(Error::UnknownAddressFamily {
                context: "Opened",
                family: 9
            })
        );
    }

    #[test]
    fn decode_rejects_identifier_zero() {
        let bytes = encode_frame(MSG_REMOTE_CLOSED, 0, &[]).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            Event::decode(&frame),
            Err(Error::ZeroIdentifier {
                msg_type: MSG_REMOTE_CLOSED
            })
        );
    }

    #[test]
    fn resolved_event_carries_mixed_address_families() {
        let ev = Event::Resolved {
            id: 3,
            addresses: vec![
                IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        };
        let frame = decode_frame(&ev.encode().unwrap()).unwrap();
        assert_eq!(Event::decode(&frame).unwrap(), ev);
    }

    #[test]
    fn failure_payload_truncates_on_char_boundary() {
        // Emoji is 4 bytes; with 5 payload bytes available only the header fits.
        let payload = encode_failure_payload(ERROR_CODE_BIND_FAILED, "😀", 5);
        assert_eq!(payload.len(), 4);

        let (code, message) = decode_failure_payload(&payload, "ConnectionFailed").unwrap();
        assert_eq!(code, ERROR_CODE_BIND_FAILED);
        assert_eq!(message, "");
    }

    #[test]
    fn failure_payload_rejects_length_mismatch() {
        let mut payload = encode_failure_payload(1, "nope", usize::MAX);
        payload.push(0);
        assert_eq!(
            decode_failure_payload(&payload, "ResolutionFailed"),
            Err(Error::PayloadTrailingBytes {
                context: "ResolutionFailed",
                trailing: 1
            })
        );
    }

    #[test]
    fn unknown_message_types_are_rejected_per_direction() {
        let bytes = encode_frame(MSG_OPENED, 4, &[]).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            Request::decode(&frame),
            Err(Error::UnknownMessageType {
                msg_type: MSG_OPENED
            })
        );

        let bytes = encode_frame(MSG_CLOSE, 4, &[]).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            Event::decode(&frame),
            Err(Error::UnknownMessageType {
                msg_type: MSG_CLOSE
            })
        );
    }
}
