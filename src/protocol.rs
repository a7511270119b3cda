//! Replication Wire Protocol
//!
//! Packets exchanged between a replica's I/O worker and the primary's dump
//! service. Every packet is framed as
//!
//! ```text
//! [length u32 LE][tag u8][body]
//! ```
//!
//! where `length` counts tag and body. Strings inside bodies are a u16 LE
//! length followed by UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest packet either side will accept
pub const MAX_PACKET_LEN: usize = 64 * 1024 * 1024 + 1024;

/// Dump request flags
pub mod dump_flags {
    /// End the stream instead of waiting at the end of the log
    pub const NON_BLOCKING: u16 = 0x0001;
}

/// Error codes carried by [`Packet::Error`]
pub mod error_code {
    pub const PROTOCOL: u16 = 1000;
    pub const BAD_SERVER_ID: u16 = 1001;
    pub const NO_SUCH_POSITION: u16 = 1236;
    /// Another session registered with the same server id
    pub const SUPERSEDED: u16 = 1002;
    pub const SHUTTING_DOWN: u16 = 1053;
}

mod tag {
    pub const HELLO: u8 = 0x01;
    pub const GREETING: u8 = 0x02;
    pub const IDENTITY_QUERY: u8 = 0x03;
    pub const IDENTITY: u8 = 0x04;
    pub const SET_HEARTBEAT: u8 = 0x05;
    pub const REGISTER: u8 = 0x06;
    pub const DUMP: u8 = 0x07;
    pub const OK: u8 = 0x10;
    pub const ERROR: u8 = 0x11;
    pub const END_OF_STREAM: u8 = 0x12;
    pub const EVENT: u8 = 0x13;
}

/// Replica registration details
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registration {
    pub server_id: u32,
    pub report_host: String,
    pub report_user: String,
    pub report_password: String,
    pub report_port: u16,
    pub master_id_hint: u32,
}

/// Request to stream events from a coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub start_offset: u32,
    pub flags: u16,
    pub server_id: u32,
    /// Empty means the first segment in the primary's index
    pub log_name: String,
}

impl DumpRequest {
    pub fn non_blocking(&self) -> bool {
        self.flags & dump_flags::NON_BLOCKING != 0
    }
}

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello {
        protocol_version: u8,
        client_version: String,
    },
    Greeting {
        protocol_version: u8,
        server_version: String,
    },
    IdentityQuery,
    Identity {
        unix_timestamp: u64,
        server_id: u32,
    },
    SetHeartbeat {
        period_ns: u64,
    },
    Register(Registration),
    Dump(DumpRequest),
    Ok,
    Error {
        code: u16,
        message: String,
    },
    EndOfStream,
    /// One encoded event frame
    Event(Bytes),
}

impl Packet {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    /// Get the packet type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "Hello",
            Packet::Greeting { .. } => "Greeting",
            Packet::IdentityQuery => "IdentityQuery",
            Packet::Identity { .. } => "Identity",
            Packet::SetHeartbeat { .. } => "SetHeartbeat",
            Packet::Register(_) => "Register",
            Packet::Dump(_) => "Dump",
            Packet::Ok => "Ok",
            Packet::Error { .. } => "Error",
            Packet::EndOfStream => "EndOfStream",
            Packet::Event(_) => "Event",
        }
    }

    /// Encode including the length prefix
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let tag = match self {
            Packet::Hello {
                protocol_version,
                client_version,
            } => {
                body.put_u8(*protocol_version);
                put_str(&mut body, client_version);
                tag::HELLO
            }
            Packet::Greeting {
                protocol_version,
                server_version,
            } => {
                body.put_u8(*protocol_version);
                put_str(&mut body, server_version);
                tag::GREETING
            }
            Packet::IdentityQuery => tag::IDENTITY_QUERY,
            Packet::Identity {
                unix_timestamp,
                server_id,
            } => {
                body.put_u64_le(*unix_timestamp);
                body.put_u32_le(*server_id);
                tag::IDENTITY
            }
            Packet::SetHeartbeat { period_ns } => {
                body.put_u64_le(*period_ns);
                tag::SET_HEARTBEAT
            }
            Packet::Register(reg) => {
                body.put_u32_le(reg.server_id);
                put_str(&mut body, &reg.report_host);
                put_str(&mut body, &reg.report_user);
                put_str(&mut body, &reg.report_password);
                body.put_u16_le(reg.report_port);
                body.put_u32_le(reg.master_id_hint);
                tag::REGISTER
            }
            Packet::Dump(req) => {
                body.put_u32_le(req.start_offset);
                body.put_u16_le(req.flags);
                body.put_u32_le(req.server_id);
                put_str(&mut body, &req.log_name);
                tag::DUMP
            }
            Packet::Ok => tag::OK,
            Packet::Error { code, message } => {
                body.put_u16_le(*code);
                put_str(&mut body, message);
                tag::ERROR
            }
            Packet::EndOfStream => tag::END_OF_STREAM,
            Packet::Event(frame) => {
                body.put_slice(frame);
                tag::EVENT
            }
        };

        let mut out = BytesMut::with_capacity(5 + body.len());
        out.put_u32_le((body.len() + 1) as u32);
        out.put_u8(tag);
        out.put_slice(&body);
        out.freeze()
    }

    /// Decode a packet from its tag and body (length prefix already removed)
    pub fn decode(tag: u8, body: Bytes) -> std::result::Result<Self, String> {
        let mut b = body;
        let packet = match tag {
            tag::HELLO => Packet::Hello {
                protocol_version: get_u8(&mut b)?,
                client_version: get_str(&mut b)?,
            },
            tag::GREETING => Packet::Greeting {
                protocol_version: get_u8(&mut b)?,
                server_version: get_str(&mut b)?,
            },
            tag::IDENTITY_QUERY => Packet::IdentityQuery,
            tag::IDENTITY => {
                need(&b, 12, "identity")?;
                Packet::Identity {
                    unix_timestamp: b.get_u64_le(),
                    server_id: b.get_u32_le(),
                }
            }
            tag::SET_HEARTBEAT => {
                need(&b, 8, "heartbeat period")?;
                Packet::SetHeartbeat {
                    period_ns: b.get_u64_le(),
                }
            }
            tag::REGISTER => {
                need(&b, 4, "registration")?;
                let server_id = b.get_u32_le();
                let report_host = get_str(&mut b)?;
                let report_user = get_str(&mut b)?;
                let report_password = get_str(&mut b)?;
                need(&b, 6, "registration")?;
                Packet::Register(Registration {
                    server_id,
                    report_host,
                    report_user,
                    report_password,
                    report_port: b.get_u16_le(),
                    master_id_hint: b.get_u32_le(),
                })
            }
            tag::DUMP => {
                need(&b, 10, "dump request")?;
                let start_offset = b.get_u32_le();
                let flags = b.get_u16_le();
                let server_id = b.get_u32_le();
                Packet::Dump(DumpRequest {
                    start_offset,
                    flags,
                    server_id,
                    log_name: get_str(&mut b)?,
                })
            }
            tag::OK => Packet::Ok,
            tag::ERROR => {
                need(&b, 2, "error")?;
                Packet::Error {
                    code: b.get_u16_le(),
                    message: get_str(&mut b)?,
                }
            }
            tag::END_OF_STREAM => Packet::EndOfStream,
            tag::EVENT => return Ok(Packet::Event(b)),
            other => return Err(format!("unknown packet tag 0x{:02x}", other)),
        };
        if b.has_remaining() {
            return Err(format!("{} trailing bytes after {}", b.remaining(), packet.type_name()));
        }
        Ok(packet)
    }
}

/// Read one packet
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let len = reader.read_u32_le().await.map_err(Error::from_socket)? as usize;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(Error::Protocol(format!("invalid packet length {}", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(Error::from_socket)?;

    let mut buf = Bytes::from(buf);
    let tag = buf.get_u8();
    Packet::decode(tag, buf).map_err(Error::Protocol)
}

/// Write one packet and flush
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer
        .write_all(&packet.encode())
        .await
        .map_err(Error::from_socket)?;
    writer.flush().await.map_err(Error::from_socket)?;
    Ok(())
}

/// Turn an `Error` packet into an error value, anything else into `Protocol`
pub fn unexpected(packet: Packet, expecting: &str) -> Error {
    match packet {
        Packet::Error { code, message } => Error::Remote { code, message },
        other => Error::Protocol(format!(
            "expected {}, received {}",
            expecting,
            other.type_name()
        )),
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn need(b: &Bytes, n: usize, what: &str) -> std::result::Result<(), String> {
    if b.remaining() < n {
        return Err(format!("truncated {}", what));
    }
    Ok(())
}

fn get_u8(b: &mut Bytes) -> std::result::Result<u8, String> {
    need(b, 1, "packet")?;
    Ok(b.get_u8())
}

fn get_str(b: &mut Bytes) -> std::result::Result<String, String> {
    need(b, 2, "string length")?;
    let len = b.get_u16_le() as usize;
    need(b, len, "string")?;
    let raw = b.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| format!("invalid utf-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dump_request_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Packet::Dump(DumpRequest {
            start_offset: 500,
            flags: dump_flags::NON_BLOCKING,
            server_id: 2,
            log_name: "log.000001".into(),
        });
        write_packet(&mut a, &req).await.unwrap();
        assert_eq!(read_packet(&mut b).await.unwrap(), req);
    }

    #[test]
    fn test_length_counts_tag_and_body() {
        let bytes = Packet::SetHeartbeat { period_ns: 7 }.encode();
        assert_eq!(&bytes[..4], &9u32.to_le_bytes());
        assert_eq!(bytes[4], tag::SET_HEARTBEAT);
    }

    #[test]
    fn test_truncated_and_trailing_bodies_are_rejected() {
        assert!(Packet::decode(tag::IDENTITY, Bytes::from_static(&[1, 2, 3])).is_err());
        assert!(Packet::decode(tag::OK, Bytes::from_static(&[0])).is_err());
        assert!(Packet::decode(0x7f, Bytes::new()).is_err());
    }

    #[tokio::test]
    async fn test_oversized_length_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(matches!(read_packet(&mut b).await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_remote_error_packet_becomes_remote_error() {
        let err = unexpected(Packet::error(error_code::NO_SUCH_POSITION, "gone"), "Greeting");
        assert!(matches!(err, Error::Remote { code: 1236, .. }));
    }
}
