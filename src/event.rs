//! Replication Event Frames
//!
//! Every event travels and rests in the same frame:
//!
//! ```text
//! [timestamp u32][type u8][server_id u32][total_length u32][end_log_pos u32][flags u16]
//! [type-specific body]
//! [crc32 u32]
//! ```
//!
//! All integers are little endian. The checksum covers header and body.
//! Control events (rotate, format handshake, heartbeat, stream end) have a
//! fixed body layout; data events carry a short routing envelope followed by
//! an opaque payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed event header
pub const HEADER_LEN: usize = 19;

/// Size of the trailing checksum
pub const CHECKSUM_LEN: usize = 4;

/// Protocol version written by this implementation
pub const CURRENT_PROTOCOL_VERSION: u8 = 4;

/// Longest schema or table name a data event can carry
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Version string carried in format handshakes
pub const SERVER_VERSION: &str = concat!("wolfrelay-", env!("CARGO_PKG_VERSION"));

/// Event type codes
pub mod event_type {
    /// Format handshake used by protocol versions 1 to 3
    pub const START_EVENT_V3: u8 = 1;
    pub const DATA_EVENT: u8 = 2;
    /// Local shutdown bookkeeping, never forwarded to replicas
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const HEARTBEAT_LOG_EVENT: u8 = 27;
}

/// Header flag bits
pub mod flags {
    /// Segment was not closed cleanly (set on the format handshake while open)
    pub const IN_USE: u16 = 0x0001;
    /// Event generated by the sender rather than read from a log
    pub const ARTIFICIAL: u16 = 0x0020;
    /// Event generated by the relay log itself
    pub const RELAY_LOG: u16 = 0x0040;
    /// Flags understood by protocol versions before 4
    pub const LEGACY_MASK: u16 = IN_USE;
}

/// Transaction group boundary markers carried by data events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupBoundary(u8);

impl GroupBoundary {
    pub const BEGIN: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;

    /// Event inside a group
    pub const fn inner() -> Self {
        Self(0)
    }

    /// First event of a multi-event group
    pub const fn begin() -> Self {
        Self(Self::BEGIN)
    }

    /// Last event of a group
    pub const fn commit() -> Self {
        Self(Self::COMMIT)
    }

    /// A group made of a single event
    pub const fn standalone() -> Self {
        Self(Self::BEGIN | Self::COMMIT)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::BEGIN | Self::COMMIT))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn starts_group(self) -> bool {
        self.0 & Self::BEGIN != 0
    }

    pub const fn ends_group(self) -> bool {
        self.0 & Self::COMMIT != 0
    }
}

/// Body of a data-change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub boundary: GroupBoundary,
    /// Schema the change belongs to
    pub schema: String,
    /// Table the change touches, if any
    pub table: Option<String>,
    /// Opaque payload handed to the executor
    pub payload: Bytes,
}

impl DataEvent {
    /// Reject names the one-byte length prefix cannot describe
    pub fn check_names(&self) -> Result<(), String> {
        let names = std::iter::once(("schema", self.schema.as_str()))
            .chain(self.table.as_deref().map(|t| ("table", t)));
        for (what, name) in names {
            if name.len() > MAX_NAME_LEN {
                return Err(format!(
                    "{} name is {} bytes, at most {} allowed",
                    what,
                    name.len(),
                    MAX_NAME_LEN
                ));
            }
        }
        Ok(())
    }
}

/// Decoded event body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Announces the segment that follows
    Rotate { new_file: String, new_offset: u64 },
    /// Describes the protocol version of the events that follow
    FormatHandshake {
        protocol_version: u8,
        peer_version: String,
    },
    /// Liveness signal; offset travels in the header's end_log_pos
    Heartbeat { file: String, offset: u64 },
    /// Written when a log is closed on shutdown
    StreamEnd,
    Data(DataEvent),
}

impl Event {
    /// Type code written for this body
    pub fn type_code(&self) -> u8 {
        match self {
            Event::Rotate { .. } => event_type::ROTATE_EVENT,
            Event::FormatHandshake {
                protocol_version, ..
            } if *protocol_version < CURRENT_PROTOCOL_VERSION => event_type::START_EVENT_V3,
            Event::FormatHandshake { .. } => event_type::FORMAT_DESCRIPTION_EVENT,
            Event::Heartbeat { .. } => event_type::HEARTBEAT_LOG_EVENT,
            Event::StreamEnd => event_type::STOP_EVENT,
            Event::Data(_) => event_type::DATA_EVENT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Rotate { .. } => "Rotate",
            Event::FormatHandshake { .. } => "FormatHandshake",
            Event::Heartbeat { .. } => "Heartbeat",
            Event::StreamEnd => "StreamEnd",
            Event::Data(_) => "Data",
        }
    }

    /// A format handshake for the current protocol version
    pub fn format_handshake() -> Self {
        Event::FormatHandshake {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            peer_version: SERVER_VERSION.to_string(),
        }
    }
}

/// Fixed event header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub total_length: u32,
    pub end_log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    /// Parse the header from the first `HEADER_LEN` bytes
    pub fn parse(mut bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("header too short: {} bytes", bytes.len()));
        }
        Ok(Self {
            timestamp: bytes.get_u32_le(),
            event_type: bytes.get_u8(),
            server_id: bytes.get_u32_le(),
            total_length: bytes.get_u32_le(),
            end_log_pos: bytes.get_u32_le(),
            flags: bytes.get_u16_le(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.timestamp);
        buf.put_u8(self.event_type);
        buf.put_u32_le(self.server_id);
        buf.put_u32_le(self.total_length);
        buf.put_u32_le(self.end_log_pos);
        buf.put_u16_le(self.flags);
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// A complete event: header plus decoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub header: EventHeader,
    pub event: Event,
}

impl LogEvent {
    /// Build an event originating on `server_id`
    pub fn new(event: Event, server_id: u32, timestamp: u32) -> Self {
        let mut header = EventHeader {
            timestamp,
            event_type: event.type_code(),
            server_id,
            ..EventHeader::default()
        };
        if let Event::Heartbeat { offset, .. } = &event {
            header.end_log_pos = clamp_u32(*offset);
        }
        Self { header, event }
    }

    /// Build a locally generated control event (server id 0, zero timestamp)
    pub fn synthetic(event: Event) -> Self {
        let mut ev = Self::new(event, 0, 0);
        ev.header.flags |= flags::ARTIFICIAL;
        ev
    }

    /// True for events generated by a sender rather than read from a log
    pub fn is_synthetic(&self) -> bool {
        self.header.server_id == 0
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.header.flags |= flags;
        self
    }

    /// Check that this event can be framed
    pub fn check(&self) -> Result<(), String> {
        match &self.event {
            Event::Data(data) => data.check_names(),
            _ => Ok(()),
        }
    }

    /// Serialized size of this event
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len() + CHECKSUM_LEN
    }

    fn body_len(&self) -> usize {
        match &self.event {
            Event::Rotate { new_file, .. } => 8 + new_file.len(),
            Event::FormatHandshake { peer_version, .. } => 1 + peer_version.len(),
            Event::Heartbeat { file, .. } => file.len(),
            Event::StreamEnd => 0,
            Event::Data(data) => {
                1 + 1
                    + data.schema.len()
                    + 1
                    + data.table.as_ref().map_or(0, |t| t.len())
                    + data.payload.len()
            }
        }
    }

    /// Serialize, filling in type code, total length and checksum
    ///
    /// Callers that accept names from outside run [`LogEvent::check`] first.
    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);

        let mut header = self.header;
        header.event_type = self.event.type_code();
        header.total_length = clamp_u32(total as u64);
        header.write(&mut buf);

        match &self.event {
            Event::Rotate {
                new_file,
                new_offset,
            } => {
                buf.put_u64_le(*new_offset);
                buf.put_slice(new_file.as_bytes());
            }
            Event::FormatHandshake {
                protocol_version,
                peer_version,
            } => {
                buf.put_u8(*protocol_version);
                buf.put_slice(peer_version.as_bytes());
            }
            Event::Heartbeat { file, .. } => buf.put_slice(file.as_bytes()),
            Event::StreamEnd => {}
            Event::Data(data) => {
                buf.put_u8(data.boundary.bits());
                put_short_str(&mut buf, &data.schema);
                put_short_str(&mut buf, data.table.as_deref().unwrap_or(""));
                buf.put_slice(&data.payload);
            }
        }

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decode one complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, String> {
        if frame.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(format!("frame too short: {} bytes", frame.len()));
        }
        let header = EventHeader::parse(frame)?;
        if header.total_length as usize != frame.len() {
            return Err(format!(
                "length mismatch: header says {}, frame has {}",
                header.total_length,
                frame.len()
            ));
        }

        let (covered, mut trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
        let stored = trailer.get_u32_le();
        if crc32fast::hash(covered) != stored {
            return Err("checksum mismatch".to_string());
        }

        let mut body = &covered[HEADER_LEN..];
        let event = match header.event_type {
            event_type::ROTATE_EVENT => {
                if body.len() < 8 {
                    return Err("rotate body too short".to_string());
                }
                let new_offset = body.get_u64_le();
                Event::Rotate {
                    new_file: utf8(body)?,
                    new_offset,
                }
            }
            event_type::FORMAT_DESCRIPTION_EVENT | event_type::START_EVENT_V3 => {
                if body.is_empty() {
                    return Err("format handshake body is empty".to_string());
                }
                let protocol_version = body.get_u8();
                Event::FormatHandshake {
                    protocol_version,
                    peer_version: utf8(body)?,
                }
            }
            event_type::HEARTBEAT_LOG_EVENT => Event::Heartbeat {
                file: utf8(body)?,
                offset: header.end_log_pos as u64,
            },
            event_type::STOP_EVENT => Event::StreamEnd,
            event_type::DATA_EVENT => {
                if body.is_empty() {
                    return Err("data body is empty".to_string());
                }
                let boundary = GroupBoundary::from_bits(body.get_u8());
                let schema = get_short_str(&mut body)?;
                let table = get_short_str(&mut body)?;
                Event::Data(DataEvent {
                    boundary,
                    schema,
                    table: if table.is_empty() { None } else { Some(table) },
                    payload: Bytes::copy_from_slice(body),
                })
            }
            other => return Err(format!("unexpected event type {}", other)),
        };

        Ok(Self { header, event })
    }
}

/// Read the total frame length from a header prefix
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let bytes: [u8; 4] = header[9..13].try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

/// Clear flag bits in an encoded frame and recompute its checksum
pub fn clear_flags(frame: &[u8], mask: u16) -> Bytes {
    let mut buf = BytesMut::from(frame);
    if buf.len() < HEADER_LEN + CHECKSUM_LEN {
        return buf.freeze();
    }
    let current = u16::from_le_bytes([buf[17], buf[18]]);
    buf[17..19].copy_from_slice(&(current & !mask).to_le_bytes());
    restamp_checksum(&mut buf);
    buf.freeze()
}

/// Recompute the trailing checksum of an encoded frame in place
pub fn restamp_checksum(buf: &mut [u8]) {
    let split = buf.len() - CHECKSUM_LEN;
    let crc = crc32fast::hash(&buf[..split]);
    buf[split..].copy_from_slice(&crc.to_le_bytes());
}

/// Current UNIX time as carried in event headers
pub fn current_timestamp() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_NAME_LEN, "unchecked name of {} bytes", s.len());
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn get_short_str(body: &mut &[u8]) -> Result<String, String> {
    if body.is_empty() {
        return Err("truncated name".to_string());
    }
    let len = body.get_u8() as usize;
    if body.len() < len {
        return Err("truncated name".to_string());
    }
    let s = utf8(&body[..len])?;
    body.advance(len);
    Ok(s)
}

fn utf8(bytes: &[u8]) -> Result<String, String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid utf-8: {}", e))
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(schema: &str, table: Option<&str>, boundary: GroupBoundary) -> Event {
        Event::Data(DataEvent {
            boundary,
            schema: schema.to_string(),
            table: table.map(str::to_string),
            payload: Bytes::from_static(b"INSERT INTO t VALUES (1)"),
        })
    }

    #[test]
    fn test_data_event_survives_encoding() {
        let mut ev = LogEvent::new(data("shop", Some("orders"), GroupBoundary::begin()), 7, 1700000000);
        ev.header.end_log_pos = 4096;
        let frame = ev.encode();
        assert_eq!(frame.len(), ev.encoded_len());
        assert_eq!(frame_len(&frame), Some(frame.len()));

        let decoded = LogEvent::decode(&frame).unwrap();
        assert_eq!(decoded.header.server_id, 7);
        assert_eq!(decoded.header.end_log_pos, 4096);
        assert_eq!(decoded.event, ev.event);
    }

    #[test]
    fn test_names_at_length_limit_survive_encoding() {
        // 85 three-byte characters fill the limit exactly
        let schema = "語".repeat(85);
        let table = "t".repeat(MAX_NAME_LEN);
        let ev = LogEvent::new(data(&schema, Some(&table), GroupBoundary::standalone()), 3, 0);
        assert!(ev.check().is_ok());

        let frame = ev.encode();
        assert_eq!(frame.len(), ev.encoded_len());
        let decoded = LogEvent::decode(&frame).unwrap();
        assert_eq!(decoded.event, ev.event);
    }

    #[test]
    fn test_names_past_length_limit_are_refused() {
        let long = "s".repeat(MAX_NAME_LEN + 1);
        let ev = LogEvent::new(data(&long, None, GroupBoundary::standalone()), 3, 0);
        assert!(ev.check().unwrap_err().contains("schema name is 256 bytes"));

        // a cut at 255 bytes would land inside the last character
        let table = "é".repeat(128);
        let ev = LogEvent::new(data("shop", Some(&table), GroupBoundary::standalone()), 3, 0);
        assert!(ev.check().unwrap_err().contains("table name"));

        assert!(LogEvent::synthetic(Event::StreamEnd).check().is_ok());
    }

    #[test]
    fn test_heartbeat_offset_travels_in_header() {
        let ev = LogEvent::synthetic(Event::Heartbeat {
            file: "log.000001".to_string(),
            offset: 4,
        });
        let frame = ev.encode();
        let header = EventHeader::parse(&frame).unwrap();
        assert_eq!(header.event_type, event_type::HEARTBEAT_LOG_EVENT);
        assert_eq!(header.end_log_pos, 4);
        assert_eq!(header.server_id, 0);
        assert_eq!(header.timestamp, 0);
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let ev = LogEvent::new(data("shop", None, GroupBoundary::standalone()), 1, 0);
        let mut frame = ev.encode().to_vec();
        let last_body_byte = frame.len() - CHECKSUM_LEN - 1;
        frame[last_body_byte] ^= 0xff;
        assert!(LogEvent::decode(&frame).unwrap_err().contains("checksum"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let ev = LogEvent::new(Event::StreamEnd, 1, 0);
        let mut frame = ev.encode().to_vec();
        frame[4] = 99;
        restamp_checksum(&mut frame);
        assert!(LogEvent::decode(&frame).unwrap_err().contains("unexpected event type"));
    }

    #[test]
    fn test_legacy_handshake_uses_v3_type() {
        let ev = LogEvent::new(
            Event::FormatHandshake {
                protocol_version: 3,
                peer_version: "legacy-3.23".to_string(),
            },
            2,
            0,
        );
        let frame = ev.encode();
        assert_eq!(frame[4], event_type::START_EVENT_V3);
        let decoded = LogEvent::decode(&frame).unwrap();
        assert!(matches!(
            decoded.event,
            Event::FormatHandshake { protocol_version: 3, .. }
        ));
    }

    #[test]
    fn test_clear_flags_keeps_frame_valid() {
        let ev = LogEvent::new(Event::format_handshake(), 1, 0).with_flags(flags::IN_USE);
        let frame = clear_flags(&ev.encode(), flags::IN_USE);
        let decoded = LogEvent::decode(&frame).unwrap();
        assert!(!decoded.header.has_flag(flags::IN_USE));
    }
}
