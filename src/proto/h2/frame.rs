//! HTTP/2 frame layer (RFC 9113 §4): the 9-byte frame header, error codes,
//! and payload encode/decode helpers shared by the connection state machine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The client connection preface magic (RFC 9113 §3.4).
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_LEN: usize = 9;

pub(crate) type StreamId = u32;

/// Mask for the 31-bit stream identifier (the reserved bit is dropped).
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reason(u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0x0);
    pub const PROTOCOL_ERROR: Reason = Reason(0x1);
    pub const INTERNAL_ERROR: Reason = Reason(0x2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    pub const SETTINGS_TIMEOUT: Reason = Reason(0x4);
    pub const STREAM_CLOSED: Reason = Reason(0x5);
    pub const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    pub const REFUSED_STREAM: Reason = Reason(0x7);
    pub const CANCEL: Reason = Reason(0x8);
    pub const COMPRESSION_ERROR: Reason = Reason(0x9);
    pub const CONNECT_ERROR: Reason = Reason(0xa);
    pub const ENHANCE_YOUR_CALM: Reason = Reason(0xb);
    pub const INADEQUATE_SECURITY: Reason = Reason(0xc);
    pub const HTTP_1_1_REQUIRED: Reason = Reason(0xd);

    pub fn code(&self) -> u32 {
        self.0
    }

    pub(crate) fn from_code(code: u32) -> Reason {
        Reason(code)
    }

    pub fn description(&self) -> &str {
        match self.0 {
            0x0 => "no error",
            0x1 => "protocol error",
            0x2 => "internal error",
            0x3 => "flow control error",
            0x4 => "settings timeout",
            0x5 => "stream closed",
            0x6 => "frame size error",
            0x7 => "refused stream",
            0x8 => "cancelled",
            0x9 => "compression error",
            0xa => "connect error",
            0xb => "enhance your calm",
            0xc => "inadequate security",
            0xd => "http/1.1 required",
            _ => "unknown error code",
        }
    }
}

impl std::fmt::Debug for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reason({})", self.description())
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Unknown types are ignored per RFC 9113 §4.1.
    Unknown(u8),
}

impl Kind {
    pub(crate) fn from_type(byte: u8) -> Kind {
        match byte {
            0x0 => Kind::Data,
            0x1 => Kind::Headers,
            0x2 => Kind::Priority,
            0x3 => Kind::Reset,
            0x4 => Kind::Settings,
            0x5 => Kind::PushPromise,
            0x6 => Kind::Ping,
            0x7 => Kind::GoAway,
            0x8 => Kind::WindowUpdate,
            0x9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn into_type(self) -> u8 {
        match self {
            Kind::Data => 0x0,
            Kind::Headers => 0x1,
            Kind::Priority => 0x2,
            Kind::Reset => 0x3,
            Kind::Settings => 0x4,
            Kind::PushPromise => 0x5,
            Kind::Ping => 0x6,
            Kind::GoAway => 0x7,
            Kind::WindowUpdate => 0x8,
            Kind::Continuation => 0x9,
            Kind::Unknown(other) => other,
        }
    }
}

// Frame flags.
pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

/// A decoded 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHead {
    pub(crate) len: u32,
    pub(crate) kind: Kind,
    pub(crate) flags: u8,
    pub(crate) stream_id: StreamId,
}

impl FrameHead {
    pub(crate) fn parse(bytes: &[u8]) -> FrameHead {
        debug_assert!(bytes.len() >= FRAME_HEADER_LEN);
        let len =
            (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
        let kind = Kind::from_type(bytes[3]);
        let flags = bytes[4];
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]])
            & STREAM_ID_MASK;
        FrameHead {
            len,
            kind,
            flags,
            stream_id,
        }
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub(crate) fn is_end_headers(&self) -> bool {
        self.flags & FLAG_END_HEADERS != 0
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub(crate) fn is_padded(&self) -> bool {
        self.flags & FLAG_PADDED != 0
    }

    pub(crate) fn has_priority(&self) -> bool {
        self.flags & FLAG_PRIORITY != 0
    }
}

pub(crate) fn encode_frame_head(
    dst: &mut BytesMut,
    len: usize,
    kind: Kind,
    flags: u8,
    stream_id: StreamId,
) {
    debug_assert!(len < 1 << 24);
    dst.reserve(FRAME_HEADER_LEN + len);
    dst.put_u8((len >> 16) as u8);
    dst.put_u8((len >> 8) as u8);
    dst.put_u8(len as u8);
    dst.put_u8(kind.into_type());
    dst.put_u8(flags);
    dst.put_u32(stream_id & STREAM_ID_MASK);
}

/// Strips PADDED framing from a DATA or HEADERS payload.
///
/// The pad length octet and padding count toward flow control, but only the
/// inner payload survives. Padding at least as long as the payload is a
/// connection error.
pub(crate) fn strip_padding(payload: &mut Bytes) -> Result<(), Reason> {
    if payload.is_empty() {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len >= payload.len() + 1 {
        // Pad length plus its own octet must stay under the frame length.
        return Err(Reason::PROTOCOL_ERROR);
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

/// Drops the exclusive/dependency/weight fields of a HEADERS payload with
/// the PRIORITY flag. Priority scheduling itself is out of scope; the fields
/// only need to parse.
pub(crate) fn strip_priority(payload: &mut Bytes) -> Result<(), Reason> {
    if payload.len() < 5 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    payload.advance(5);
    Ok(())
}

/// SETTINGS identifiers (RFC 9113 §6.5.2).
pub(crate) const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub(crate) const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub(crate) fn parse_settings_payload(payload: &[u8]) -> Result<Vec<(u16, u32)>, Reason> {
    if payload.len() % 6 != 0 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    let mut entries = Vec::with_capacity(payload.len() / 6);
    for chunk in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        entries.push((id, value));
    }
    Ok(entries)
}

pub(crate) fn encode_settings(dst: &mut BytesMut, entries: &[(u16, u32)]) {
    encode_frame_head(dst, entries.len() * 6, Kind::Settings, 0, 0);
    for &(id, value) in entries {
        dst.put_u16(id);
        dst.put_u32(value);
    }
}

pub(crate) fn encode_settings_ack(dst: &mut BytesMut) {
    encode_frame_head(dst, 0, Kind::Settings, FLAG_ACK, 0);
}

pub(crate) fn parse_window_update(payload: &[u8]) -> Result<u32, Reason> {
    if payload.len() != 4 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK)
}

pub(crate) fn encode_window_update(dst: &mut BytesMut, stream_id: StreamId, increment: u32) {
    debug_assert!(increment > 0);
    encode_frame_head(dst, 4, Kind::WindowUpdate, 0, stream_id);
    dst.put_u32(increment & STREAM_ID_MASK);
}

pub(crate) fn parse_reset(payload: &[u8]) -> Result<Reason, Reason> {
    if payload.len() != 4 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    Ok(Reason::from_code(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ])))
}

pub(crate) fn encode_reset(dst: &mut BytesMut, stream_id: StreamId, reason: Reason) {
    encode_frame_head(dst, 4, Kind::Reset, 0, stream_id);
    dst.put_u32(reason.code());
}

pub(crate) fn encode_ping(dst: &mut BytesMut, ack: bool, payload: [u8; 8]) {
    let flags = if ack { FLAG_ACK } else { 0 };
    encode_frame_head(dst, 8, Kind::Ping, flags, 0);
    dst.put_slice(&payload);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GoAway {
    pub(crate) last_stream_id: StreamId,
    pub(crate) reason: Reason,
}

pub(crate) fn parse_go_away(payload: &[u8]) -> Result<GoAway, Reason> {
    if payload.len() < 8 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    let last_stream_id =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK;
    let reason = Reason::from_code(u32::from_be_bytes([
        payload[4], payload[5], payload[6], payload[7],
    ]));
    Ok(GoAway {
        last_stream_id,
        reason,
    })
}

pub(crate) fn encode_go_away(dst: &mut BytesMut, last_stream_id: StreamId, reason: Reason) {
    encode_frame_head(dst, 8, Kind::GoAway, 0, 0);
    dst.put_u32(last_stream_id & STREAM_ID_MASK);
    dst.put_u32(reason.code());
}

pub(crate) fn encode_headers(
    dst: &mut BytesMut,
    stream_id: StreamId,
    fragment: &[u8],
    end_stream: bool,
) {
    let mut flags = FLAG_END_HEADERS;
    if end_stream {
        flags |= FLAG_END_STREAM;
    }
    encode_frame_head(dst, fragment.len(), Kind::Headers, flags, stream_id);
    dst.put_slice(fragment);
}

pub(crate) fn encode_data(
    dst: &mut BytesMut,
    stream_id: StreamId,
    data: &[u8],
    end_stream: bool,
) {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    encode_frame_head(dst, data.len(), Kind::Data, flags, stream_id);
    dst.put_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let mut dst = BytesMut::new();
        encode_frame_head(&mut dst, 0x4321, Kind::Headers, FLAG_END_HEADERS, 7);
        let head = FrameHead::parse(&dst);
        assert_eq!(head.len, 0x4321);
        assert_eq!(head.kind, Kind::Headers);
        assert!(head.is_end_headers());
        assert!(!head.is_end_stream());
        assert_eq!(head.stream_id, 7);
    }

    #[test]
    fn reserved_bit_is_masked() {
        let bytes = [0, 0, 0, 0x0, 0, 0xff, 0xff, 0xff, 0xff];
        let head = FrameHead::parse(&bytes);
        assert_eq!(head.stream_id, STREAM_ID_MASK);
    }

    #[test]
    fn settings_round_trip() {
        let mut dst = BytesMut::new();
        encode_settings(
            &mut dst,
            &[
                (SETTINGS_MAX_FRAME_SIZE, 16_384),
                (SETTINGS_INITIAL_WINDOW_SIZE, 65_535),
            ],
        );
        let head = FrameHead::parse(&dst);
        assert_eq!(head.kind, Kind::Settings);
        assert_eq!(head.len, 12);
        let entries = parse_settings_payload(&dst[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(entries[0], (SETTINGS_MAX_FRAME_SIZE, 16_384));
        assert_eq!(entries[1], (SETTINGS_INITIAL_WINDOW_SIZE, 65_535));
    }

    #[test]
    fn settings_length_must_be_multiple_of_six() {
        assert_eq!(
            parse_settings_payload(&[0; 7]),
            Err(Reason::FRAME_SIZE_ERROR)
        );
    }

    #[test]
    fn padding_stripped() {
        let mut payload = Bytes::from_static(&[3, b'a', b'b', 0, 0, 0]);
        strip_padding(&mut payload).unwrap();
        assert_eq!(&payload[..], b"ab");
    }

    #[test]
    fn padding_longer_than_payload_rejected() {
        let mut payload = Bytes::from_static(&[5, b'a', 0, 0]);
        assert_eq!(strip_padding(&mut payload), Err(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn go_away_round_trip() {
        let mut dst = BytesMut::new();
        encode_go_away(&mut dst, 5, Reason::FLOW_CONTROL_ERROR);
        let parsed = parse_go_away(&dst[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(parsed.last_stream_id, 5);
        assert_eq!(parsed.reason, Reason::FLOW_CONTROL_ERROR);
    }
}
