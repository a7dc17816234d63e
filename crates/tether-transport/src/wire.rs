//! # Tether Wire Format
//!
//! Fixed binary headers for the control ("hostinfo") channel and the video
//! shard stream. All multi-byte fields are little-endian.
//!
//! ## HostInfo Header (8 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Type  |      Result (10)      |      Stream Size Words (18)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Aux (32)                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload starts at offset 8 for every message type.
//!
//! ## Stream packets
//!
//! Video data and parity shards carry a one-byte kind tag so both can share a
//! datagram stream:
//!
//! ```text
//! data:   01 | stream u8 | flags u8 | frame u64 | shard u32 | [view info 36] | len u16 | payload
//! parity: 02 | stream u8 | frame u64 | data count u32 | parity count u32 | parity idx u32 | len u16 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::FramingError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of the packed hostinfo header.
pub const HOSTINFO_HEADER_LEN: usize = 8;

/// Size of an echo payload: four `i64` timestamps.
pub const ECHO_PAYLOAD_LEN: usize = 32;

/// Default upper bound on a data shard's payload.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// Largest payload cap whose padded FEC row still fits the 16-bit parity
/// length field.
pub const MAX_PAYLOAD_SIZE_LIMIT: usize =
    (u16::MAX as usize - DataShard::HEADER_LEN - VIEW_INFO_SIZE) & !1;

/// Largest `stream_size` the 18-bit word field can carry.
pub const MAX_STREAM_SIZE: u32 = ((1 << 18) - 1) << 2;

/// Built-in hostinfo message types (4-bit field).
pub mod message_type {
    pub const PAIRING: u8 = 0x0;
    pub const PAIRING_ACK: u8 = 0x1;
    pub const ECHO: u8 = 0x2;
    pub const CODE_GENERATION: u8 = 0x3;
    pub const CODE_GENERATION_ACK: u8 = 0x4;
    pub const RESERVED: u8 = 0x5;
    pub const OK: u8 = 0x6;
    pub const ACK: u8 = 0x7;
    pub const ERROR: u8 = 0x8;
    pub const BYE: u8 = 0x9;
    pub const INVITE: u8 = 0xA;
}

/// Echo `result` field: a request from the sender.
pub const ECHO_PING: u16 = 0;
/// Echo `result` field: the reply to a ping.
pub const ECHO_PONG: u16 = 1;

// ─── HostInfo ────────────────────────────────────────────────────────────────

/// A decoded hostinfo message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfoPacket {
    /// 4-bit message type, see [`message_type`].
    pub message_type: u8,
    /// 10-bit result / sub-type field.
    pub result: u16,
    /// Declared stream size in bytes (always a multiple of 4).
    pub stream_size: u32,
    /// Message-specific word (the echo id for echo messages).
    pub aux: u32,
    /// Everything after the 8-byte header.
    pub payload: Bytes,
    /// Local receive time of the carrying topic packet.
    pub recv_ns: i64,
}

impl HostInfoPacket {
    pub fn is_echo(&self) -> bool {
        self.message_type == message_type::ECHO
    }

    pub fn with_recv_ns(mut self, recv_ns: i64) -> Self {
        self.recv_ns = recv_ns;
        self
    }
}

/// Pack a hostinfo header followed by `payload`.
///
/// `stream_size` is stored in words (`stream_size >> 2`); the two low bits are
/// dropped, not rounded. `message_type` and `result` are masked to their field
/// widths.
pub fn encode_hostinfo(
    message_type: u8,
    result: u16,
    stream_size: u32,
    aux: u32,
    payload: &[u8],
) -> Bytes {
    let word = (message_type as u32 & 0xF)
        | ((result as u32 & 0x3FF) << 4)
        | (((stream_size >> 2) & 0x3_FFFF) << 14);

    let mut buf = BytesMut::with_capacity(HOSTINFO_HEADER_LEN + payload.len());
    buf.put_u32_le(word);
    buf.put_u32_le(aux);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Unpack a hostinfo header. The payload is a zero-copy slice of `data`.
pub fn decode_hostinfo(data: Bytes) -> Result<HostInfoPacket, FramingError> {
    if data.len() < HOSTINFO_HEADER_LEN {
        return Err(FramingError::TooShort {
            needed: HOSTINFO_HEADER_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let word = buf.get_u32_le();
    let aux = buf.get_u32_le();

    Ok(HostInfoPacket {
        message_type: (word & 0xF) as u8,
        result: ((word >> 4) & 0x3FF) as u16,
        stream_size: (word >> 14) << 2,
        aux,
        payload: buf,
        recv_ns: 0,
    })
}

// ─── Echo ────────────────────────────────────────────────────────────────────

/// Four-timestamp echo body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoPayload {
    /// Originator's send time.
    pub org: i64,
    /// Responder's receive time.
    pub recv: i64,
    /// Responder's transmit time.
    pub xmt: i64,
    /// Sender's current clock offset estimate.
    pub offset: i64,
}

impl EchoPayload {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.org);
        buf.put_i64_le(self.recv);
        buf.put_i64_le(self.xmt);
        buf.put_i64_le(self.offset);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < ECHO_PAYLOAD_LEN {
            return Err(FramingError::TooShort {
                needed: ECHO_PAYLOAD_LEN,
                actual: buf.len(),
            });
        }
        Ok(EchoPayload {
            org: buf.get_i64_le(),
            recv: buf.get_i64_le(),
            xmt: buf.get_i64_le(),
            offset: buf.get_i64_le(),
        })
    }
}

/// Build an echo hostinfo message. `echo_id` travels in the aux word.
pub fn encode_echo(result: u16, echo_id: u32, payload: &EchoPayload) -> Bytes {
    let mut body = [0u8; ECHO_PAYLOAD_LEN];
    payload.encode(&mut &mut body[..]);
    encode_hostinfo(
        message_type::ECHO,
        result,
        (HOSTINFO_HEADER_LEN + ECHO_PAYLOAD_LEN) as u32,
        echo_id,
        &body,
    )
}

// ─── Capnp Segment Header ───────────────────────────────────────────────────

/// Prefix of every segmented message: the length of the segment that follows,
/// in 8-byte words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapnpSegmentHeader {
    pub tag: u32,
    pub len_u64s: u32,
}

impl CapnpSegmentHeader {
    pub const ENCODED_LEN: usize = 8;

    pub fn for_payload(payload_len: usize) -> Self {
        CapnpSegmentHeader {
            tag: 0,
            len_u64s: (payload_len >> 3) as u32,
        }
    }

    /// Segment length in bytes.
    pub fn segment_len(&self) -> usize {
        self.len_u64s as usize * 8
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.len_u64s);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(FramingError::TooShort {
                needed: Self::ENCODED_LEN,
                actual: buf.len(),
            });
        }
        Ok(CapnpSegmentHeader {
            tag: buf.get_u32_le(),
            len_u64s: buf.get_u32_le(),
        })
    }
}

/// Hostinfo message whose payload is prefixed with a [`CapnpSegmentHeader`].
pub fn encode_capnp(message_type: u8, result: u16, aux: u32, payload: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(CapnpSegmentHeader::ENCODED_LEN + payload.len());
    CapnpSegmentHeader::for_payload(payload.len()).encode(&mut body);
    body.extend_from_slice(payload);
    let stream_size = (HOSTINFO_HEADER_LEN + body.len()) as u32;
    encode_hostinfo(message_type, result, stream_size, aux, &body)
}

// ─── Shard Flags ─────────────────────────────────────────────────────────────

/// Slice/frame boundary bits of a data shard.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShardFlags(u8);

impl ShardFlags {
    pub const START_OF_SLICE: ShardFlags = ShardFlags(0x01);
    pub const END_OF_SLICE: ShardFlags = ShardFlags(0x02);
    pub const END_OF_FRAME: ShardFlags = ShardFlags(0x04);

    const ALL: u8 = 0x07;

    pub const fn empty() -> Self {
        ShardFlags(0)
    }

    /// Unknown bits are discarded.
    pub const fn from_bits(bits: u8) -> Self {
        ShardFlags(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: ShardFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ShardFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for ShardFlags {
    type Output = ShardFlags;

    fn bitor(self, rhs: ShardFlags) -> ShardFlags {
        ShardFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ShardFlags {
    fn bitor_assign(&mut self, rhs: ShardFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ShardFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::START_OF_SLICE) {
            names.push("START_OF_SLICE");
        }
        if self.contains(Self::END_OF_SLICE) {
            names.push("END_OF_SLICE");
        }
        if self.contains(Self::END_OF_FRAME) {
            names.push("END_OF_FRAME");
        }
        write!(f, "ShardFlags({})", names.join("|"))
    }
}

// ─── View Info ───────────────────────────────────────────────────────────────

/// Head pose the frame was rendered for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Quaternion `x, y, z, w`.
    pub orientation: [f32; 4],
    /// Metres.
    pub position: [f32; 3],
}

impl Pose {
    pub const ENCODED_LEN: usize = 28;

    pub fn encode(&self, buf: &mut impl BufMut) {
        for v in self.orientation.iter().chain(self.position.iter()) {
            buf.put_f32_le(*v);
        }
    }

    /// The caller guarantees `ENCODED_LEN` bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let mut orientation = [0f32; 4];
        let mut position = [0f32; 3];
        for v in orientation.iter_mut() {
            *v = buf.get_f32_le();
        }
        for v in position.iter_mut() {
            *v = buf.get_f32_le();
        }
        Pose {
            orientation,
            position,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [0.0; 3],
        }
    }
}

/// Metadata carried by the last shard of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewInfo {
    /// Target display time, local monotonic nanoseconds.
    pub display_time: i64,
    pub pose: Pose,
}

/// Encoded size of [`ViewInfo`].
pub const VIEW_INFO_SIZE: usize = 8 + Pose::ENCODED_LEN;

impl ViewInfo {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.display_time);
        self.pose.encode(buf);
    }

    /// The caller guarantees `VIEW_INFO_SIZE` bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let display_time = buf.get_i64_le();
        let pose = Pose::decode(buf);
        ViewInfo { display_time, pose }
    }
}

// ─── Shards ──────────────────────────────────────────────────────────────────

const KIND_DATA: u8 = 0x01;
const KIND_PARITY: u8 = 0x02;

/// One network-sized fragment of an encoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DataShard {
    pub stream_idx: u8,
    pub frame_idx: u64,
    /// Dense, zero-based within the frame.
    pub shard_idx: u32,
    pub flags: ShardFlags,
    /// Present only on the `END_OF_FRAME` shard.
    pub view_info: Option<ViewInfo>,
    pub payload: Bytes,
}

impl DataShard {
    /// Header size without view info: kind + stream + flags + frame + shard + len.
    pub const HEADER_LEN: usize = 1 + 1 + 1 + 8 + 4 + 2;

    pub fn encoded_len(&self) -> usize {
        let view = if self.flags.contains(ShardFlags::END_OF_FRAME) {
            VIEW_INFO_SIZE
        } else {
            0
        };
        Self::HEADER_LEN + view + self.payload.len()
    }

    pub fn is_end_of_frame(&self) -> bool {
        self.flags.contains(ShardFlags::END_OF_FRAME)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(KIND_DATA);
        buf.put_u8(self.stream_idx);
        buf.put_u8(self.flags.bits());
        buf.put_u64_le(self.frame_idx);
        buf.put_u32_le(self.shard_idx);
        if self.flags.contains(ShardFlags::END_OF_FRAME) {
            self.view_info.unwrap_or_default().encode(buf);
        }
        buf.put_u16_le(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode a data shard. Bytes after the declared payload (FEC padding) are ignored.
    fn decode_body(buf: &mut Bytes, total: usize) -> Result<Self, FramingError> {
        let min = Self::HEADER_LEN - 1;
        if buf.remaining() < min {
            return Err(FramingError::TooShort {
                needed: Self::HEADER_LEN,
                actual: total,
            });
        }
        let stream_idx = buf.get_u8();
        let flags = ShardFlags::from_bits(buf.get_u8());
        let frame_idx = buf.get_u64_le();
        let shard_idx = buf.get_u32_le();

        let view_info = if flags.contains(ShardFlags::END_OF_FRAME) {
            if buf.remaining() < VIEW_INFO_SIZE + 2 {
                return Err(FramingError::TooShort {
                    needed: Self::HEADER_LEN + VIEW_INFO_SIZE,
                    actual: total,
                });
            }
            Some(ViewInfo::decode(buf))
        } else {
            None
        };

        let payload_len = buf.get_u16_le() as usize;
        if buf.remaining() < payload_len {
            return Err(FramingError::LengthMismatch {
                declared: payload_len,
                available: buf.remaining(),
            });
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(DataShard {
            stream_idx,
            frame_idx,
            shard_idx,
            flags,
            view_info,
            payload,
        })
    }
}

/// A parity row produced by the erasure coder for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParityShard {
    pub stream_idx: u8,
    pub frame_idx: u64,
    pub data_shard_count: u32,
    pub parity_count: u32,
    /// Row index among this frame's parity shards.
    pub parity_idx: u32,
    /// Same length as every padded data row.
    pub payload: Bytes,
}

impl ParityShard {
    pub const HEADER_LEN: usize = 1 + 1 + 8 + 4 + 4 + 4 + 2;

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(KIND_PARITY);
        buf.put_u8(self.stream_idx);
        buf.put_u64_le(self.frame_idx);
        buf.put_u32_le(self.data_shard_count);
        buf.put_u32_le(self.parity_count);
        buf.put_u32_le(self.parity_idx);
        buf.put_u16_le(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }

    fn decode_body(buf: &mut Bytes, total: usize) -> Result<Self, FramingError> {
        if buf.remaining() < Self::HEADER_LEN - 1 {
            return Err(FramingError::TooShort {
                needed: Self::HEADER_LEN,
                actual: total,
            });
        }
        let stream_idx = buf.get_u8();
        let frame_idx = buf.get_u64_le();
        let data_shard_count = buf.get_u32_le();
        let parity_count = buf.get_u32_le();
        let parity_idx = buf.get_u32_le();
        let payload_len = buf.get_u16_le() as usize;
        if buf.remaining() < payload_len {
            return Err(FramingError::LengthMismatch {
                declared: payload_len,
                available: buf.remaining(),
            });
        }
        Ok(ParityShard {
            stream_idx,
            frame_idx,
            data_shard_count,
            parity_count,
            parity_idx,
            payload: buf.copy_to_bytes(payload_len),
        })
    }
}

/// Either kind of video stream packet.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPacket {
    Data(DataShard),
    Parity(ParityShard),
}

impl StreamPacket {
    pub fn stream_idx(&self) -> u8 {
        match self {
            StreamPacket::Data(s) => s.stream_idx,
            StreamPacket::Parity(p) => p.stream_idx,
        }
    }

    pub fn frame_idx(&self) -> u64 {
        match self {
            StreamPacket::Data(s) => s.frame_idx,
            StreamPacket::Parity(p) => p.frame_idx,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            StreamPacket::Data(s) => s.encoded_len(),
            StreamPacket::Parity(p) => p.encoded_len(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            StreamPacket::Data(s) => s.encode(&mut buf),
            StreamPacket::Parity(p) => p.encode(&mut buf),
        }
        buf.freeze()
    }

    /// Decode a stream packet. Payloads are zero-copy slices of `data`.
    pub fn decode(data: Bytes) -> Result<Self, FramingError> {
        let total = data.len();
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(FramingError::TooShort {
                needed: 1,
                actual: 0,
            });
        }
        match buf.get_u8() {
            KIND_DATA => DataShard::decode_body(&mut buf, total).map(StreamPacket::Data),
            KIND_PARITY => ParityShard::decode_body(&mut buf, total).map(StreamPacket::Parity),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn proptest_hostinfo_roundtrip(
            message_type in 0u8..16,
            result in 0u16..1024,
            words in 0u32..(1 << 18),
            aux in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let stream_size = words << 2;
            let encoded = encode_hostinfo(message_type, result, stream_size, aux, &payload);
            prop_assert_eq!(encoded.len(), HOSTINFO_HEADER_LEN + payload.len());

            let decoded = decode_hostinfo(encoded).unwrap();
            prop_assert_eq!(decoded.message_type, message_type);
            prop_assert_eq!(decoded.result, result);
            prop_assert_eq!(decoded.stream_size, stream_size);
            prop_assert_eq!(decoded.aux, aux);
            prop_assert_eq!(&decoded.payload[..], &payload[..]);
        }
    }

    #[test]
    fn hostinfo_stream_size_truncates_low_bits() {
        let encoded = encode_hostinfo(message_type::OK, 0, 0x1237, 0, &[]);
        let decoded = decode_hostinfo(encoded).unwrap();
        assert_eq!(decoded.stream_size, 0x1234);
    }

    #[test]
    fn hostinfo_bit_layout() {
        let encoded = encode_hostinfo(0xA, 0x155, 0x40, 0xDEAD_BEEF, b"xy");
        let word = u32::from_le_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(word & 0xF, 0xA);
        assert_eq!((word >> 4) & 0x3FF, 0x155);
        assert_eq!(word >> 14, 0x10);
        assert_eq!(&encoded[4..8], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&encoded[8..], b"xy");
    }

    #[test]
    fn hostinfo_too_short() {
        let err = decode_hostinfo(Bytes::from_static(&[0u8; 7])).unwrap_err();
        assert_eq!(
            err,
            FramingError::TooShort {
                needed: 8,
                actual: 7
            }
        );
    }

    #[test]
    fn hostinfo_echo_uses_same_offset() {
        let echo = encode_echo(ECHO_PING, 9, &EchoPayload::default());
        let other = encode_hostinfo(message_type::OK, 0, 40, 9, &[0u8; 32]);
        let echo = decode_hostinfo(echo).unwrap();
        let other = decode_hostinfo(other).unwrap();
        assert_eq!(echo.payload.len(), ECHO_PAYLOAD_LEN);
        assert_eq!(echo.payload.len(), other.payload.len());
    }

    #[test]
    fn echo_message_roundtrip() {
        let body = EchoPayload {
            org: 1_000,
            recv: -2_000,
            xmt: 3_000,
            offset: i64::MIN,
        };
        let pkt = decode_hostinfo(encode_echo(ECHO_PONG, 77, &body)).unwrap();
        assert!(pkt.is_echo());
        assert_eq!(pkt.result, ECHO_PONG);
        assert_eq!(pkt.aux, 77);
        assert_eq!(pkt.stream_size, 40);
        assert_eq!(EchoPayload::decode(&pkt.payload).unwrap(), body);
    }

    #[test]
    fn echo_payload_too_short() {
        assert!(matches!(
            EchoPayload::decode(&[0u8; 31]),
            Err(FramingError::TooShort { needed: 32, .. })
        ));
    }

    #[test]
    fn capnp_header_prefixes_payload() {
        let pkt = decode_hostinfo(encode_capnp(message_type::OK, 3, 5, &[7u8; 24])).unwrap();
        let seg = CapnpSegmentHeader::decode(&pkt.payload).unwrap();
        assert_eq!(seg.len_u64s, 3);
        assert_eq!(seg.segment_len(), 24);
        assert_eq!(pkt.stream_size, 40);
        assert_eq!(&pkt.payload[8..], &[7u8; 24]);
    }

    #[test]
    fn shard_flags_ops() {
        let mut flags = ShardFlags::START_OF_SLICE;
        assert!(!flags.contains(ShardFlags::END_OF_SLICE));
        flags |= ShardFlags::END_OF_SLICE;
        assert!(flags.contains(ShardFlags::START_OF_SLICE | ShardFlags::END_OF_SLICE));
        assert_eq!(ShardFlags::from_bits(0xFF).bits(), 0x07);
        assert_eq!(
            format!("{flags:?}"),
            "ShardFlags(START_OF_SLICE|END_OF_SLICE)"
        );
    }

    #[test]
    fn data_shard_roundtrip_with_view_info() {
        let shard = DataShard {
            stream_idx: 2,
            frame_idx: 0x0102_0304_0506,
            shard_idx: 41,
            flags: ShardFlags::END_OF_SLICE | ShardFlags::END_OF_FRAME,
            view_info: Some(ViewInfo {
                display_time: 123_456_789,
                pose: Pose {
                    orientation: [0.1, 0.2, 0.3, 0.9],
                    position: [1.0, 1.5, -2.0],
                },
            }),
            payload: Bytes::from_static(b"slice tail"),
        };
        let pkt = StreamPacket::Data(shard.clone());
        let encoded = pkt.encode();
        assert_eq!(
            encoded.len(),
            DataShard::HEADER_LEN + VIEW_INFO_SIZE + shard.payload.len()
        );
        assert_eq!(StreamPacket::decode(encoded).unwrap(), pkt);
    }

    #[test]
    fn data_shard_ignores_trailing_padding() {
        let shard = DataShard {
            stream_idx: 0,
            frame_idx: 1,
            shard_idx: 0,
            flags: ShardFlags::START_OF_SLICE,
            view_info: None,
            payload: Bytes::from_static(b"abc"),
        };
        let mut buf = BytesMut::new();
        shard.encode(&mut buf);
        buf.extend_from_slice(&[0u8; 13]);
        match StreamPacket::decode(buf.freeze()).unwrap() {
            StreamPacket::Data(decoded) => assert_eq!(decoded, shard),
            other => panic!("expected data shard, got {other:?}"),
        }
    }

    #[test]
    fn parity_shard_roundtrip() {
        let parity = ParityShard {
            stream_idx: 1,
            frame_idx: 99,
            data_shard_count: 250,
            parity_count: 13,
            parity_idx: 12,
            payload: Bytes::from(vec![0xA5; 1218]),
        };
        let pkt = StreamPacket::Parity(parity);
        assert_eq!(StreamPacket::decode(pkt.encode()).unwrap(), pkt);
    }

    #[test]
    fn stream_packet_rejects_garbage() {
        assert_eq!(
            StreamPacket::decode(Bytes::from_static(&[0x7F, 0, 0])).unwrap_err(),
            FramingError::UnknownKind(0x7F)
        );
        assert!(matches!(
            StreamPacket::decode(Bytes::from_static(&[KIND_DATA, 0, 0])),
            Err(FramingError::TooShort { .. })
        ));
        assert!(matches!(
            StreamPacket::decode(Bytes::new()),
            Err(FramingError::TooShort { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_length_mismatch() {
        let shard = DataShard {
            stream_idx: 0,
            frame_idx: 0,
            shard_idx: 0,
            flags: ShardFlags::empty(),
            view_info: None,
            payload: Bytes::from(vec![1u8; 64]),
        };
        let encoded = StreamPacket::Data(shard).encode();
        let cut = encoded.slice(..encoded.len() - 10);
        assert_eq!(
            StreamPacket::decode(cut).unwrap_err(),
            FramingError::LengthMismatch {
                declared: 64,
                available: 54
            }
        );
    }
}
