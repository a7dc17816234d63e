//! # Topic Framing
//!
//! The device link is a byte stream of topic packets. Each packet is an
//! 8-byte header followed by `num_words * 4` payload bytes, and a single
//! packet may arrive split across any number of bulk reads.
//!
//! ```text
//!  byte 0: [0:3) version | 3 internal | 4 has_alignment_padding
//!  byte 1: topic (6 bits)
//!  bytes 2-3: num_words
//!  bytes 4-5: sequence_num
//!  bytes 6-7: reserved
//! ```
//!
//! [`TopicFramer`] is pure logic: feed it chunks as they are read, collect the
//! packets that completed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::warn;

use crate::error::FramingError;

pub const TOPIC_HEADER_LEN: usize = 8;

/// Largest payload a single topic packet can carry.
pub const MAX_TOPIC_PAYLOAD: usize = u16::MAX as usize * 4;

/// Topic identifiers.
pub mod topics {
    pub const AUI4A_ADV: u8 = 0x00;
    pub const HOSTINFO_ADV: u8 = 0x01;
    pub const COMMAND: u8 = 0x02;
    pub const POSE: u8 = 0x03;
    pub const MESH: u8 = 0x04;
    pub const VIDEO: u8 = 0x05;
    pub const AUDIO: u8 = 0x06;
    pub const HAPTIC: u8 = 0x07;
    pub const HANDS: u8 = 0x08;
    pub const SKELETON: u8 = 0x09;
    pub const SLICE_0: u8 = 0x0A;
    pub const INPUT_CONTROL: u8 = 0x1C;
    pub const LOGGING: u8 = 0x1F;
}

const FLAG_INTERNAL: u8 = 0x08;
const FLAG_PADDING: u8 = 0x10;
const TOPIC_MASK: u8 = 0x3F;

// ─── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicHeader {
    pub version_number: u8,
    pub version_is_internal: bool,
    pub has_alignment_padding: bool,
    pub topic: u8,
    /// Payload length in 4-byte words, padding included.
    pub num_words: u16,
    pub sequence_num: u16,
}

impl TopicHeader {
    pub fn payload_size(&self) -> usize {
        self.num_words as usize * 4
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut b0 = self.version_number & 0x07;
        if self.version_is_internal {
            b0 |= FLAG_INTERNAL;
        }
        if self.has_alignment_padding {
            b0 |= FLAG_PADDING;
        }
        buf.put_u8(b0);
        buf.put_u8(self.topic & TOPIC_MASK);
        buf.put_u16_le(self.num_words);
        buf.put_u16_le(self.sequence_num);
        buf.put_u16_le(0);
    }

    /// Fails when fewer than 8 bytes are given or the topic byte uses its two
    /// reserved high bits, which only happens when the reader lost sync.
    pub fn decode(mut buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < TOPIC_HEADER_LEN {
            return Err(FramingError::TooShort {
                needed: TOPIC_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let b0 = buf.get_u8();
        let topic = buf.get_u8();
        if topic & !TOPIC_MASK != 0 {
            return Err(FramingError::UnknownKind(topic));
        }
        let num_words = buf.get_u16_le();
        let sequence_num = buf.get_u16_le();
        let _reserved = buf.get_u16_le();

        Ok(TopicHeader {
            version_number: b0 & 0x07,
            version_is_internal: b0 & FLAG_INTERNAL != 0,
            has_alignment_padding: b0 & FLAG_PADDING != 0,
            topic,
            num_words,
            sequence_num,
        })
    }
}

/// Frame `payload` as one topic packet, padding it to a word boundary.
pub fn encode_topic(topic: u8, sequence_num: u16, payload: &[u8]) -> Result<Bytes, FramingError> {
    let rem = payload.len() % 4;
    let padding = if rem == 0 { 0 } else { 4 - rem };
    let padded = payload.len() + padding;
    if padded > MAX_TOPIC_PAYLOAD {
        return Err(FramingError::TooLarge {
            len: payload.len(),
            max: MAX_TOPIC_PAYLOAD,
        });
    }

    let header = TopicHeader {
        has_alignment_padding: padding != 0,
        topic,
        num_words: (padded / 4) as u16,
        sequence_num,
        ..TopicHeader::default()
    };

    let mut buf = BytesMut::with_capacity(TOPIC_HEADER_LEN + padded);
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    if padding != 0 {
        buf.put_bytes(0, padding - 1);
        buf.put_u8(padding as u8);
    }
    Ok(buf.freeze())
}

/// Frames outgoing payloads on one topic with a shared sequence counter.
#[derive(Debug)]
pub struct TopicWriter {
    topic: u8,
    sequence: AtomicU16,
}

impl TopicWriter {
    pub fn new(topic: u8) -> Self {
        TopicWriter {
            topic,
            sequence: AtomicU16::new(0),
        }
    }

    pub fn topic(&self) -> u8 {
        self.topic
    }

    pub fn frame(&self, payload: &[u8]) -> Result<Bytes, FramingError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        encode_topic(self.topic, seq, payload)
    }

    /// Frame a payload of any size as consecutive topic packets.
    pub fn frame_all(&self, payload: &[u8]) -> Result<Vec<Bytes>, FramingError> {
        if payload.is_empty() {
            return Ok(vec![self.frame(payload)?]);
        }
        payload.chunks(MAX_TOPIC_PAYLOAD).map(|c| self.frame(c)).collect()
    }
}

// ─── Packets ─────────────────────────────────────────────────────────────────

/// A fully received topic packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPacket {
    pub header: TopicHeader,
    /// Payload with alignment padding stripped.
    pub payload: Bytes,
    /// Payload bytes announced by the header, padding included.
    pub payload_size: u32,
    /// Payload bytes received so far.
    pub payload_valid: u32,
    /// Offset in the completing chunk where the next packet begins.
    pub remainder_offs: u32,
    /// `payload_valid - payload_size`; negative while more data is expected.
    pub missing_bytes: i32,
    /// Local receive time of the chunk that carried the header.
    pub recv_ns: i64,
}

impl TopicPacket {
    pub fn topic(&self) -> u8 {
        self.header.topic
    }

    pub fn sequence_num(&self) -> u16 {
        self.header.sequence_num
    }
}

struct WorkingPacket {
    header: TopicHeader,
    buf: BytesMut,
    recv_ns: i64,
}

impl WorkingPacket {
    fn missing(&self) -> usize {
        self.header.payload_size() - self.buf.len()
    }

    fn finish(self, remainder_offs: usize) -> Result<TopicPacket, FramingError> {
        let payload_size = self.header.payload_size();
        let mut payload = self.buf.freeze();

        if self.header.has_alignment_padding {
            let padding = payload.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > payload.len() {
                return Err(FramingError::BadPadding {
                    padding,
                    payload_len: payload.len(),
                });
            }
            payload.truncate(payload.len() - padding);
        }

        Ok(TopicPacket {
            header: self.header,
            payload,
            payload_size: payload_size as u32,
            payload_valid: payload_size as u32,
            remainder_offs: remainder_offs as u32,
            missing_bytes: 0,
            recv_ns: self.recv_ns,
        })
    }
}

// ─── Framer ──────────────────────────────────────────────────────────────────

/// Rebuilds topic packets from arbitrarily split reads.
#[derive(Default)]
pub struct TopicFramer {
    working: Option<WorkingPacket>,
    /// Header bytes left over from a chunk that ended mid-header.
    partial_header: Vec<u8>,
    framing_errors: u64,
}

impl TopicFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one read. Returns every packet completed by this chunk in
    /// arrival order. A malformed header discards the rest of the chunk.
    pub fn push(&mut self, chunk: &[u8], recv_ns: i64) -> Vec<TopicPacket> {
        let mut out = Vec::new();
        let mut offs = 0;

        while offs < chunk.len() {
            if let Some(working) = self.working.as_mut() {
                let take = working.missing().min(chunk.len() - offs);
                working.buf.extend_from_slice(&chunk[offs..offs + take]);
                offs += take;
                if working.missing() > 0 {
                    break;
                }
                if let Some(pkt) = self.working.take() {
                    match pkt.finish(offs) {
                        Ok(pkt) => out.push(pkt),
                        Err(e) => self.record_error(&e),
                    }
                }
                continue;
            }

            let need = TOPIC_HEADER_LEN - self.partial_header.len();
            if chunk.len() - offs < need {
                self.partial_header.extend_from_slice(&chunk[offs..]);
                break;
            }
            self.partial_header
                .extend_from_slice(&chunk[offs..offs + need]);
            offs += need;

            let decoded = TopicHeader::decode(&self.partial_header);
            self.partial_header.clear();
            match decoded {
                Ok(header) => {
                    let working = WorkingPacket {
                        header,
                        buf: BytesMut::with_capacity(header.payload_size()),
                        recv_ns,
                    };
                    if header.num_words == 0 {
                        match working.finish(offs) {
                            Ok(pkt) => out.push(pkt),
                            Err(e) => self.record_error(&e),
                        }
                    } else {
                        self.working = Some(working);
                    }
                }
                Err(e) => {
                    self.record_error(&e);
                    break;
                }
            }
        }

        out
    }

    /// Bytes still expected by the packet in progress, as a non-positive
    /// `missing_bytes` value.
    pub fn missing_bytes(&self) -> i32 {
        match &self.working {
            Some(w) => -(w.missing() as i32),
            None => 0,
        }
    }

    pub fn has_working_packet(&self) -> bool {
        self.working.is_some()
    }

    /// Total malformed headers and paddings seen so far.
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Drop any partial state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.working = None;
        self.partial_header.clear();
    }

    fn record_error(&mut self, error: &FramingError) {
        self.framing_errors += 1;
        warn!(error = %error, "dropping malformed topic data, resynchronising");
    }
}
