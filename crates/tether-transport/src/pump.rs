//! # Stream Pump
//!
//! Drives encoded frames out of the host: shard → FEC → sink, one
//! independent lane per sub-stream (codec config, key frames, delta frames).
//!
//! Each lane has its own mutex, held only while the shard list is mutated.
//! Sink I/O always happens after the guard is dropped.
//!
//! Two [`VideoChannel`] variants exist, picked once at connection setup:
//!
//! - [`StreamPump`]: packetized network channel with sharding and FEC
//! - [`DirectChannel`]: the device link already guarantees delivery, so
//!   CSD/IDR bytes are buffered per stream and written as one topic-framed
//!   video message on flush

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::codec::{FecEncoder, FecPolicy};
use crate::error::{FramingError, PumpError, TransportError};
use crate::shard::FrameSharder;
use crate::stats::TransportCounters;
use crate::topic::{topics, TopicWriter};
use crate::transport::FrameSink;
use crate::wire::{DataShard, StreamPacket, ViewInfo, DEFAULT_MAX_PAYLOAD_SIZE, VIEW_INFO_SIZE};

/// Default number of sub-streams.
pub const DEFAULT_STREAM_COUNT: usize = 3;

// ─── Sink ────────────────────────────────────────────────────────────────────

/// Destination for stream packets.
pub trait ShardSink: Send + Sync {
    fn send_stream(&self, packet: &StreamPacket) -> Result<(), TransportError>;
}

impl<S: FrameSink + ?Sized> ShardSink for S {
    fn send_stream(&self, packet: &StreamPacket) -> Result<(), TransportError> {
        self.send_frame(packet.encode())
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Protocol cap on a shard payload, view info included.
    pub max_payload_size: usize,
    /// Split size for frame bytes.
    pub shard_payload_size: usize,
    pub fec: FecPolicy,
    pub stream_count: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            shard_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            fec: FecPolicy::default(),
            stream_count: DEFAULT_STREAM_COUNT,
        }
    }
}

/// Outcome of one finalized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub stream_idx: u8,
    pub frame_idx: u64,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// `false` when the erasure coder could not be built.
    pub protected: bool,
    /// Packets the sink refused (queue full, I/O error).
    pub send_failures: usize,
}

// ─── Video Channel ───────────────────────────────────────────────────────────

/// What the encoder side talks to.
pub trait VideoChannel: Send + Sync {
    fn begin_frame(&self, stream_idx: u8, frame_idx: u64) -> Result<(), PumpError>;
    /// Codec configuration data (SPS/PPS and friends).
    fn send_csd(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError>;
    /// Picture data.
    fn send_idr(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError>;
    fn flush_stream(&self, stream_idx: u8, view_info: ViewInfo) -> Result<(), PumpError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn check_stream(stream_idx: u8, stream_count: usize) -> Result<usize, PumpError> {
    let idx = stream_idx as usize;
    if idx < stream_count {
        Ok(idx)
    } else {
        Err(PumpError::InvalidStream {
            stream_idx,
            stream_count,
        })
    }
}

// ─── Stream Pump ─────────────────────────────────────────────────────────────

struct StreamSlot {
    sharder: FrameSharder,
    needs_flush: bool,
    frame_idx: u64,
}

pub struct StreamPump<S> {
    slots: Vec<Mutex<StreamSlot>>,
    encoder: FecEncoder,
    sink: S,
    config: PumpConfig,
    counters: Arc<TransportCounters>,
}

impl<S: ShardSink> StreamPump<S> {
    pub fn new(config: PumpConfig, sink: S, counters: Arc<TransportCounters>) -> Self {
        let slots = (0..config.stream_count)
            .map(|_| {
                Mutex::new(StreamSlot {
                    sharder: FrameSharder::new(),
                    needs_flush: false,
                    frame_idx: 0,
                })
            })
            .collect();
        StreamPump {
            slots,
            encoder: FecEncoder::new(config.fec),
            sink,
            config,
            counters,
        }
    }

    /// Shard `bytes` as one slice of `frame_idx` and send every shard that is
    /// final. The newest shard stays buffered until the next push or
    /// [`finalize`](Self::finalize).
    pub fn push(&self, stream_idx: u8, frame_idx: u64, bytes: Bytes) -> Result<(), PumpError> {
        let slot = &self.slots[check_stream(stream_idx, self.slots.len())?];
        let released = {
            let mut slot = lock(slot);
            slot.needs_flush = true;
            slot.frame_idx = frame_idx;
            slot.sharder
                .push(frame_idx, stream_idx, bytes, self.config.shard_payload_size)
        };

        let mut failures = 0;
        self.send_data(&released, &mut failures)?;
        Ok(())
    }

    /// Close the open frame on `stream_idx`: release its last shard with the
    /// view info, then send the frame's parity. Returns `None` if nothing was
    /// pushed.
    pub fn finalize(&self, stream_idx: u8, view_info: ViewInfo) -> Result<Option<FrameReport>, PumpError> {
        let slot = &self.slots[check_stream(stream_idx, self.slots.len())?];
        let finished = {
            let mut slot = lock(slot);
            slot.needs_flush = false;
            slot.sharder
                .finish_frame(view_info, self.config.max_payload_size)
        };
        let Some(frame) = finished else {
            return Ok(None);
        };

        let mut failures = 0;
        self.send_data(&frame.released, &mut failures)?;

        let (parity_shards, protected) = match self.encoder.finalize(&frame.shards) {
            Ok(parity) => {
                for p in &parity {
                    self.send_packet(&StreamPacket::Parity(p.clone()), &mut failures)?;
                    TransportCounters::incr(&self.counters.parity_shards_sent);
                }
                (parity.len(), true)
            }
            Err(e) => {
                warn!(
                    stream_idx,
                    frame_idx = frame.frame_idx,
                    data_shards = frame.shards.len(),
                    error = %e,
                    "FEC unavailable, frame sent unprotected"
                );
                TransportCounters::incr(&self.counters.unprotected_frames);
                (0, false)
            }
        };
        TransportCounters::incr(&self.counters.frames_sent);

        Ok(Some(FrameReport {
            stream_idx,
            frame_idx: frame.frame_idx,
            data_shards: frame.shards.len(),
            parity_shards,
            protected,
            send_failures: failures,
        }))
    }

    /// Whether `stream_idx` has pushed data that was not finalized yet.
    pub fn needs_flush(&self, stream_idx: u8) -> Result<bool, PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        Ok(lock(&self.slots[idx]).needs_flush)
    }

    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn send_data(&self, shards: &[DataShard], failures: &mut usize) -> Result<(), PumpError> {
        for shard in shards {
            self.send_packet(&StreamPacket::Data(shard.clone()), failures)?;
            TransportCounters::incr(&self.counters.data_shards_sent);
        }
        Ok(())
    }

    /// A closed sink stops the frame; any other failure is counted and the
    /// frame carries on, leaving the gap to FEC.
    fn send_packet(&self, packet: &StreamPacket, failures: &mut usize) -> Result<(), PumpError> {
        match self.sink.send_stream(packet) {
            Ok(()) => {
                TransportCounters::add(&self.counters.bytes_sent, packet.encoded_len() as u64);
                Ok(())
            }
            Err(TransportError::Closed) => Err(TransportError::Closed.into()),
            Err(e) => {
                *failures += 1;
                TransportCounters::incr(&self.counters.send_failures);
                warn!(
                    stream_idx = packet.stream_idx(),
                    frame_idx = packet.frame_idx(),
                    error = %e,
                    "stream packet dropped"
                );
                Ok(())
            }
        }
    }
}

impl<S: ShardSink> VideoChannel for StreamPump<S> {
    fn begin_frame(&self, stream_idx: u8, frame_idx: u64) -> Result<(), PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        lock(&self.slots[idx]).frame_idx = frame_idx;
        Ok(())
    }

    fn send_csd(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        let frame_idx = lock(&self.slots[idx]).frame_idx;
        self.push(stream_idx, frame_idx, data)
    }

    fn send_idr(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError> {
        self.send_csd(stream_idx, data)
    }

    fn flush_stream(&self, stream_idx: u8, view_info: ViewInfo) -> Result<(), PumpError> {
        if let Some(report) = self.finalize(stream_idx, view_info)? {
            debug!(
                stream_idx,
                frame_idx = report.frame_idx,
                data_shards = report.data_shards,
                parity_shards = report.parity_shards,
                "frame flushed"
            );
        }
        Ok(())
    }
}

// ─── Direct Channel ──────────────────────────────────────────────────────────

/// Prefix of a direct video message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectVideoHeader {
    pub stream_idx: u8,
    pub frame_idx: u64,
    pub view_info: ViewInfo,
    pub csd_len: u32,
    pub idr_len: u32,
}

impl DirectVideoHeader {
    pub const ENCODED_LEN: usize = 4 + 8 + VIEW_INFO_SIZE + 4 + 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.stream_idx);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.frame_idx);
        self.view_info.encode(buf);
        buf.put_u32_le(self.csd_len);
        buf.put_u32_le(self.idr_len);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(FramingError::TooShort {
                needed: Self::ENCODED_LEN,
                actual: buf.len(),
            });
        }
        let stream_idx = buf.get_u8();
        buf.advance(3);
        let frame_idx = buf.get_u64_le();
        let view_info = ViewInfo::decode(&mut buf);
        let csd_len = buf.get_u32_le();
        let idr_len = buf.get_u32_le();
        Ok(DirectVideoHeader {
            stream_idx,
            frame_idx,
            view_info,
            csd_len,
            idr_len,
        })
    }
}

#[derive(Default)]
struct DirectSlot {
    csd: BytesMut,
    idr: BytesMut,
    needs_flush: bool,
    frame_idx: u64,
}

pub struct DirectChannel<S> {
    slots: Vec<Mutex<DirectSlot>>,
    sink: S,
    writer: TopicWriter,
    counters: Arc<TransportCounters>,
}

impl<S: FrameSink> DirectChannel<S> {
    pub fn new(stream_count: usize, sink: S, counters: Arc<TransportCounters>) -> Self {
        DirectChannel {
            slots: (0..stream_count).map(|_| Mutex::new(DirectSlot::default())).collect(),
            sink,
            writer: TopicWriter::new(topics::VIDEO),
            counters,
        }
    }

    pub fn needs_flush(&self, stream_idx: u8) -> Result<bool, PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        Ok(lock(&self.slots[idx]).needs_flush)
    }

    fn append(&self, stream_idx: u8, data: &[u8], csd: bool) -> Result<(), PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        let mut slot = lock(&self.slots[idx]);
        if csd {
            slot.csd.extend_from_slice(data);
        } else {
            slot.idr.extend_from_slice(data);
        }
        slot.needs_flush = true;
        Ok(())
    }
}

impl<S: FrameSink> VideoChannel for DirectChannel<S> {
    fn begin_frame(&self, stream_idx: u8, frame_idx: u64) -> Result<(), PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        let mut slot = lock(&self.slots[idx]);
        slot.frame_idx = frame_idx;
        slot.csd.clear();
        slot.idr.clear();
        Ok(())
    }

    fn send_csd(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError> {
        self.append(stream_idx, &data, true)
    }

    fn send_idr(&self, stream_idx: u8, data: Bytes) -> Result<(), PumpError> {
        self.append(stream_idx, &data, false)
    }

    /// Write the stream's CSD followed by its IDR bytes as one video message.
    fn flush_stream(&self, stream_idx: u8, view_info: ViewInfo) -> Result<(), PumpError> {
        let idx = check_stream(stream_idx, self.slots.len())?;
        let (header, csd, idr) = {
            let mut slot = lock(&self.slots[idx]);
            if !slot.needs_flush {
                return Ok(());
            }
            slot.needs_flush = false;
            let csd = slot.csd.split().freeze();
            let idr = slot.idr.split().freeze();
            let header = DirectVideoHeader {
                stream_idx,
                frame_idx: slot.frame_idx,
                view_info,
                csd_len: csd.len() as u32,
                idr_len: idr.len() as u32,
            };
            (header, csd, idr)
        };

        let mut message =
            BytesMut::with_capacity(DirectVideoHeader::ENCODED_LEN + csd.len() + idr.len());
        header.encode(&mut message);
        message.extend_from_slice(&csd);
        message.extend_from_slice(&idr);

        for packet in self.writer.frame_all(&message)? {
            let len = packet.len() as u64;
            match self.sink.send_frame(packet) {
                Ok(()) => TransportCounters::add(&self.counters.bytes_sent, len),
                Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                Err(e) => {
                    TransportCounters::incr(&self.counters.send_failures);
                    warn!(stream_idx, error = %e, "direct video chunk dropped");
                }
            }
        }
        TransportCounters::incr(&self.counters.frames_sent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCollector;
    use crate::topic::{TopicFramer, MAX_TOPIC_PAYLOAD};
    use crate::wire::Pose;

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<StreamPacket>>,
    }

    impl ShardSink for RecordingSink {
        fn send_stream(&self, packet: &StreamPacket) -> Result<(), TransportError> {
            self.packets.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct BytesSink {
        frames: Mutex<Vec<Bytes>>,
    }

    impl FrameSink for BytesSink {
        fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct RefusingSink;

    impl ShardSink for RefusingSink {
        fn send_stream(&self, _packet: &StreamPacket) -> Result<(), TransportError> {
            Err(TransportError::Full)
        }
    }

    fn view(t: i64) -> ViewInfo {
        ViewInfo {
            display_time: t,
            pose: Pose::default(),
        }
    }

    fn pump<S: ShardSink>(sink: S, shard_payload_size: usize) -> StreamPump<S> {
        StreamPump::new(
            PumpConfig {
                shard_payload_size,
                ..PumpConfig::default()
            },
            sink,
            Arc::new(TransportCounters::new()),
        )
    }

    #[test]
    fn data_precedes_parity_in_shard_order() {
        let pump = pump(RecordingSink::default(), 1000);
        pump.push(0, 1, Bytes::from(vec![3u8; 45_000])).unwrap();
        let report = pump.finalize(0, view(5)).unwrap().unwrap();
        assert_eq!(report.data_shards, 45);
        assert_eq!(report.parity_shards, 3);
        assert!(report.protected);

        let packets = pump.sink().packets.lock().unwrap();
        assert_eq!(packets.len(), 48);
        for (i, p) in packets[..45].iter().enumerate() {
            match p {
                StreamPacket::Data(s) => assert_eq!(s.shard_idx as usize, i),
                other => panic!("expected data shard, got {other:?}"),
            }
        }
        assert!(packets[45..].iter().all(|p| matches!(p, StreamPacket::Parity(_))));
    }

    #[test]
    fn push_releases_with_one_shard_delay() {
        let pump = pump(RecordingSink::default(), 100);
        pump.push(1, 0, Bytes::from(vec![0u8; 300])).unwrap();
        assert_eq!(pump.sink().packets.lock().unwrap().len(), 2);
        assert!(pump.needs_flush(1).unwrap());
        pump.finalize(1, view(0)).unwrap();
        assert!(!pump.needs_flush(1).unwrap());
    }

    #[test]
    fn streams_are_independent() {
        let pump = pump(RecordingSink::default(), 100);
        pump.push(0, 7, Bytes::from(vec![0u8; 150])).unwrap();
        pump.push(2, 9, Bytes::from(vec![1u8; 150])).unwrap();
        let r0 = pump.finalize(0, view(0)).unwrap().unwrap();
        assert_eq!(r0.frame_idx, 7);
        assert!(pump.needs_flush(2).unwrap());
        let r2 = pump.finalize(2, view(0)).unwrap().unwrap();
        assert_eq!(r2.frame_idx, 9);
    }

    #[test]
    fn invalid_stream_is_rejected() {
        let pump = pump(RecordingSink::default(), 100);
        assert!(matches!(
            pump.push(3, 0, Bytes::from_static(b"x")),
            Err(PumpError::InvalidStream {
                stream_idx: 3,
                stream_count: 3
            })
        ));
    }

    #[test]
    fn finalize_without_push_is_none() {
        let pump = pump(RecordingSink::default(), 100);
        assert!(pump.finalize(0, view(0)).unwrap().is_none());
    }

    #[test]
    fn sink_failures_are_counted_not_fatal() {
        let pump = pump(RefusingSink, 100);
        pump.push(0, 0, Bytes::from(vec![0u8; 250])).unwrap();
        let report = pump.finalize(0, view(0)).unwrap().unwrap();
        assert_eq!(report.send_failures, 2);
        assert_eq!(pump.counters.snapshot().send_failures, 4);
    }

    #[test]
    fn pump_output_is_collectable() {
        let pump = pump(RecordingSink::default(), 512);
        pump.begin_frame(0, 11).unwrap();
        pump.send_csd(0, Bytes::from_static(b"csd!")).unwrap();
        pump.send_idr(0, Bytes::from(vec![0xAB; 4_000])).unwrap();
        pump.flush_stream(0, view(77)).unwrap();

        let mut collector = FrameCollector::default();
        let mut done = None;
        for p in pump.sink().packets.lock().unwrap().iter().cloned() {
            done = collector.ingest(p).or(done);
        }
        let frame = done.unwrap();
        assert_eq!(frame.frame_idx, 11);
        assert_eq!(&frame.payload[..4], b"csd!");
        assert_eq!(frame.payload.len(), 4_004);
        assert_eq!(frame.view_info.unwrap().display_time, 77);
    }

    #[test]
    fn direct_channel_writes_csd_before_idr() {
        let channel = DirectChannel::new(3, BytesSink::default(), Arc::new(TransportCounters::new()));
        channel.begin_frame(1, 42).unwrap();
        channel.send_idr(1, Bytes::from_static(b"IDRDATA")).unwrap();
        channel.send_csd(1, Bytes::from_static(b"CSD")).unwrap();
        assert!(channel.needs_flush(1).unwrap());
        channel.flush_stream(1, view(500)).unwrap();
        assert!(!channel.needs_flush(1).unwrap());

        let frames = channel.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let mut framer = TopicFramer::new();
        let topics_out = framer.push(&frames[0], 0);
        assert_eq!(topics_out.len(), 1);
        assert_eq!(topics_out[0].topic(), topics::VIDEO);

        let body = &topics_out[0].payload;
        let header = DirectVideoHeader::decode(body).unwrap();
        assert_eq!(header.frame_idx, 42);
        assert_eq!(header.csd_len, 3);
        assert_eq!(header.idr_len, 7);
        assert_eq!(header.view_info.display_time, 500);
        assert_eq!(&body[DirectVideoHeader::ENCODED_LEN..], b"CSDIDRDATA");
    }

    #[test]
    fn direct_channel_skips_idle_flush() {
        let channel = DirectChannel::new(3, BytesSink::default(), Arc::new(TransportCounters::new()));
        channel.flush_stream(0, view(0)).unwrap();
        assert!(channel.sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn direct_channel_splits_large_messages() {
        let channel = DirectChannel::new(1, BytesSink::default(), Arc::new(TransportCounters::new()));
        channel.send_idr(0, Bytes::from(vec![1u8; MAX_TOPIC_PAYLOAD + 10])).unwrap();
        channel.flush_stream(0, view(0)).unwrap();
        assert_eq!(channel.sink.frames.lock().unwrap().len(), 2);
    }
}
