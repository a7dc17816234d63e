//! # FEC Codec Engine: Systematic Reed-Solomon
//!
//! Block FEC over one frame: the frame's serialized data shards are the
//! original rows, sent as-is, and the parity shards are recovery rows appended
//! after them. Any `k` of the `k + p` rows rebuild the frame.
//!
//! ## Policy
//!
//! `p = max(min_parity, ceil(parity_ratio * k))`, with defaults of 5% and at
//! least one parity row. The ratio is a fixed policy knob; there is no loss
//! feedback loop.
//!
//! ## Row Layout
//!
//! Rows are the full wire encoding of each data shard, zero-padded to the
//! longest one and rounded up to an even length (the SIMD backend works on
//! 16-bit symbols). The shard's own `payload_len` field lets the receiver strip
//! the padding again.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::FecError;
use crate::wire::{DataShard, ParityShard, StreamPacket, ViewInfo};

pub const DEFAULT_PARITY_RATIO: f64 = 0.05;
pub const DEFAULT_MIN_PARITY: usize = 1;

/// Upper bound on recovery rows per frame accepted from configuration.
pub const MAX_PARITY_SHARDS: usize = 32_768;

/// Longest row a parity shard's 16-bit length field can describe.
const MAX_ROW_LEN: usize = u16::MAX as usize;

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FecPolicy {
    pub parity_ratio: f64,
    pub min_parity: usize,
}

impl FecPolicy {
    /// Parity rows for a frame of `data_shards` rows.
    pub fn parity_count(&self, data_shards: usize) -> usize {
        // Absorb float error so that e.g. 0.05 * 60 stays 3.
        let scaled = (self.parity_ratio * data_shards as f64 - 1e-9).ceil();
        (scaled.max(0.0) as usize).max(self.min_parity)
    }
}

impl Default for FecPolicy {
    fn default() -> Self {
        FecPolicy {
            parity_ratio: DEFAULT_PARITY_RATIO,
            min_parity: DEFAULT_MIN_PARITY,
        }
    }
}

fn serialize_shard(shard: &DataShard) -> BytesMut {
    let mut buf = BytesMut::with_capacity(shard.encoded_len());
    shard.encode(&mut buf);
    buf
}

// ─── FEC Encoder ─────────────────────────────────────────────────────────────

pub struct FecEncoder {
    policy: FecPolicy,
}

impl FecEncoder {
    pub fn new(policy: FecPolicy) -> Self {
        FecEncoder { policy }
    }

    pub fn policy(&self) -> FecPolicy {
        self.policy
    }

    /// Compute the parity shards for one frame.
    ///
    /// `shards` must be the frame's complete data shard list in `shard_idx`
    /// order. An empty list yields no parity.
    pub fn finalize(&self, shards: &[DataShard]) -> Result<Vec<ParityShard>, FecError> {
        let Some(first) = shards.first() else {
            return Ok(Vec::new());
        };
        let k = shards.len();
        let p = self.policy.parity_count(k);

        let mut rows: Vec<BytesMut> = shards.iter().map(serialize_shard).collect();
        let max_len = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let row_len = max_len.next_multiple_of(2);
        if row_len > MAX_ROW_LEN {
            return Err(FecError::Unavailable {
                data: k,
                parity: p,
                reason: format!("row length {row_len} exceeds {MAX_ROW_LEN}"),
            });
        }
        for row in &mut rows {
            row.resize(row_len, 0);
        }

        let recovery = reed_solomon_simd::encode(k, p, rows.iter()).map_err(|e| {
            FecError::Unavailable {
                data: k,
                parity: p,
                reason: e.to_string(),
            }
        })?;

        Ok(recovery
            .into_iter()
            .enumerate()
            .map(|(i, payload)| ParityShard {
                stream_idx: first.stream_idx,
                frame_idx: first.frame_idx,
                data_shard_count: k as u32,
                parity_count: p as u32,
                parity_idx: i as u32,
                payload: Bytes::from(payload),
            })
            .collect())
    }
}

impl Default for FecEncoder {
    fn default() -> Self {
        Self::new(FecPolicy::default())
    }
}

// ─── FEC Decoder ─────────────────────────────────────────────────────────────

pub struct FecDecoder;

impl FecDecoder {
    /// Rebuild all `data_shard_count` rows of a frame from the surviving data
    /// rows and parity rows, each tagged with its row index.
    ///
    /// Data rows may be unpadded; they are padded to the parity row length.
    /// Fails with [`FecError::Irrecoverable`] when fewer than
    /// `data_shard_count` distinct rows survive. Never returns partial data.
    pub fn reconstruct(
        data_shard_count: usize,
        parity_count: usize,
        data: &[(u32, Bytes)],
        parity: &[(u32, Bytes)],
    ) -> Result<Vec<Bytes>, FecError> {
        let data: HashMap<usize, &Bytes> = data
            .iter()
            .filter(|(i, _)| (*i as usize) < data_shard_count)
            .map(|(i, b)| (*i as usize, b))
            .collect();
        let parity: HashMap<usize, &Bytes> = parity
            .iter()
            .filter(|(i, _)| (*i as usize) < parity_count)
            .map(|(i, b)| (*i as usize, b))
            .collect();

        let available = data.len() + parity.len();
        if available < data_shard_count {
            return Err(FecError::Irrecoverable {
                needed: data_shard_count,
                available,
            });
        }

        if data.len() == data_shard_count {
            return Ok((0..data_shard_count)
                .filter_map(|i| data.get(&i).map(|b| (*b).clone()))
                .collect());
        }

        let row_len = match parity.values().next() {
            Some(b) => b.len(),
            None => return Err(FecError::ShardSizeMismatch),
        };
        if parity.values().any(|b| b.len() != row_len) || data.values().any(|b| b.len() > row_len) {
            return Err(FecError::ShardSizeMismatch);
        }

        let padded: HashMap<usize, Bytes> = data
            .iter()
            .map(|(i, b)| {
                if b.len() == row_len {
                    (*i, (*b).clone())
                } else {
                    let mut row = BytesMut::with_capacity(row_len);
                    row.extend_from_slice(b);
                    row.resize(row_len, 0);
                    (*i, row.freeze())
                }
            })
            .collect();

        let mut restored = reed_solomon_simd::decode(
            data_shard_count,
            parity_count,
            padded.iter().map(|(i, b)| (*i, b)),
            parity.iter().map(|(i, b)| (*i, *b)),
        )
        .map_err(|e| FecError::Codec(e.to_string()))?;

        let mut rows = Vec::with_capacity(data_shard_count);
        for i in 0..data_shard_count {
            let row = match padded.get(&i) {
                Some(b) => b.clone(),
                None => match restored.remove(&i) {
                    Some(v) => Bytes::from(v),
                    None => return Err(FecError::Codec(format!("row {i} was not restored"))),
                },
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

// ─── Frame Collector ─────────────────────────────────────────────────────────

/// A frame rebuilt on the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFrame {
    pub stream_idx: u8,
    pub frame_idx: u64,
    pub view_info: Option<ViewInfo>,
    /// Concatenated shard payloads.
    pub payload: Bytes,
    pub shard_count: u32,
    /// How many data shards came from parity.
    pub recovered: usize,
}

#[derive(Default)]
struct PendingFrame {
    data: BTreeMap<u32, DataShard>,
    parity: BTreeMap<u32, Bytes>,
    data_shard_count: Option<u32>,
    parity_count: Option<u32>,
}

impl PendingFrame {
    fn ready(&self) -> bool {
        let Some(k) = self.data_shard_count else {
            return false;
        };
        let k = k as usize;
        self.data.len() >= k || (self.parity_count.is_some() && self.data.len() + self.parity.len() >= k)
    }
}

/// Collects stream packets into frames, using parity to fill gaps.
pub struct FrameCollector {
    pending: HashMap<(u8, u64), PendingFrame>,
    /// Highest finished frame per stream; older packets are ignored.
    last_done: HashMap<u8, u64>,
    max_pending_frames: usize,
}

impl FrameCollector {
    pub fn new(max_pending_frames: usize) -> Self {
        FrameCollector {
            pending: HashMap::new(),
            last_done: HashMap::new(),
            max_pending_frames: max_pending_frames.max(1),
        }
    }

    /// Feed one packet. Returns the frame once all its data shards are
    /// present or recoverable.
    pub fn ingest(&mut self, packet: StreamPacket) -> Option<CompletedFrame> {
        let key = (packet.stream_idx(), packet.frame_idx());
        if self.last_done.get(&key.0).is_some_and(|&done| key.1 <= done) {
            return None;
        }

        let frame = self.pending.entry(key).or_default();
        match packet {
            StreamPacket::Data(shard) => {
                if shard.is_end_of_frame() {
                    frame.data_shard_count = Some(shard.shard_idx.saturating_add(1));
                }
                frame.data.insert(shard.shard_idx, shard);
            }
            StreamPacket::Parity(p) => {
                frame.data_shard_count = Some(p.data_shard_count);
                frame.parity_count = Some(p.parity_count);
                frame.parity.insert(p.parity_idx, p.payload);
            }
        }

        if !frame.ready() {
            self.enforce_limit();
            return None;
        }

        match self.try_complete(key.0, key.1) {
            Ok(done) => Some(done),
            Err(e) => {
                warn!(stream_idx = key.0, frame_idx = key.1, error = %e, "dropping undecodable frame");
                None
            }
        }
    }

    /// Assemble a frame from whatever has arrived, consuming its state.
    ///
    /// Fails with [`FecError::Irrecoverable`] if too many rows are missing.
    pub fn try_complete(&mut self, stream_idx: u8, frame_idx: u64) -> Result<CompletedFrame, FecError> {
        let frame = self.pending.remove(&(stream_idx, frame_idx)).unwrap_or_default();
        self.mark_done(stream_idx, frame_idx);

        let k = match frame.data_shard_count {
            Some(k) => k as usize,
            None => {
                let seen = frame.data.keys().next_back().map_or(0, |i| *i as usize + 1);
                return Err(FecError::Irrecoverable {
                    needed: seen.max(1),
                    available: frame.data.len(),
                });
            }
        };
        let p = frame.parity_count.unwrap_or(0) as usize;

        let present: Vec<u32> = frame.data.keys().copied().filter(|i| (*i as usize) < k).collect();
        let mut shards: Vec<DataShard> = if present.len() == k {
            frame.data.into_values().take(k).collect()
        } else {
            let data_rows: Vec<(u32, Bytes)> = frame
                .data
                .iter()
                .map(|(i, s)| (*i, serialize_shard(s).freeze()))
                .collect();
            let parity_rows: Vec<(u32, Bytes)> = frame.parity.into_iter().collect();
            let rows = FecDecoder::reconstruct(k, p, &data_rows, &parity_rows)?;

            let mut shards = Vec::with_capacity(k);
            for (i, row) in rows.into_iter().enumerate() {
                match frame.data.get(&(i as u32)) {
                    Some(s) => shards.push(s.clone()),
                    None => match StreamPacket::decode(row) {
                        Ok(StreamPacket::Data(s)) => shards.push(s),
                        Ok(StreamPacket::Parity(_)) | Err(_) => {
                            return Err(FecError::Codec(format!("recovered row {i} is not a data shard")))
                        }
                    },
                }
            }
            shards
        };
        shards.sort_by_key(|s| s.shard_idx);

        let recovered = k - present.len();
        let total: usize = shards.iter().map(|s| s.payload.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for s in &shards {
            payload.extend_from_slice(&s.payload);
        }
        let view_info = shards.last().and_then(|s| s.view_info);

        if recovered > 0 {
            debug!(stream_idx, frame_idx, recovered, "frame rebuilt from parity");
        }

        Ok(CompletedFrame {
            stream_idx,
            frame_idx,
            view_info,
            payload: payload.freeze(),
            shard_count: k as u32,
            recovered,
        })
    }

    /// Frames still waiting on packets.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    fn mark_done(&mut self, stream_idx: u8, frame_idx: u64) {
        let done = self.last_done.entry(stream_idx).or_insert(frame_idx);
        *done = (*done).max(frame_idx);
        self.pending
            .retain(|(s, f), _| *s != stream_idx || *f > frame_idx);
    }

    fn enforce_limit(&mut self) {
        while self.pending.len() > self.max_pending_frames {
            let Some(&oldest) = self.pending.keys().min_by_key(|(_, f)| *f) else {
                break;
            };
            warn!(stream_idx = oldest.0, frame_idx = oldest.1, "evicting incomplete frame");
            self.pending.remove(&oldest);
        }
    }
}

impl Default for FrameCollector {
    fn default() -> Self {
        Self::new(16)
    }
}
