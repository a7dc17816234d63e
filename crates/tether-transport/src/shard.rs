//! # Frame Sharding
//!
//! Splits an encoded frame into network-sized [`DataShard`]s. Each `push` is
//! one slice: its first shard carries `START_OF_SLICE`, its last
//! `END_OF_SLICE`. The newest shard is always held back by one step so that
//! `finish_frame` can still attach the frame's [`ViewInfo`] and
//! `END_OF_FRAME` to it before it leaves.
//!
//! Pure logic, no I/O. Released shards are returned to the caller.

use bytes::Bytes;
use tracing::warn;

use crate::wire::{DataShard, ShardFlags, ViewInfo, VIEW_INFO_SIZE};

/// Result of closing a frame.
#[derive(Debug, Clone)]
pub struct FinishedFrame {
    pub stream_idx: u8,
    pub frame_idx: u64,
    /// Shards released by the close itself, in `shard_idx` order.
    pub released: Vec<DataShard>,
    /// Every data shard of the frame, in `shard_idx` order.
    pub shards: Vec<DataShard>,
}

pub struct FrameSharder {
    frame: Option<(u64, u8)>,
    next_shard_idx: u32,
    pending: Option<DataShard>,
    /// Shards of the open frame that were already released.
    sent: Vec<DataShard>,
}

impl FrameSharder {
    pub fn new() -> Self {
        FrameSharder {
            frame: None,
            next_shard_idx: 0,
            pending: None,
            sent: Vec::new(),
        }
    }

    /// Append one slice to frame `frame_idx`, split into chunks of at most
    /// `max_payload` bytes. Returns the shards that are now final.
    ///
    /// Opening a different frame while one is in progress abandons the old
    /// frame; its held-back shard is released unchanged.
    pub fn push(
        &mut self,
        frame_idx: u64,
        stream_idx: u8,
        bytes: Bytes,
        max_payload: usize,
    ) -> Vec<DataShard> {
        let mut released = Vec::new();

        match self.frame {
            Some(open) if open != (frame_idx, stream_idx) => {
                warn!(
                    stream_idx = open.1,
                    frame_idx = open.0,
                    next_frame_idx = frame_idx,
                    "frame abandoned before finish"
                );
                released.extend(self.pending.take());
                self.clear();
                self.frame = Some((frame_idx, stream_idx));
            }
            Some(_) => {}
            None => self.frame = Some((frame_idx, stream_idx)),
        }

        if bytes.is_empty() {
            return released;
        }

        let max_payload = max_payload.max(1);
        let chunks = bytes.len().div_ceil(max_payload);
        for i in 0..chunks {
            let start = i * max_payload;
            let end = (start + max_payload).min(bytes.len());

            let mut flags = ShardFlags::empty();
            if i == 0 {
                flags |= ShardFlags::START_OF_SLICE;
            }
            if i + 1 == chunks {
                flags |= ShardFlags::END_OF_SLICE;
            }

            self.hold(
                DataShard {
                    stream_idx,
                    frame_idx,
                    shard_idx: 0,
                    flags,
                    view_info: None,
                    payload: bytes.slice(start..end),
                },
                &mut released,
            );
        }

        released
    }

    /// Close the open frame: attach `view_info` and `END_OF_FRAME` to its
    /// last shard and release it.
    ///
    /// When the last shard has no room left for the view info under
    /// `max_payload`, an empty `START_OF_SLICE | END_OF_SLICE` shard is
    /// appended to carry it. Returns `None` if the frame has no shards.
    pub fn finish_frame(&mut self, view_info: ViewInfo, max_payload: usize) -> Option<FinishedFrame> {
        let (frame_idx, stream_idx) = self.frame?;
        let mut released = Vec::new();

        let needs_carrier = match &self.pending {
            Some(last) => last.payload.len() + VIEW_INFO_SIZE > max_payload,
            None => {
                self.clear();
                return None;
            }
        };
        if needs_carrier {
            self.hold(
                DataShard {
                    stream_idx,
                    frame_idx,
                    shard_idx: 0,
                    flags: ShardFlags::START_OF_SLICE | ShardFlags::END_OF_SLICE,
                    view_info: None,
                    payload: Bytes::new(),
                },
                &mut released,
            );
        }

        if let Some(mut last) = self.pending.take() {
            last.view_info = Some(view_info);
            last.flags |= ShardFlags::END_OF_FRAME;
            self.sent.push(last.clone());
            released.push(last);
        }

        let shards = std::mem::take(&mut self.sent);
        self.clear();
        Some(FinishedFrame {
            stream_idx,
            frame_idx,
            released,
            shards,
        })
    }

    /// Whether a frame is open.
    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// Number of shards produced so far for the open frame.
    pub fn shard_count(&self) -> u32 {
        self.next_shard_idx
    }

    fn hold(&mut self, mut shard: DataShard, released: &mut Vec<DataShard>) {
        shard.shard_idx = self.next_shard_idx;
        self.next_shard_idx += 1;
        if let Some(prev) = self.pending.replace(shard) {
            self.sent.push(prev.clone());
            released.push(prev);
        }
    }

    fn clear(&mut self) {
        self.frame = None;
        self.next_shard_idx = 0;
        self.pending = None;
        self.sent.clear();
    }
}

impl Default for FrameSharder {
    fn default() -> Self {
        Self::new()
    }
}
