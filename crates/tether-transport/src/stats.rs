//! # Transport Statistics
//!
//! Lock-free counters shared by every thread of a connection, and a
//! serialisable snapshot for logging or JSON export.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── Counters ────────────────────────────────────────────────────────────────

/// Live counters. Share via `Arc`; all updates are relaxed.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub frames_sent: AtomicU64,
    pub data_shards_sent: AtomicU64,
    pub parity_shards_sent: AtomicU64,
    /// Frames sent without parity because the erasure coder was unavailable.
    pub unprotected_frames: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub topic_packets: AtomicU64,
    pub framing_errors: AtomicU64,
    pub segments_completed: AtomicU64,
    pub segment_overruns: AtomicU64,
    pub segment_capacity_errors: AtomicU64,
    pub echoes_settled: AtomicU64,
    pub echoes_stale: AtomicU64,
    pub pings_answered: AtomicU64,
    pub control_messages: AtomicU64,
}

impl TransportCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransportStats {
            frames_sent: get(&self.frames_sent),
            data_shards_sent: get(&self.data_shards_sent),
            parity_shards_sent: get(&self.parity_shards_sent),
            unprotected_frames: get(&self.unprotected_frames),
            bytes_sent: get(&self.bytes_sent),
            send_failures: get(&self.send_failures),
            topic_packets: get(&self.topic_packets),
            framing_errors: get(&self.framing_errors),
            segments_completed: get(&self.segments_completed),
            segment_overruns: get(&self.segment_overruns),
            segment_capacity_errors: get(&self.segment_capacity_errors),
            echoes_settled: get(&self.echoes_settled),
            echoes_stale: get(&self.echoes_stale),
            pings_answered: get(&self.pings_answered),
            control_messages: get(&self.control_messages),
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Point-in-time copy of [`TransportCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub data_shards_sent: u64,
    pub parity_shards_sent: u64,
    pub unprotected_frames: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub topic_packets: u64,
    pub framing_errors: u64,
    pub segments_completed: u64,
    pub segment_overruns: u64,
    pub segment_capacity_errors: u64,
    pub echoes_settled: u64,
    pub echoes_stale: u64,
    pub pings_answered: u64,
    pub control_messages: u64,
}

impl TransportStats {
    /// Parity shards per data shard actually sent.
    pub fn fec_overhead(&self) -> f64 {
        if self.data_shards_sent == 0 {
            0.0
        } else {
            self.parity_shards_sent as f64 / self.data_shards_sent as f64
        }
    }
}
