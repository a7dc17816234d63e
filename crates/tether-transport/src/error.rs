//! # Error Taxonomy
//!
//! One enum per failure domain. None of these are fatal to the process: the
//! caller either recovers locally (drop, reset, degrade) or decides at the
//! connection layer whether to reconnect.

use thiserror::Error;

/// Malformed or undersized wire data. The offending packet is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("packet too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("unknown stream packet kind {0:#04x}")]
    UnknownKind(u8),
    #[error("declared length {declared} exceeds the {available} bytes available")]
    LengthMismatch { declared: usize, available: usize },
    #[error("alignment padding of {padding} bytes is invalid for a {payload_len}-byte payload")]
    BadPadding { padding: usize, payload_len: usize },
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Segment reassembly failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Growing the segment buffer would pass the configured ceiling.
    #[error("channel {channel}: segment of {requested} bytes exceeds capacity ceiling of {ceiling}")]
    Capacity {
        channel: usize,
        requested: usize,
        ceiling: usize,
    },
    /// More bytes were fed than the segment expects; upstream framing is out of sync.
    #[error("channel {channel}: {excess} bytes fed past expected length {expected}")]
    Overrun {
        channel: usize,
        expected: usize,
        excess: usize,
    },
    #[error("channel {channel} has no segment in progress")]
    NotAccumulating { channel: usize },
    #[error("segment channel index {0} out of range")]
    InvalidChannel(usize),
}

/// Forward error correction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FecError {
    /// The erasure coder cannot be built for these dimensions. Frames are sent
    /// unprotected.
    #[error("erasure coder unavailable for {data} data / {parity} parity shards: {reason}")]
    Unavailable {
        data: usize,
        parity: usize,
        reason: String,
    },
    /// Too many rows were lost to rebuild the frame.
    #[error("irrecoverable frame: {available} of {needed} required shards survived")]
    Irrecoverable { needed: usize, available: usize },
    #[error("shard rows have inconsistent lengths")]
    ShardSizeMismatch,
    #[error("erasure decode failed: {0}")]
    Codec(String),
}

/// Errors surfaced by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("receive timed out")]
    TimedOut,
    #[error("outbound queue full")]
    Full,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the stream pump and the video channel variants.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("stream index {stream_idx} out of range (have {stream_count} streams)")]
    InvalidStream { stream_idx: u8, stream_count: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_payload_size must be at least {min} bytes, got {actual}")]
    PayloadTooSmall { min: usize, actual: usize },
    #[error("max_payload_size {actual} exceeds the FEC row limit of {max} bytes")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("shard_payload_size {shard} exceeds max_payload_size {max}")]
    ShardPayload { shard: usize, max: usize },
    #[error("parity_ratio must be in (0, 1], got {0}")]
    ParityRatio(f64),
    #[error("min_parity must be at most {max}, got {actual}")]
    MinParity { max: usize, actual: usize },
    #[error("stream_count must be between 1 and 255, got {0}")]
    StreamCount(usize),
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("unknown channel kind '{0}' (expected \"packetized\" or \"direct\")")]
    ChannelKind(String),
}
