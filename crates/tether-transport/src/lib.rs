//! # tether-transport
//!
//! Streaming transport engine for a head-mounted display link.
//!
//! Encoded video frames are split into MTU-sized shards, protected with
//! systematic Reed-Solomon parity and paced out per sub-stream. The inbound
//! side reassembles topic-framed device traffic, rebuilds segmented tracking
//! messages and runs an echo exchange that keeps host and device clocks
//! aligned.
//!
//! ## Crate structure
//!
//! - [`wire`]: hostinfo, echo, capnp segment and stream shard layouts
//! - [`topic`]: topic packet framing over the byte stream
//! - [`segment`]: three-channel segment reassembly
//! - [`clock`]: echo clock sync and device timestamp extension
//! - [`shard`]: frame sharding with slice and frame markers
//! - [`codec`]: Reed-Solomon parity encode and frame recovery
//! - [`pump`]: per-stream frame pump and the video channel variants
//! - [`transport`]: datagram transports and the outbound queue
//! - [`receiver`]: inbound topic dispatch
//! - [`session`]: connection threads and teardown
//! - [`config`]: TOML configuration
//! - [`stats`]: shared counters

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod pump;
pub mod receiver;
pub mod segment;
pub mod session;
pub mod shard;
pub mod stats;
pub mod topic;
pub mod transport;
pub mod wire;

pub use clock::ClockSync;
pub use codec::{FecEncoder, FrameCollector};
pub use config::{ChannelKind, TransportConfig};
pub use error::{ConfigError, FecError, FramingError, PumpError, SegmentError, TransportError};
pub use pump::{DirectChannel, StreamPump, VideoChannel};
pub use receiver::Handlers;
pub use segment::{SegmentChannel, SegmentReassembler};
pub use session::Connection;
pub use shard::FrameSharder;
pub use transport::{LoopbackTransport, Transport, UdpTransport};
pub use wire::{StreamPacket, ViewInfo};
