//! Connection configuration.
//!
//! `TransportConfigInput` is the raw TOML shape with every field optional;
//! [`TransportConfigInput::resolve`] fills defaults and validates.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::codec::{FecPolicy, DEFAULT_MIN_PARITY, DEFAULT_PARITY_RATIO, MAX_PARITY_SHARDS};
use crate::error::ConfigError;
use crate::pump::{PumpConfig, DEFAULT_STREAM_COUNT};
use crate::segment::DEFAULT_SEGMENT_CEILING;
use crate::wire::{DEFAULT_MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE_LIMIT, VIEW_INFO_SIZE};

pub const DEFAULT_ECHO_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Which [`VideoChannel`](crate::pump::VideoChannel) a connection hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelKind {
    /// Sharded, FEC-protected stream packets.
    #[default]
    Packetized,
    /// Whole frames as topic messages, for links that guarantee delivery.
    Direct,
}

impl ChannelKind {
    fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "packetized" => Ok(ChannelKind::Packetized),
            "direct" => Ok(ChannelKind::Direct),
            _ => Err(ConfigError::ChannelKind(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub max_payload_size: Option<usize>,
    pub shard_payload_size: Option<usize>,
    pub parity_ratio: Option<f64>,
    pub min_parity: Option<usize>,
    pub stream_count: Option<usize>,
    pub segment_capacity_ceiling: Option<usize>,
    pub echo_interval_ms: Option<u64>,
    pub outbound_queue_depth: Option<usize>,
    pub read_timeout_ms: Option<u64>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub max_payload_size: usize,
    pub shard_payload_size: usize,
    pub fec: FecPolicy,
    pub stream_count: usize,
    pub segment_capacity_ceiling: usize,
    pub echo_interval: Duration,
    pub outbound_queue_depth: usize,
    pub read_timeout: Duration,
    pub channel: ChannelKind,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            shard_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            fec: FecPolicy::default(),
            stream_count: DEFAULT_STREAM_COUNT,
            segment_capacity_ceiling: DEFAULT_SEGMENT_CEILING,
            echo_interval: DEFAULT_ECHO_INTERVAL,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            read_timeout: DEFAULT_READ_TIMEOUT,
            channel: ChannelKind::default(),
        }
    }
}

fn non_zero<T: Default + PartialEq>(value: T, field: &'static str) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Zero { field });
    }
    Ok(value)
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, ConfigError> {
        let max_payload_size = self.max_payload_size.unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE);
        non_zero(max_payload_size, "max_payload_size")?;
        // The last shard of a frame must be able to carry view info plus data.
        let min = VIEW_INFO_SIZE + 1;
        if max_payload_size < min {
            return Err(ConfigError::PayloadTooSmall {
                min,
                actual: max_payload_size,
            });
        }
        // Parity length fields are 16-bit and cover header, view info and data.
        if max_payload_size > MAX_PAYLOAD_SIZE_LIMIT {
            return Err(ConfigError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE_LIMIT,
                actual: max_payload_size,
            });
        }

        let shard_payload_size = non_zero(
            self.shard_payload_size.unwrap_or(max_payload_size),
            "shard_payload_size",
        )?;
        if shard_payload_size > max_payload_size {
            return Err(ConfigError::ShardPayload {
                shard: shard_payload_size,
                max: max_payload_size,
            });
        }

        let parity_ratio = self.parity_ratio.unwrap_or(DEFAULT_PARITY_RATIO);
        if !(parity_ratio > 0.0 && parity_ratio <= 1.0) {
            return Err(ConfigError::ParityRatio(parity_ratio));
        }

        let min_parity = self.min_parity.unwrap_or(DEFAULT_MIN_PARITY);
        if min_parity > MAX_PARITY_SHARDS {
            return Err(ConfigError::MinParity {
                max: MAX_PARITY_SHARDS,
                actual: min_parity,
            });
        }

        let stream_count = self.stream_count.unwrap_or(DEFAULT_STREAM_COUNT);
        if stream_count == 0 || stream_count > u8::MAX as usize {
            return Err(ConfigError::StreamCount(stream_count));
        }

        let channel = match self.channel.as_deref() {
            Some(name) => ChannelKind::parse(name)?,
            None => ChannelKind::default(),
        };

        Ok(TransportConfig {
            max_payload_size,
            shard_payload_size,
            fec: FecPolicy {
                parity_ratio,
                min_parity,
            },
            stream_count,
            segment_capacity_ceiling: non_zero(
                self.segment_capacity_ceiling.unwrap_or(DEFAULT_SEGMENT_CEILING),
                "segment_capacity_ceiling",
            )?,
            echo_interval: Duration::from_millis(non_zero(
                self.echo_interval_ms
                    .unwrap_or(DEFAULT_ECHO_INTERVAL.as_millis() as u64),
                "echo_interval_ms",
            )?),
            outbound_queue_depth: non_zero(
                self.outbound_queue_depth.unwrap_or(DEFAULT_OUTBOUND_QUEUE_DEPTH),
                "outbound_queue_depth",
            )?,
            read_timeout: Duration::from_millis(non_zero(
                self.read_timeout_ms
                    .unwrap_or(DEFAULT_READ_TIMEOUT.as_millis() as u64),
                "read_timeout_ms",
            )?),
            channel,
        })
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input).context("invalid config TOML")?;
        Ok(parsed.resolve()?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in config {}", path.display()))
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            max_payload_size: self.max_payload_size,
            shard_payload_size: self.shard_payload_size,
            fec: self.fec,
            stream_count: self.stream_count,
        }
    }
}
