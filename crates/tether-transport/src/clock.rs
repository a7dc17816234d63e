//! # Clock Synchronisation
//!
//! Four-timestamp echo exchange between host and device, plus extension of
//! the device's wrapping 32-bit microsecond counter into 64-bit nanoseconds
//! on the local timeline.
//!
//! ```text
//!  host                         device
//!   │── ping (id, org) ───────────▶│ recv
//!   │                              │ xmt
//!   │◀──────────── pong (id) ──────│
//!  now
//!
//!  rtt    = (now - org) - (xmt - recv)
//!  offset = ((recv - org) + (xmt - now)) / 2      (device minus local)
//! ```
//!
//! Pure logic, no I/O. The session's clock thread calls [`ClockSync::send_echo`]
//! and the reader thread feeds replies to [`ClockSync::on_echo_reply`].

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace, warn};

use crate::error::FramingError;
use crate::wire::{encode_echo, EchoPayload, HostInfoPacket, ECHO_PING, ECHO_PONG};

/// One full turn of the 32-bit microsecond counter, in nanoseconds.
const WRAP_NS: i64 = (1i64 << 32) * 1_000;
const HALF_RANGE_US: u32 = 1 << 31;

// ─── Monotonic Clock ─────────────────────────────────────────────────────────

/// Local monotonic nanosecond clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since this clock was created.
    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Echo Messages ───────────────────────────────────────────────────────────

/// An echo ping we sent and are waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub id: u32,
    pub org: i64,
    /// Offset estimate advertised to the device.
    pub offset: i64,
}

impl EchoRequest {
    pub fn encode(&self) -> Bytes {
        encode_echo(
            ECHO_PING,
            self.id,
            &EchoPayload {
                org: self.org,
                recv: 0,
                xmt: self.org,
                offset: self.offset,
            },
        )
    }
}

/// The device's answer to one of our pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub id: u32,
    pub org: i64,
    pub recv: i64,
    pub xmt: i64,
}

impl EchoReply {
    pub fn from_packet(pkt: &HostInfoPacket) -> Result<Self, FramingError> {
        let body = EchoPayload::decode(&pkt.payload)?;
        Ok(EchoReply {
            id: pkt.aux,
            org: body.org,
            recv: body.recv,
            xmt: body.xmt,
        })
    }
}

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoSample {
    pub org: i64,
    pub recv: i64,
    pub xmt: i64,
    pub offset: i64,
    pub rtt: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// Id mismatch, nothing outstanding or out-of-range timestamps; the reply
    /// was ignored.
    Stale,
    Settled(EchoSample),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    Idle,
    EchoSent,
    Settled,
}

/// Snapshot of the synchronisation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    pub ns_offset: i64,
    pub last_echo_sent_ns: i64,
    pub last_echo_recv_ns: i64,
    pub last_xmt: i64,
    pub last_rtt_ns: i64,
}

// ─── RTT Estimator ───────────────────────────────────────────────────────────

/// RFC 6298 smoothed round-trip estimate, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ns: f64,
    rttvar_ns: f64,
    min_rtt_ns: i64,
    sample_count: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt_ns: 0.0,
            rttvar_ns: 0.0,
            min_rtt_ns: i64::MAX,
            sample_count: 0,
        }
    }

    pub fn update(&mut self, rtt_ns: i64) {
        let rtt = rtt_ns as f64;
        self.sample_count += 1;
        self.min_rtt_ns = self.min_rtt_ns.min(rtt_ns);

        if self.sample_count == 1 {
            self.srtt_ns = rtt;
            self.rttvar_ns = rtt / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_ns = 0.75 * self.rttvar_ns + 0.25 * (self.srtt_ns - rtt).abs();
            self.srtt_ns = 0.875 * self.srtt_ns + 0.125 * rtt;
        }
    }

    pub fn srtt_ns(&self) -> f64 {
        self.srtt_ns
    }

    pub fn rttvar_ns(&self) -> f64 {
        self.rttvar_ns
    }

    /// `None` until the first sample.
    pub fn min_rtt_ns(&self) -> Option<i64> {
        (self.sample_count > 0).then_some(self.min_rtt_ns)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── ClockSync ───────────────────────────────────────────────────────────────

pub struct ClockSync {
    echo_id: u32,
    outstanding: Option<EchoRequest>,
    phase: ClockPhase,
    state: ClockState,
    rtt: RttEstimator,
}

impl ClockSync {
    pub fn new() -> Self {
        ClockSync {
            echo_id: 0,
            outstanding: None,
            phase: ClockPhase::Idle,
            state: ClockState::default(),
            rtt: RttEstimator::new(),
        }
    }

    /// Start an exchange. Any exchange still outstanding is abandoned.
    pub fn send_echo(&mut self, now_ns: i64) -> EchoRequest {
        self.echo_id = self.echo_id.wrapping_add(1);
        if let Some(prev) = self.outstanding {
            trace!(echo_id = prev.id, "abandoning unanswered echo");
        }
        let req = EchoRequest {
            id: self.echo_id,
            org: now_ns,
            offset: self.state.ns_offset,
        };
        self.outstanding = Some(req);
        self.state.last_echo_sent_ns = now_ns;
        self.phase = ClockPhase::EchoSent;
        req
    }

    /// Match a reply against the last ping and update the offset.
    pub fn on_echo_reply(&mut self, reply: &EchoReply, now_ns: i64) -> EchoOutcome {
        let req = match self.outstanding {
            Some(req) if req.id == reply.id => req,
            _ => {
                trace!(echo_id = reply.id, expected = self.echo_id, "stale echo reply");
                return EchoOutcome::Stale;
            }
        };
        self.outstanding = None;

        let org = req.org;
        let Some((offset, rtt)) = echo_offset_rtt(org, reply.recv, reply.xmt, now_ns) else {
            warn!(
                echo_id = reply.id,
                recv = reply.recv,
                xmt = reply.xmt,
                "echo reply timestamps out of range, sample dropped"
            );
            return EchoOutcome::Stale;
        };

        self.state.ns_offset = offset;
        self.state.last_echo_recv_ns = now_ns;
        self.state.last_xmt = reply.xmt;
        self.state.last_rtt_ns = rtt;
        self.rtt.update(rtt);
        self.phase = ClockPhase::Settled;

        debug!(echo_id = reply.id, offset_ns = offset, rtt_ns = rtt, "clock offset settled");

        EchoOutcome::Settled(EchoSample {
            org,
            recv: reply.recv,
            xmt: reply.xmt,
            offset,
            rtt,
        })
    }

    /// Build the pong for a ping the device sent us.
    pub fn answer_ping(
        &self,
        ping_id: u32,
        ping: &EchoPayload,
        recv_ns: i64,
        now_ns: i64,
    ) -> (u32, EchoPayload) {
        (
            ping_id,
            EchoPayload {
                org: ping.xmt,
                recv: recv_ns,
                xmt: now_ns,
                offset: self.state.ns_offset,
            },
        )
    }

    /// Encoded pong for a device ping.
    pub fn encode_pong(&self, ping_id: u32, ping: &EchoPayload, recv_ns: i64, now_ns: i64) -> Bytes {
        let (id, body) = self.answer_ping(ping_id, ping, recv_ns, now_ns);
        encode_echo(ECHO_PONG, id, &body)
    }

    /// Extend a 32-bit device microsecond timestamp to 64-bit nanoseconds and
    /// map it onto the local timeline.
    ///
    /// `last_ts32` / `last_ts_ns` are the previous raw sample and its extended
    /// device-time value. Pure: the same inputs always give the same output.
    pub fn extend_device_timestamp(&self, ts32_us: u32, last_ts32: u32, last_ts_ns: i64) -> i64 {
        extend_device_ns(ts32_us, last_ts32, last_ts_ns).saturating_sub(self.state.ns_offset)
    }

    /// Forget everything, e.g. on reconnect.
    pub fn reset(&mut self) {
        *self = ClockSync::new();
    }

    pub fn ns_offset(&self) -> i64 {
        self.state.ns_offset
    }

    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn last_echo_id(&self) -> u32 {
        self.echo_id
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Four-timestamp offset and round trip, `None` when the device's values
/// overflow the nanosecond range.
fn echo_offset_rtt(org: i64, recv: i64, xmt: i64, now: i64) -> Option<(i64, i64)> {
    let (org, recv, xmt, now) = (org as i128, recv as i128, xmt as i128, now as i128);
    let rtt = (now - org) - (xmt - recv);
    let offset = ((recv - org) + (xmt - now)) / 2;
    Some((i64::try_from(offset).ok()?, i64::try_from(rtt).ok()?))
}

/// Extend `ts32_us` to device nanoseconds relative to a previous sample.
///
/// A drop of more than half the counter range is a forward wrap; a rise of
/// more than half the range is a late sample from the previous epoch.
pub fn extend_device_ns(ts32_us: u32, last_ts32: u32, last_ts_ns: i64) -> i64 {
    let mut epoch_ns = last_ts_ns.saturating_sub(last_ts32 as i64 * 1_000);
    if ts32_us < last_ts32 && last_ts32 - ts32_us > HALF_RANGE_US {
        epoch_ns = epoch_ns.saturating_add(WRAP_NS);
    } else if ts32_us > last_ts32 && ts32_us - last_ts32 > HALF_RANGE_US {
        epoch_ns = epoch_ns.saturating_sub(WRAP_NS);
    }
    epoch_ns.saturating_add(ts32_us as i64 * 1_000)
}

// ─── Device Timestamp Tracker ────────────────────────────────────────────────

/// Keeps the extension state for one device timestamp stream.
#[derive(Debug, Clone, Default)]
pub struct DeviceTimestampTracker {
    last: Option<(u32, i64)>,
    last_local_ns: Option<i64>,
}

impl DeviceTimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend `ts32_us` and map it to the local timeline with `ns_offset`.
    /// The returned value never goes behind one previously returned.
    pub fn extend(&mut self, ts32_us: u32, ns_offset: i64) -> i64 {
        let device_ns = match self.last {
            Some((last_ts32, last_ns)) => extend_device_ns(ts32_us, last_ts32, last_ns),
            None => ts32_us as i64 * 1_000,
        };
        self.last = Some((ts32_us, device_ns));

        let local = device_ns.saturating_sub(ns_offset);
        let local = match self.last_local_ns {
            Some(prev) => local.max(prev),
            None => local,
        };
        self.last_local_ns = Some(local);
        local
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
