//! # Inbound Dispatch
//!
//! Routes reassembled topic packets to their consumers:
//!
//! - `HOSTINFO_ADV` → hostinfo decode; echo pongs feed [`ClockSync`], echo
//!   pings are answered immediately, everything else goes to the
//!   [`ControlHandler`]
//! - segmented topics (pose, hands, skeleton) → [`SegmentReassembler`]
//! - anything else → the raw [`TopicHandler`], if any
//!
//! The router is owned by the single reader thread of a connection. Errors are
//! counted and logged; none of them stop the reader.

use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

use crate::clock::{ClockSync, EchoOutcome, EchoReply, MonotonicClock};
use crate::error::SegmentError;
use crate::segment::{FeedStatus, SegmentChannel, SegmentHandler, SegmentReassembler, SegmentState};
use crate::stats::TransportCounters;
use crate::topic::{topics, TopicPacket, TopicWriter};
use crate::transport::FrameSink;
use crate::wire::{decode_hostinfo, CapnpSegmentHeader, EchoPayload, HostInfoPacket, ECHO_PING, ECHO_PONG};

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Receives non-echo hostinfo messages.
pub trait ControlHandler: Send {
    fn on_control(&mut self, packet: &HostInfoPacket);
}

impl<F> ControlHandler for F
where
    F: FnMut(&HostInfoPacket) + Send,
{
    fn on_control(&mut self, packet: &HostInfoPacket) {
        self(packet)
    }
}

/// Receives topic packets nobody else claims.
pub trait TopicHandler: Send {
    fn on_topic(&mut self, packet: &TopicPacket);
}

impl<F> TopicHandler for F
where
    F: FnMut(&TopicPacket) + Send,
{
    fn on_topic(&mut self, packet: &TopicPacket) {
        self(packet)
    }
}

/// Consumers registered on a connection.
pub struct Handlers {
    pub segment: Box<dyn SegmentHandler>,
    pub control: Option<Box<dyn ControlHandler>>,
    pub raw: Option<Box<dyn TopicHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Handlers {
            segment: Box::new(|_: SegmentChannel, _: &[u8]| {}),
            control: None,
            raw: None,
        }
    }

    pub fn on_segment(mut self, handler: impl SegmentHandler + 'static) -> Self {
        self.segment = Box::new(handler);
        self
    }

    pub fn on_control(mut self, handler: impl ControlHandler + 'static) -> Self {
        self.control = Some(Box::new(handler));
        self
    }

    pub fn on_topic(mut self, handler: impl TopicHandler + 'static) -> Self {
        self.raw = Some(Box::new(handler));
        self
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic carried by each segment channel, indexed by channel.
pub const DEFAULT_SEGMENT_TOPICS: [u8; 3] = [topics::POSE, topics::HANDS, topics::SKELETON];

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct InboundRouter {
    reassembler: SegmentReassembler,
    segment_topics: [u8; 3],
    control: Option<Box<dyn ControlHandler>>,
    raw: Option<Box<dyn TopicHandler>>,
    clock: Arc<Mutex<ClockSync>>,
    monotonic: MonotonicClock,
    hostinfo: Arc<TopicWriter>,
    outbound: Arc<dyn FrameSink>,
    counters: Arc<TransportCounters>,
}

impl InboundRouter {
    pub fn new(
        segment_ceiling: usize,
        handlers: Handlers,
        clock: Arc<Mutex<ClockSync>>,
        monotonic: MonotonicClock,
        hostinfo: Arc<TopicWriter>,
        outbound: Arc<dyn FrameSink>,
        counters: Arc<TransportCounters>,
    ) -> Self {
        InboundRouter {
            reassembler: SegmentReassembler::from_boxed(segment_ceiling, handlers.segment),
            segment_topics: DEFAULT_SEGMENT_TOPICS,
            control: handlers.control,
            raw: handlers.raw,
            clock,
            monotonic,
            hostinfo,
            outbound,
            counters,
        }
    }

    /// Map segment channels to different topics.
    pub fn with_segment_topics(mut self, segment_topics: [u8; 3]) -> Self {
        self.segment_topics = segment_topics;
        self
    }

    pub fn route(&mut self, packet: TopicPacket) {
        TransportCounters::incr(&self.counters.topic_packets);
        let topic = packet.topic();

        if topic == topics::HOSTINFO_ADV {
            self.route_hostinfo(&packet);
            return;
        }

        if let Some(idx) = self.segment_topics.iter().position(|t| *t == topic) {
            if let Ok(channel) = SegmentChannel::new(idx) {
                self.route_segment(channel, &packet);
                return;
            }
        }

        match self.raw.as_mut() {
            Some(raw) => raw.on_topic(&packet),
            None => trace!(topic, "no handler for topic"),
        }
    }

    pub fn reassembler(&self) -> &SegmentReassembler {
        &self.reassembler
    }

    /// Drop partial segments, e.g. after the link resynchronised.
    pub fn reset(&mut self) {
        self.reassembler.reset_all();
    }

    fn route_hostinfo(&mut self, packet: &TopicPacket) {
        let info = match decode_hostinfo(packet.payload.clone()) {
            Ok(info) => info.with_recv_ns(packet.recv_ns),
            Err(e) => {
                TransportCounters::incr(&self.counters.framing_errors);
                warn!(error = %e, "dropping malformed hostinfo");
                return;
            }
        };

        if info.is_echo() {
            match info.result {
                ECHO_PONG => return self.on_pong(&info),
                ECHO_PING => return self.on_ping(&info),
                _ => {}
            }
        }

        TransportCounters::incr(&self.counters.control_messages);
        match self.control.as_mut() {
            Some(control) => control.on_control(&info),
            None => trace!(message_type = info.message_type, "unhandled control message"),
        }
    }

    fn on_pong(&mut self, info: &HostInfoPacket) {
        let reply = match EchoReply::from_packet(info) {
            Ok(reply) => reply,
            Err(e) => {
                TransportCounters::incr(&self.counters.framing_errors);
                warn!(error = %e, "dropping malformed echo pong");
                return;
            }
        };
        let outcome = self
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_echo_reply(&reply, info.recv_ns);
        match outcome {
            EchoOutcome::Settled(_) => TransportCounters::incr(&self.counters.echoes_settled),
            EchoOutcome::Stale => TransportCounters::incr(&self.counters.echoes_stale),
        }
    }

    fn on_ping(&mut self, info: &HostInfoPacket) {
        let ping = match EchoPayload::decode(&info.payload) {
            Ok(ping) => ping,
            Err(e) => {
                TransportCounters::incr(&self.counters.framing_errors);
                warn!(error = %e, "dropping malformed echo ping");
                return;
            }
        };
        let pong = self
            .clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .encode_pong(info.aux, &ping, info.recv_ns, self.monotonic.now_ns());

        let sent = self
            .hostinfo
            .frame(&pong)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.outbound.send_frame(bytes).map_err(|e| e.to_string()));
        match sent {
            Ok(()) => TransportCounters::incr(&self.counters.pings_answered),
            Err(error) => {
                TransportCounters::incr(&self.counters.send_failures);
                warn!(echo_id = info.aux, %error, "failed to answer echo ping");
            }
        }
    }

    fn route_segment(&mut self, channel: SegmentChannel, packet: &TopicPacket) {
        let mut body = &packet.payload[..];

        if self.reassembler.state(channel) == SegmentState::Empty {
            let header = match CapnpSegmentHeader::decode(body) {
                Ok(header) => header,
                Err(e) => {
                    TransportCounters::incr(&self.counters.framing_errors);
                    warn!(channel = channel.index(), error = %e, "segment start without header");
                    return;
                }
            };
            if let Err(e) = self.reassembler.begin_segment(channel, header.segment_len()) {
                self.on_segment_error(channel, &e);
                return;
            }
            if header.segment_len() == 0 {
                TransportCounters::incr(&self.counters.segments_completed);
                return;
            }
            body = &body[CapnpSegmentHeader::ENCODED_LEN..];
            if body.is_empty() {
                return;
            }
        }

        match self.reassembler.feed(channel, body) {
            Ok(FeedStatus::Completed) => {
                TransportCounters::incr(&self.counters.segments_completed);
            }
            Ok(FeedStatus::Pending { remaining }) => {
                trace!(channel = channel.index(), remaining, "segment continues");
            }
            Err(e) => self.on_segment_error(channel, &e),
        }
    }

    fn on_segment_error(&mut self, channel: SegmentChannel, error: &SegmentError) {
        match error {
            SegmentError::Capacity { .. } => {
                TransportCounters::incr(&self.counters.segment_capacity_errors)
            }
            SegmentError::Overrun { .. } => TransportCounters::incr(&self.counters.segment_overruns),
            _ => TransportCounters::incr(&self.counters.framing_errors),
        }
        warn!(channel = channel.index(), error = %error, "segment discarded");
        self.reassembler.reset(channel);
        debug!(channel = channel.index(), "segment channel reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::topic::{encode_topic, TopicFramer};
    use crate::wire::{encode_capnp, encode_echo, encode_hostinfo, message_type};
    use bytes::{BufMut, Bytes, BytesMut};

    #[derive(Default)]
    struct Captured {
        frames: Mutex<Vec<Bytes>>,
    }

    impl FrameSink for Captured {
        fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct Harness {
        router: InboundRouter,
        clock: Arc<Mutex<ClockSync>>,
        outbound: Arc<Captured>,
        counters: Arc<TransportCounters>,
        segments: Arc<Mutex<Vec<(SegmentChannel, Vec<u8>)>>>,
        control: Arc<Mutex<Vec<u8>>>,
        raw: Arc<Mutex<Vec<u8>>>,
    }

    fn harness(ceiling: usize) -> Harness {
        let segments = Arc::new(Mutex::new(Vec::new()));
        let control = Arc::new(Mutex::new(Vec::new()));
        let raw = Arc::new(Mutex::new(Vec::new()));
        let (s, c, r) = (segments.clone(), control.clone(), raw.clone());
        let handlers = Handlers::new()
            .on_segment(move |ch: SegmentChannel, seg: &[u8]| s.lock().unwrap().push((ch, seg.to_vec())))
            .on_control(move |p: &HostInfoPacket| c.lock().unwrap().push(p.message_type))
            .on_topic(move |p: &TopicPacket| r.lock().unwrap().push(p.topic()));

        let clock = Arc::new(Mutex::new(ClockSync::new()));
        let outbound = Arc::new(Captured::default());
        let counters = Arc::new(TransportCounters::new());
        let router = InboundRouter::new(
            ceiling,
            handlers,
            clock.clone(),
            MonotonicClock::new(),
            Arc::new(TopicWriter::new(topics::HOSTINFO_ADV)),
            outbound.clone(),
            counters.clone(),
        );
        Harness {
            router,
            clock,
            outbound,
            counters,
            segments,
            control,
            raw,
        }
    }

    fn topic_packet(topic: u8, payload: &[u8], recv_ns: i64) -> TopicPacket {
        let mut framer = TopicFramer::new();
        framer
            .push(&encode_topic(topic, 0, payload).unwrap(), recv_ns)
            .remove(0)
    }

    #[test]
    fn pong_settles_clock() {
        let mut h = harness(1024);
        let req = h.clock.lock().unwrap().send_echo(1_000);
        let pong = encode_echo(
            ECHO_PONG,
            req.id,
            &EchoPayload {
                org: 1_000,
                recv: 5_000_100,
                xmt: 5_000_200,
                offset: 0,
            },
        );
        h.router.route(topic_packet(topics::HOSTINFO_ADV, &pong, 1_300));

        assert_eq!(h.counters.snapshot().echoes_settled, 1);
        assert_eq!(h.clock.lock().unwrap().ns_offset(), 4_999_000);
    }

    #[test]
    fn stale_pong_is_counted() {
        let mut h = harness(1024);
        let pong = encode_echo(ECHO_PONG, 99, &EchoPayload::default());
        h.router.route(topic_packet(topics::HOSTINFO_ADV, &pong, 0));
        assert_eq!(h.counters.snapshot().echoes_stale, 1);
    }

    #[test]
    fn ping_is_answered_on_hostinfo_topic() {
        let mut h = harness(1024);
        let ping = encode_echo(
            ECHO_PING,
            7,
            &EchoPayload {
                org: 1,
                recv: 0,
                xmt: 2,
                offset: 0,
            },
        );
        h.router.route(topic_packet(topics::HOSTINFO_ADV, &ping, 10));

        let frames = h.outbound.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let mut framer = TopicFramer::new();
        let pkt = framer.push(&frames[0], 0).remove(0);
        assert_eq!(pkt.topic(), topics::HOSTINFO_ADV);
        let info = decode_hostinfo(pkt.payload).unwrap();
        assert_eq!(info.result, ECHO_PONG);
        assert_eq!(info.aux, 7);
        let body = EchoPayload::decode(&info.payload).unwrap();
        assert_eq!((body.org, body.recv), (2, 10));
        assert_eq!(h.counters.snapshot().pings_answered, 1);
    }

    #[test]
    fn control_messages_reach_handler() {
        let mut h = harness(1024);
        let msg = encode_hostinfo(message_type::OK, 0, 8, 0, &[]);
        h.router.route(topic_packet(topics::HOSTINFO_ADV, &msg, 0));
        assert_eq!(*h.control.lock().unwrap(), vec![message_type::OK]);
    }

    #[test]
    fn malformed_hostinfo_is_counted() {
        let mut h = harness(1024);
        h.router.route(topic_packet(topics::HOSTINFO_ADV, &[1, 2, 3], 0));
        assert_eq!(h.counters.snapshot().framing_errors, 1);
        assert!(h.control.lock().unwrap().is_empty());
    }

    #[test]
    fn segment_spans_topic_packets() {
        let mut h = harness(1024);
        let body: Vec<u8> = (0..48u8).collect();
        let mut first = BytesMut::new();
        CapnpSegmentHeader::for_payload(body.len()).encode(&mut first);
        first.put_slice(&body[..20]);

        h.router.route(topic_packet(topics::HANDS, &first, 0));
        assert_eq!(h.router.reassembler().state(SegmentChannel::HANDS), SegmentState::Accumulating);
        h.router.route(topic_packet(topics::HANDS, &body[20..], 0));

        let segs = h.segments.lock().unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], (SegmentChannel::HANDS, body));
        assert_eq!(h.counters.snapshot().segments_completed, 1);
    }

    #[test]
    fn segment_in_single_capnp_message() {
        let mut h = harness(1024);
        let msg = encode_capnp(message_type::OK, 0, 0, &[5u8; 16]);
        // Segmented topics carry the capnp prefix without the hostinfo header.
        h.router.route(topic_packet(topics::POSE, &msg[8..], 0));
        assert_eq!(h.segments.lock().unwrap()[0].1, vec![5u8; 16]);
    }

    #[test]
    fn segment_overrun_resets_channel() {
        let mut h = harness(1024);
        let mut first = BytesMut::new();
        CapnpSegmentHeader::for_payload(8).encode(&mut first);
        first.put_slice(&[0u8; 12]);
        h.router.route(topic_packet(topics::SKELETON, &first, 0));

        assert_eq!(h.counters.snapshot().segment_overruns, 1);
        assert_eq!(h.router.reassembler().state(SegmentChannel::SKELETON), SegmentState::Empty);
        assert!(h.segments.lock().unwrap().is_empty());
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut h = harness(64);
        let mut first = BytesMut::new();
        CapnpSegmentHeader::for_payload(128).encode(&mut first);
        h.router.route(topic_packet(topics::POSE, &first, 0));
        assert_eq!(h.counters.snapshot().segment_capacity_errors, 1);
    }

    #[test]
    fn other_topics_go_to_raw_handler() {
        let mut h = harness(64);
        h.router.route(topic_packet(topics::AUDIO, b"pcm!", 0));
        assert_eq!(*h.raw.lock().unwrap(), vec![topics::AUDIO]);
        assert_eq!(h.counters.snapshot().topic_packets, 1);
    }
}
