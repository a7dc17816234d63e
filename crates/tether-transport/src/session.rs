//! # Connection Lifecycle
//!
//! A [`Connection`] owns everything one device link needs and runs three
//! worker threads:
//!
//! ```text
//!   pump / router / clock ──▶ OutboundQueue ──▶ writer ──▶ Transport::send
//!   Transport::recv ──▶ reader ──▶ TopicFramer ──▶ InboundRouter
//!   clock ── every echo_interval ──▶ echo ping ──▶ OutboundQueue
//! ```
//!
//! All state is per instance. [`Connection::shutdown`] stops the threads,
//! flushes what the writer still holds, joins them and only then closes the
//! transport. Dropping the connection shuts it down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::clock::{ClockState, ClockSync, DeviceTimestampTracker, MonotonicClock};
use crate::config::{ChannelKind, TransportConfig};
use crate::error::{PumpError, TransportError};
use crate::pump::{DirectChannel, StreamPump, VideoChannel};
use crate::receiver::{Handlers, InboundRouter};
use crate::stats::{TransportCounters, TransportStats};
use crate::topic::{topics, TopicFramer, TopicWriter};
use crate::transport::{FrameSink, OutboundQueue, Transport};
use crate::wire::{encode_hostinfo, HOSTINFO_HEADER_LEN};

pub struct Connection {
    transport: Arc<dyn Transport>,
    config: TransportConfig,
    counters: Arc<TransportCounters>,
    clock: Arc<Mutex<ClockSync>>,
    monotonic: MonotonicClock,
    device_ts: Mutex<DeviceTimestampTracker>,
    hostinfo: Arc<TopicWriter>,
    outbound: OutboundQueue,
    video: Arc<dyn VideoChannel>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Connection {
    /// Spawn the writer, reader and clock threads over `transport`.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: TransportConfig,
        handlers: Handlers,
    ) -> Result<Self, TransportError> {
        let counters = Arc::new(TransportCounters::new());
        let clock = Arc::new(Mutex::new(ClockSync::new()));
        let monotonic = MonotonicClock::new();
        let hostinfo = Arc::new(TopicWriter::new(topics::HOSTINFO_ADV));
        let (outbound, outbound_rx) = OutboundQueue::bounded(config.outbound_queue_depth);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let video: Arc<dyn VideoChannel> = match config.channel {
            ChannelKind::Packetized => Arc::new(StreamPump::new(
                config.pump_config(),
                outbound.clone(),
                counters.clone(),
            )),
            ChannelKind::Direct => Arc::new(DirectChannel::new(
                config.stream_count,
                outbound.clone(),
                counters.clone(),
            )),
        };

        let router = InboundRouter::new(
            config.segment_capacity_ceiling,
            handlers,
            clock.clone(),
            monotonic,
            hostinfo.clone(),
            Arc::new(outbound.clone()),
            counters.clone(),
        );

        let mut conn = Connection {
            transport,
            config,
            counters,
            clock,
            monotonic,
            device_ts: Mutex::new(DeviceTimestampTracker::new()),
            hostinfo,
            outbound,
            video,
            running: Arc::new(AtomicBool::new(true)),
            stop_tx: Some(stop_tx),
            handles: Vec::with_capacity(3),
        };

        // A failed spawn drops `conn`, which joins whatever already started.
        conn.spawn_writer(outbound_rx, stop_rx.clone())?;
        conn.spawn_reader(router)?;
        conn.spawn_clock(stop_rx)?;
        debug!(channel = ?conn.config.channel, streams = conn.config.stream_count, "connection started");
        Ok(conn)
    }

    fn spawn_writer(
        &mut self,
        outbound_rx: Receiver<Bytes>,
        stop_rx: Receiver<()>,
    ) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let handle = thread::Builder::new()
            .name("tether-writer".into())
            .spawn(move || {
                let send = |frame: Bytes| {
                    if let Err(e) = transport.send(&frame) {
                        TransportCounters::incr(&counters.send_failures);
                        warn!(len = frame.len(), error = %e, "transport send failed");
                    }
                };
                loop {
                    select! {
                        recv(outbound_rx) -> frame => match frame {
                            Ok(frame) => send(frame),
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => {
                            for frame in outbound_rx.try_iter() {
                                send(frame);
                            }
                            break;
                        }
                    }
                }
                debug!("writer thread stopped");
            })?;
        self.handles.push(handle);
        Ok(())
    }

    fn spawn_reader(&mut self, mut router: InboundRouter) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let running = self.running.clone();
        let monotonic = self.monotonic;
        let handle = thread::Builder::new()
            .name("tether-reader".into())
            .spawn(move || {
                let mut framer = TopicFramer::new();
                let mut framing_errors = 0;
                while running.load(Ordering::Relaxed) {
                    let datagram = match transport.recv() {
                        Ok(datagram) => datagram,
                        Err(TransportError::TimedOut) => continue,
                        Err(TransportError::Closed) => break,
                        Err(e) => {
                            warn!(error = %e, "transport receive failed");
                            continue;
                        }
                    };
                    let recv_ns = monotonic.now_ns();
                    for packet in framer.push(&datagram, recv_ns) {
                        router.route(packet);
                    }
                    let errors = framer.framing_errors();
                    if errors > framing_errors {
                        TransportCounters::add(&counters.framing_errors, errors - framing_errors);
                        framing_errors = errors;
                    }
                }
                debug!("reader thread stopped");
            })?;
        self.handles.push(handle);
        Ok(())
    }

    fn spawn_clock(&mut self, stop_rx: Receiver<()>) -> Result<(), TransportError> {
        let clock = self.clock.clone();
        let hostinfo = self.hostinfo.clone();
        let outbound = self.outbound.clone();
        let counters = self.counters.clone();
        let monotonic = self.monotonic;
        let interval = self.config.echo_interval;
        let handle = thread::Builder::new()
            .name("tether-clock".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let req = clock
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .send_echo(monotonic.now_ns());
                    let sent = hostinfo
                        .frame(&req.encode())
                        .map_err(|e| e.to_string())
                        .and_then(|frame| outbound.send_frame(frame).map_err(|e| e.to_string()));
                    if let Err(error) = sent {
                        TransportCounters::incr(&counters.send_failures);
                        warn!(echo_id = req.id, %error, "failed to queue echo ping");
                    }
                }
                debug!("clock thread stopped");
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// The video channel variant selected by the configuration.
    pub fn video_channel(&self) -> Arc<dyn VideoChannel> {
        self.video.clone()
    }

    /// Queue a hostinfo control message for the device.
    pub fn send_control(
        &self,
        message_type: u8,
        result: u16,
        aux: u32,
        payload: &[u8],
    ) -> Result<(), PumpError> {
        let stream_size = (HOSTINFO_HEADER_LEN + payload.len()) as u32;
        let message = encode_hostinfo(message_type, result, stream_size, aux, payload);
        for frame in self.hostinfo.frame_all(&message)? {
            self.outbound.send_frame(frame)?;
        }
        Ok(())
    }

    /// Map a 32-bit device microsecond timestamp onto the local clock.
    /// Successive results never go backwards.
    pub fn device_time_ns(&self, ts32_us: u32) -> i64 {
        let ns_offset = self.clock_state().ns_offset;
        self.device_ts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(ts32_us, ns_offset)
    }

    pub fn now_ns(&self) -> i64 {
        self.monotonic.now_ns()
    }

    pub fn clock_state(&self) -> ClockState {
        self.clock.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        self.counters.clone()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop and join all threads, then close the transport. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        // Disconnecting the stop channel wakes the writer and clock threads.
        self.stop_tx = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        self.transport.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
