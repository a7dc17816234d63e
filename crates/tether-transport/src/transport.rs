//! # Transport Abstraction
//!
//! The engine only needs two things from the physical link: send a datagram
//! and block until one arrives. USB bulk endpoints and network sockets both
//! fit behind [`Transport`].
//!
//! - [`UdpTransport`]: connected UDP socket with a read timeout
//! - [`LoopbackTransport`]: in-process pair over bounded channels
//! - [`OutboundQueue`]: bounded queue drained by a writer thread
//!
//! Anything that can take a datagram implements [`FrameSink`].

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

/// Largest datagram accepted by [`UdpTransport::recv`].
pub const MAX_DATAGRAM: usize = 65_536;

// ─── Traits ──────────────────────────────────────────────────────────────────

pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until a datagram arrives. Returns [`TransportError::TimedOut`]
    /// periodically so callers can check for shutdown.
    fn recv(&self) -> Result<Bytes, TransportError>;

    /// Unblock receivers and fail further sends.
    fn close(&self) {}
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn recv(&self) -> Result<Bytes, TransportError> {
        (**self).recv()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Outbound half only.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> FrameSink for T {
    fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.send(&frame)
    }
}

// ─── UDP ─────────────────────────────────────────────────────────────────────

pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind `local`, connect to `remote` and set the read timeout.
    pub fn connect(
        local: impl ToSocketAddrs,
        remote: impl ToSocketAddrs,
        read_timeout: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(UdpTransport {
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.socket.send(data)?;
        Ok(())
    }

    fn recv(&self) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
        match self.socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf.freeze())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(TransportError::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ─── Loopback ────────────────────────────────────────────────────────────────

/// One end of an in-process datagram link.
pub struct LoopbackTransport {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    read_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Two connected endpoints, each direction buffering `capacity` datagrams.
    pub fn pair(capacity: usize) -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, b_rx) = crossbeam_channel::bounded(capacity);
        let (b_tx, a_rx) = crossbeam_channel::bounded(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let read_timeout = Duration::from_millis(50);
        (
            LoopbackTransport {
                tx: a_tx,
                rx: a_rx,
                read_timeout,
                closed: closed.clone(),
            },
            LoopbackTransport {
                tx: b_tx,
                rx: b_rx,
                read_timeout,
                closed,
            },
        )
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Datagrams waiting to be received on this end.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Non-blocking receive, used by tests to drain the link.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Full,
                TrySendError::Disconnected(_) => TransportError::Closed,
            })
    }

    fn recv(&self) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(b) => Ok(b),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ─── Outbound Queue ──────────────────────────────────────────────────────────

/// Producer side of the bounded queue a writer thread drains.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Sender<Bytes>,
}

impl OutboundQueue {
    pub fn bounded(depth: usize) -> (OutboundQueue, Receiver<Bytes>) {
        let (tx, rx) = crossbeam_channel::bounded(depth);
        (OutboundQueue { tx }, rx)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl FrameSink for OutboundQueue {
    fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Disconnected(_) => TransportError::Closed,
        })
    }
}
