//! # Segmented Packet Reassembly
//!
//! Logical messages on the segmented topics (pose, hands, skeleton) arrive as
//! a capnp segment whose length is announced up front and whose bytes are then
//! spread over one or more topic packets. Each channel runs a small state
//! machine:
//!
//! ```text
//!   Empty ──begin_segment──▶ Accumulating ──feed (last byte)──▶ Complete ──handler──▶ Empty
//! ```
//!
//! Channels are independent; the caller (one reader thread per link) owns the
//! reassembler, so no locking happens here.

use tracing::trace;

use crate::error::SegmentError;

/// Number of concurrently tracked segment channels.
pub const SEGMENT_CHANNELS: usize = 3;

/// Default hard ceiling for one segment buffer.
pub const DEFAULT_SEGMENT_CEILING: usize = 4 * 1024 * 1024;

// ─── Channel Index ───────────────────────────────────────────────────────────

/// A validated segment channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentChannel(u8);

impl SegmentChannel {
    pub const POSE: SegmentChannel = SegmentChannel(0);
    pub const HANDS: SegmentChannel = SegmentChannel(1);
    pub const SKELETON: SegmentChannel = SegmentChannel(2);

    pub const ALL: [SegmentChannel; SEGMENT_CHANNELS] =
        [Self::POSE, Self::HANDS, Self::SKELETON];

    pub fn new(index: usize) -> Result<Self, SegmentError> {
        if index < SEGMENT_CHANNELS {
            Ok(SegmentChannel(index as u8))
        } else {
            Err(SegmentError::InvalidChannel(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for SegmentChannel {
    type Error = SegmentError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        SegmentChannel::new(index)
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

/// Receives every completed segment.
///
/// The slice borrows the reassembler's buffer and is only valid for the
/// duration of the call.
pub trait SegmentHandler: Send {
    fn on_segment(&mut self, channel: SegmentChannel, segment: &[u8]);
}

impl<F> SegmentHandler for F
where
    F: FnMut(SegmentChannel, &[u8]) + Send,
{
    fn on_segment(&mut self, channel: SegmentChannel, segment: &[u8]) {
        self(channel, segment)
    }
}

// ─── Segment State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Empty,
    Accumulating,
    Complete,
}

/// Result of a successful [`SegmentReassembler::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// More bytes are needed.
    Pending { remaining: usize },
    /// The segment completed and was handed to the handler.
    Completed,
}

struct Segment {
    state: SegmentState,
    /// `len()` is the valid length; capacity is kept between segments.
    buf: Vec<u8>,
    expected_len: usize,
}

impl Segment {
    fn new() -> Self {
        Segment {
            state: SegmentState::Empty,
            buf: Vec::new(),
            expected_len: 0,
        }
    }

    fn clear(&mut self) {
        self.state = SegmentState::Empty;
        self.buf.clear();
        self.expected_len = 0;
    }
}

// ─── Reassembler ─────────────────────────────────────────────────────────────

pub struct SegmentReassembler {
    segments: [Segment; SEGMENT_CHANNELS],
    ceiling: usize,
    handler: Box<dyn SegmentHandler>,
}

impl SegmentReassembler {
    pub fn new(ceiling: usize, handler: impl SegmentHandler + 'static) -> Self {
        Self::from_boxed(ceiling, Box::new(handler))
    }

    pub fn from_boxed(ceiling: usize, handler: Box<dyn SegmentHandler>) -> Self {
        SegmentReassembler {
            segments: [Segment::new(), Segment::new(), Segment::new()],
            ceiling,
            handler,
        }
    }

    /// Start a segment of `expected_len` bytes, discarding anything the
    /// channel had accumulated.
    ///
    /// A zero-length segment completes immediately. Lengths above the ceiling
    /// fail with [`SegmentError::Capacity`] and leave the channel untouched.
    pub fn begin_segment(
        &mut self,
        channel: SegmentChannel,
        expected_len: usize,
    ) -> Result<(), SegmentError> {
        if expected_len > self.ceiling {
            return Err(SegmentError::Capacity {
                channel: channel.index(),
                requested: expected_len,
                ceiling: self.ceiling,
            });
        }

        let seg = &mut self.segments[channel.index()];
        seg.buf.clear();
        seg.buf.reserve(expected_len);
        seg.expected_len = expected_len;
        seg.state = SegmentState::Accumulating;

        if expected_len == 0 {
            self.complete(channel);
        }
        Ok(())
    }

    /// Append bytes to the channel's segment. Completing it runs the handler
    /// synchronously and returns the channel to `Empty`.
    ///
    /// Feeding past the expected length is an [`SegmentError::Overrun`]: none
    /// of the bytes are written and the segment is discarded.
    pub fn feed(
        &mut self,
        channel: SegmentChannel,
        bytes: &[u8],
    ) -> Result<FeedStatus, SegmentError> {
        let seg = &mut self.segments[channel.index()];
        if seg.state != SegmentState::Accumulating {
            return Err(SegmentError::NotAccumulating {
                channel: channel.index(),
            });
        }

        let remaining = seg.expected_len - seg.buf.len();
        if bytes.len() > remaining {
            let expected = seg.expected_len;
            seg.clear();
            return Err(SegmentError::Overrun {
                channel: channel.index(),
                expected,
                excess: bytes.len() - remaining,
            });
        }

        seg.buf.extend_from_slice(bytes);
        if seg.buf.len() < seg.expected_len {
            return Ok(FeedStatus::Pending {
                remaining: seg.expected_len - seg.buf.len(),
            });
        }

        self.complete(channel);
        Ok(FeedStatus::Completed)
    }

    fn complete(&mut self, channel: SegmentChannel) {
        let seg = &mut self.segments[channel.index()];
        seg.state = SegmentState::Complete;
        trace!(channel = channel.index(), len = seg.buf.len(), "segment complete");
        self.handler.on_segment(channel, &seg.buf);
        seg.clear();
    }

    pub fn reset(&mut self, channel: SegmentChannel) {
        self.segments[channel.index()].clear();
    }

    pub fn reset_all(&mut self) {
        for seg in &mut self.segments {
            seg.clear();
        }
    }

    pub fn state(&self, channel: SegmentChannel) -> SegmentState {
        self.segments[channel.index()].state
    }

    pub fn valid_len(&self, channel: SegmentChannel) -> usize {
        self.segments[channel.index()].buf.len()
    }

    pub fn expected_len(&self, channel: SegmentChannel) -> usize {
        self.segments[channel.index()].expected_len
    }

    pub fn capacity(&self, channel: SegmentChannel) -> usize {
        self.segments[channel.index()].buf.capacity()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    type Completed = Arc<Mutex<Vec<(SegmentChannel, Vec<u8>)>>>;

    fn recording(ceiling: usize) -> (SegmentReassembler, Completed) {
        let completed: Completed = Arc::new(Mutex::new(Vec::new()));
        let sink = completed.clone();
        let reassembler = SegmentReassembler::new(ceiling, move |ch: SegmentChannel, seg: &[u8]| {
            sink.lock().unwrap().push((ch, seg.to_vec()));
        });
        (reassembler, completed)
    }

    #[test]
    fn channel_bounds() {
        assert_eq!(SegmentChannel::new(2).unwrap(), SegmentChannel::SKELETON);
        assert_eq!(
            SegmentChannel::try_from(3).unwrap_err(),
            SegmentError::InvalidChannel(3)
        );
    }

    #[test]
    fn completes_across_feeds() {
        let (mut r, done) = recording(1024);
        let ch = SegmentChannel::POSE;
        r.begin_segment(ch, 10).unwrap();
        assert_eq!(r.state(ch), SegmentState::Accumulating);
        assert_eq!(r.feed(ch, &[1, 2, 3, 4]).unwrap(), FeedStatus::Pending { remaining: 6 });
        assert_eq!(r.valid_len(ch), 4);
        assert_eq!(r.feed(ch, &[5, 6, 7, 8, 9, 10]).unwrap(), FeedStatus::Completed);

        assert_eq!(r.state(ch), SegmentState::Empty);
        assert!(r.capacity(ch) >= 10);
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0], (ch, (1..=10).collect::<Vec<u8>>()));
    }

    #[test]
    fn overrun_discards_segment() {
        let (mut r, done) = recording(1024);
        let ch = SegmentChannel::HANDS;
        r.begin_segment(ch, 4).unwrap();
        r.feed(ch, &[0, 0]).unwrap();
        let err = r.feed(ch, &[0, 0, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            SegmentError::Overrun {
                channel: 1,
                expected: 4,
                excess: 2
            }
        );
        assert_eq!(r.state(ch), SegmentState::Empty);
        assert_eq!(r.valid_len(ch), 0);
        assert!(done.lock().unwrap().is_empty());
    }

    #[test]
    fn capacity_ceiling_is_surfaced() {
        let (mut r, _) = recording(64);
        let err = r.begin_segment(SegmentChannel::POSE, 65).unwrap_err();
        assert_eq!(
            err,
            SegmentError::Capacity {
                channel: 0,
                requested: 65,
                ceiling: 64
            }
        );
        assert_eq!(r.state(SegmentChannel::POSE), SegmentState::Empty);
        r.begin_segment(SegmentChannel::POSE, 64).unwrap();
    }

    #[test]
    fn feed_without_begin_fails() {
        let (mut r, _) = recording(64);
        assert_eq!(
            r.feed(SegmentChannel::SKELETON, b"x").unwrap_err(),
            SegmentError::NotAccumulating { channel: 2 }
        );
    }

    #[test]
    fn zero_length_segment_completes_immediately() {
        let (mut r, done) = recording(64);
        r.begin_segment(SegmentChannel::POSE, 0).unwrap();
        assert_eq!(r.state(SegmentChannel::POSE), SegmentState::Empty);
        assert_eq!(done.lock().unwrap().len(), 1);
    }

    #[test]
    fn channels_are_independent() {
        let (mut r, done) = recording(64);
        r.begin_segment(SegmentChannel::POSE, 4).unwrap();
        r.begin_segment(SegmentChannel::HANDS, 2).unwrap();
        r.feed(SegmentChannel::POSE, b"ab").unwrap();
        r.feed(SegmentChannel::HANDS, b"zz").unwrap();
        r.feed(SegmentChannel::POSE, b"cd").unwrap();

        let done = done.lock().unwrap();
        assert_eq!(done[0], (SegmentChannel::HANDS, b"zz".to_vec()));
        assert_eq!(done[1], (SegmentChannel::POSE, b"abcd".to_vec()));
    }

    #[test]
    fn begin_discards_partial_segment() {
        let (mut r, done) = recording(64);
        r.begin_segment(SegmentChannel::POSE, 8).unwrap();
        r.feed(SegmentChannel::POSE, b"stale").unwrap();
        r.begin_segment(SegmentChannel::POSE, 3).unwrap();
        r.feed(SegmentChannel::POSE, b"new").unwrap();
        assert_eq!(done.lock().unwrap()[0].1, b"new".to_vec());
    }

    proptest! {
        #[test]
        fn proptest_any_chunking_completes_once(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            cuts in proptest::collection::vec(any::<proptest::sample::Index>(), 0..8),
        ) {
            let (mut r, done) = recording(4096);
            let ch = SegmentChannel::SKELETON;
            r.begin_segment(ch, data.len()).unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(data.len())).collect();
            points.push(0);
            points.push(data.len());
            points.sort_unstable();
            points.dedup();

            for w in points.windows(2) {
                prop_assert!(r.valid_len(ch) <= r.expected_len(ch));
                r.feed(ch, &data[w[0]..w[1]]).unwrap();
            }

            let done = done.lock().unwrap();
            prop_assert_eq!(done.len(), 1);
            prop_assert_eq!(&done[0].1, &data);
        }
    }
}
