//! Property-based tests for the tether wire formats.
//!
//! Decoders must never panic on hostile input, and shards produced under a
//! protocol cap must stay under that cap once view info is attached.

use bytes::Bytes;
use proptest::prelude::*;
use tether_transport::pump::DirectVideoHeader;
use tether_transport::shard::FrameSharder;
use tether_transport::topic::{encode_topic, TopicFramer, TopicHeader};
use tether_transport::wire::*;

fn view_info(display_time: i64) -> ViewInfo {
    ViewInfo {
        display_time,
        pose: Pose::default(),
    }
}

// ─── Decoder Robustness ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let bytes = Bytes::from(data.clone());
        let _ = decode_hostinfo(bytes.clone());
        let _ = StreamPacket::decode(bytes);
        let _ = EchoPayload::decode(&data);
        let _ = CapnpSegmentHeader::decode(&data);
        let _ = TopicHeader::decode(&data);
        let _ = DirectVideoHeader::decode(&data);

        let mut framer = TopicFramer::new();
        let _ = framer.push(&data, 0);
    }

    #[test]
    fn truncated_stream_packets_are_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..64,
    ) {
        let shard = DataShard {
            stream_idx: 1,
            frame_idx: 77,
            shard_idx: 3,
            flags: ShardFlags::START_OF_SLICE | ShardFlags::END_OF_FRAME,
            view_info: Some(view_info(5)),
            payload: Bytes::from(payload),
        };
        let encoded = StreamPacket::Data(shard).encode();
        let cut = cut.min(encoded.len() - 1);
        prop_assert!(StreamPacket::decode(encoded.slice(..encoded.len() - cut)).is_err());
    }

    /// Corrupting a topic stream never takes the framer down, and framing
    /// resumes once clean packets arrive in a fresh chunk.
    #[test]
    fn framer_recovers_after_garbage(
        garbage in proptest::collection::vec(any::<u8>(), 1..64),
        payload in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let mut framer = TopicFramer::new();
        let _ = framer.push(&garbage, 0);
        framer.reset();

        let packet = encode_topic(3, 9, &payload).unwrap();
        let out = framer.push(&packet, 1);
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(&out[0].payload[..], &payload[..]);
    }
}

// ─── Sharding Under The Protocol Cap ───────────────────────────────────────

proptest! {
    #[test]
    fn last_shard_fits_cap_with_view_info(
        len in 1usize..5_000,
        split in 1usize..1_400,
        cap in (VIEW_INFO_SIZE + 1)..1_400usize,
    ) {
        let split = split.min(cap);
        let data = Bytes::from(vec![0xA5u8; len]);
        let mut sharder = FrameSharder::new();
        sharder.push(1, 0, data, split);
        let frame = sharder.finish_frame(view_info(1), cap).unwrap();

        let last = frame.shards.last().unwrap();
        prop_assert!(last.view_info.is_some());
        prop_assert!(last.payload.len() + VIEW_INFO_SIZE <= cap);
        for s in &frame.shards {
            prop_assert!(s.payload.len() <= split);
        }

        let total: usize = frame.shards.iter().map(|s| s.payload.len()).sum();
        prop_assert_eq!(total, len);
    }

    #[test]
    fn slice_markers_bracket_every_push(
        slices in proptest::collection::vec(1usize..900, 1..6),
        split in 16usize..400,
    ) {
        let mut sharder = FrameSharder::new();
        for (i, len) in slices.iter().enumerate() {
            sharder.push(4, 2, Bytes::from(vec![i as u8; *len]), split);
        }
        let frame = sharder.finish_frame(view_info(2), 1_400).unwrap();

        let starts = frame.shards.iter().filter(|s| s.flags.contains(ShardFlags::START_OF_SLICE)).count();
        let ends = frame.shards.iter().filter(|s| s.flags.contains(ShardFlags::END_OF_SLICE)).count();
        // A view-info carrier adds one single-shard slice.
        let carrier = usize::from(frame.shards.last().unwrap().payload.is_empty());
        prop_assert_eq!(starts, slices.len() + carrier);
        prop_assert_eq!(ends, slices.len() + carrier);
        prop_assert!(frame.shards[0].flags.contains(ShardFlags::START_OF_SLICE));
    }
}
