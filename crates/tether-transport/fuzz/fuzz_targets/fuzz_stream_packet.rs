#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tether_transport::codec::FrameCollector;
use tether_transport::wire::StreamPacket;

/// Fuzz stream packet decoding and frame collection.
///
/// Input is split on 0xFF bytes into datagrams. Whatever decodes is handed to
/// a collector, which must never panic on inconsistent shard metadata.
fuzz_target!(|data: &[u8]| {
    let mut collector = FrameCollector::new(4);
    for datagram in data.split(|b| *b == 0xFF) {
        if let Ok(pkt) = StreamPacket::decode(Bytes::copy_from_slice(datagram)) {
            let _ = collector.ingest(pkt);
        }
    }
    let _ = collector.try_complete(0, 0);
});
