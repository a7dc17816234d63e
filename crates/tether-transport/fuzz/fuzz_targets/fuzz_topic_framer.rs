#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_transport::topic::TopicFramer;

/// Fuzz the topic framer with arbitrary chunking.
///
/// The first byte picks a chunk size; the rest is fed in chunks of that size.
/// Every completed packet must hold exactly the bytes its header announced.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let chunk = chunk as usize + 1;
    let mut framer = TopicFramer::new();
    for piece in rest.chunks(chunk) {
        for pkt in framer.push(piece, 0) {
            assert!(pkt.payload.len() <= pkt.header.payload_size());
        }
    }
});
