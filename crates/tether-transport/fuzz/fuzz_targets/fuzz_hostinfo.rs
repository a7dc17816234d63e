#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tether_transport::clock::{ClockSync, EchoReply};
use tether_transport::wire::{decode_hostinfo, CapnpSegmentHeader, EchoPayload};

/// Fuzz hostinfo decoding and the echo / segment prefixes it carries.
///
/// None of these may panic; malformed input is an `Err`.
fuzz_target!(|data: &[u8]| {
    if let Ok(info) = decode_hostinfo(Bytes::copy_from_slice(data)) {
        if info.is_echo() {
            if let Ok(reply) = EchoReply::from_packet(&info) {
                // Match the reply against a ping sent at its own origin time.
                let mut sync = ClockSync::new();
                let req = sync.send_echo(reply.org);
                let reply = EchoReply { id: req.id, ..reply };
                let _ = sync.on_echo_reply(&reply, reply.xmt);
                let _ = sync.extend_device_timestamp(info.aux, 0, reply.recv);
            }
        }
        let _ = CapnpSegmentHeader::decode(&info.payload);
    }
    let _ = EchoPayload::decode(data);
});
