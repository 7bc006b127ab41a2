//! Fuzz target for consensus message decoding.
//!
//! Peers send arbitrary bytes; decoding must never panic, and anything that
//! decodes must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = hiera_consensus::ConsensusMessage::decode(data) {
        let _ = message.channel();
        let _ = message.sequence();
        assert!(message.encode().is_ok());
    }

    let _ = serde_json::from_slice::<hiera_consensus::Envelope>(data);
});
