//! Fuzz target for the wire frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Arbitrary bytes arrive on a connection. The decoder must either yield
//! frames, ask for more input, or fail with a protocol error; it must never
//! panic or return a frame larger than the configured maximum.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sosd_core::protocol::{HEADER_LEN, SosCodec};
use tokio_util::codec::Decoder;

const MAX_FRAME: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let mut codec = SosCodec::new(MAX_FRAME);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        assert!(frame.wire_len() >= HEADER_LEN);
        assert!(frame.wire_len() <= MAX_FRAME);
        let _ = frame.body::<serde_json::Value>();
    }
});
