#![no_main]

use std::io::Cursor;
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use relay_common::codec::read_frame;

/// A bounded max-frame-len alongside arbitrary wire bytes, so the fuzzer explores both the
/// length-prefix rejection paths and the payload-reading loop.
#[derive(Debug, Arbitrary)]
struct Input {
    max_frame_len: u32,
    bytes: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut cursor = Cursor::new(input.bytes);
    let _ = read_frame(&mut cursor, input.max_frame_len, Duration::from_millis(1));
});
