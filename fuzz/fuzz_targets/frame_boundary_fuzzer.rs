//! Fuzz target for [`FrameDecoder`]
//!
//! Hostile byte streams must never panic the decoder or let a frame past the
//! size limit.
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary input split into arbitrary reads
//! - Terminator stress: partial terminators straddling read boundaries
//! - Valid frames interleaved with garbage
//!
//! # Invariants
//!
//! - Returned frames never contain the terminator
//! - Returned frames never exceed the configured limit
//! - After `TooLarge`, the buffer held more than the limit with no terminator
//! - Bytes in == bytes returned + terminators + bytes still buffered
//! - NEVER panic on malformed input

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mixrelay_proto::{FrameDecodeError, FrameDecoder, Packet, TERMINATOR, encode_frame};

#[derive(Debug, Clone, Arbitrary)]
enum Chunk {
    Raw(Vec<u8>),
    Terminator,
    PartialTerminator(bool),
    Frame { seat: u8, text: String },
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    max_frame_len: u16,
    chunks: Vec<Chunk>,
}

fn chunk_bytes(chunk: &Chunk) -> Vec<u8> {
    match chunk {
        Chunk::Raw(bytes) => bytes.clone(),
        Chunk::Terminator => TERMINATOR.to_vec(),
        Chunk::PartialTerminator(long) => {
            if *long { TERMINATOR[..2].to_vec() } else { TERMINATOR[..1].to_vec() }
        },
        Chunk::Frame { seat, text } => {
            let mut packet = Packet::announcement(u32::from(*seat));
            packet.extra.insert("note".to_string(), text.clone().into());
            encode_frame(&packet).unwrap_or_default()
        },
    }
}

fuzz_target!(|input: FuzzInput| {
    let max = usize::from(input.max_frame_len);
    let mut decoder = FrameDecoder::new(max);
    let mut fed = 0usize;
    let mut consumed = 0usize;

    for chunk in &input.chunks {
        let bytes = chunk_bytes(chunk);
        fed += bytes.len();
        decoder.extend_from_slice(&bytes);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    assert!(frame.len() <= max, "frame over limit");
                    assert!(
                        !frame.windows(TERMINATOR.len()).any(|w| w == TERMINATOR),
                        "terminator inside frame"
                    );
                    consumed += frame.len() + TERMINATOR.len();
                    // Decoding may fail; it must not panic
                    let _ = mixrelay_proto::decode_packet(&frame);
                },
                Ok(None) => break,
                Err(FrameDecodeError::TooLarge { max: limit }) => {
                    assert_eq!(limit, max);
                    return;
                },
                Err(FrameDecodeError::Decode(_)) => unreachable!("next_frame never decodes"),
            }
        }

        assert_eq!(fed, consumed + decoder.buffered(), "bytes lost or duplicated");
    }
});
