//! Terminator framing: packet text followed by `E2 8F 8E`.
//!
//! The terminator is the UTF-8 encoding of U+23CE ("⏎"). The encoder writes
//! ASCII-only JSON (non-ASCII characters become `\uXXXX` escapes), so the
//! terminator cannot occur inside a frame we produce.
//!
//! [`FrameDecoder`] is sans-IO: callers append whatever a read returned and
//! pull complete frames out. Several packets may arrive in one read and a
//! packet may straddle reads; bytes after a terminator always stay buffered
//! for the next scan.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::packet::Packet;

/// Frame terminator.
pub const TERMINATOR: [u8; 3] = [0xE2, 0x8F, 0x8E];

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Error encoding a packet into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    /// JSON serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error pulling a packet out of the byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// No terminator within the allowed frame size.
    #[error("frame exceeds {max} bytes without a terminator")]
    TooLarge {
        /// Configured limit
        max: usize,
    },
    /// Frame body is not a valid packet.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Encode a packet into a single frame: ASCII JSON + terminator.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::with_capacity(256);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    packet.serialize(&mut serializer)?;
    out.extend_from_slice(&TERMINATOR);
    Ok(out)
}

/// Decode one frame body (terminator already stripped).
pub fn decode_packet(frame: &[u8]) -> Result<Packet, FrameDecodeError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Compact JSON with every non-ASCII character escaped.
struct AsciiFormatter;

impl serde_json::ser::Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }

            writer.write_all(&fragment.as_bytes()[start..index])?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                writer.write_all(format!("\\u{unit:04x}").as_bytes())?;
            }
            start = index + ch.len_utf8();
        }

        writer.write_all(&fragment.as_bytes()[start..])
    }
}

/// Incremental frame splitter.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { buffer: BytesMut::with_capacity(8 * 1024), scanned: 0, max_frame_len }
    }

    /// Buffer to read into (e.g. with `AsyncReadExt::read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameDecodeError> {
        let start = self.scanned.min(self.buffer.len());

        if let Some(offset) = find_terminator(&self.buffer[start..]) {
            let end = start + offset;
            if end > self.max_frame_len {
                return Err(FrameDecodeError::TooLarge { max: self.max_frame_len });
            }

            let frame = self.buffer.split_to(end).freeze();
            self.buffer.advance(TERMINATOR.len());
            self.scanned = 0;
            return Ok(Some(frame));
        }

        // The tail may hold the first bytes of a terminator
        let settled = self.buffer.len().saturating_sub(TERMINATOR.len() - 1);
        if settled > self.max_frame_len {
            return Err(FrameDecodeError::TooLarge { max: self.max_frame_len });
        }
        self.scanned = settled;

        Ok(None)
    }

    /// Pop and decode the next complete packet.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameDecodeError> {
        self.next_frame()?.map(|frame| decode_packet(&frame)).transpose()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack.windows(TERMINATOR.len()).position(|window| window == TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Phase, Reason, SessionToken, VerificationKey};

    fn relay_packet(text: &str) -> Packet {
        let mut packet = Packet::new_round(SessionToken::new("s-1"), 2);
        packet.from_key = Some(VerificationKey::new("alice"));
        packet.to_key = Some(VerificationKey::default());
        packet.phase = Phase::Shuffle;
        if let Some(message) = packet.message.as_mut() {
            message.text = Some(text.to_string());
        }
        packet
    }

    #[test]
    fn roundtrip_single_frame() {
        let packet = relay_packet("hello");
        let frame = encode_frame(&packet).unwrap();
        assert!(frame.ends_with(&TERMINATOR));

        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&frame);

        assert_eq!(decoder.next_packet().unwrap(), Some(packet));
        assert_eq!(decoder.next_packet().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn coalesced_frames_are_all_delivered() {
        let a = relay_packet("a");
        let b = Packet::blame(Reason::Liar);
        let c = Packet::announcement(3);

        let mut decoder = FrameDecoder::default();
        for packet in [&a, &b, &c] {
            decoder.extend_from_slice(&encode_frame(packet).unwrap());
        }

        assert_eq!(decoder.next_packet().unwrap(), Some(a));
        assert_eq!(decoder.next_packet().unwrap(), Some(b));
        assert_eq!(decoder.next_packet().unwrap(), Some(c));
        assert_eq!(decoder.next_packet().unwrap(), None);
    }

    #[test]
    fn trailing_fragment_is_carried_to_next_read() {
        let a = relay_packet("first");
        let b = relay_packet("second");
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();

        let mut decoder = FrameDecoder::default();
        let mut first_read = fa.clone();
        first_read.extend_from_slice(&fb[..5]);
        decoder.extend_from_slice(&first_read);

        assert_eq!(decoder.next_packet().unwrap(), Some(a));
        assert_eq!(decoder.next_packet().unwrap(), None);
        assert_eq!(decoder.buffered(), 5);

        decoder.extend_from_slice(&fb[5..]);
        assert_eq!(decoder.next_packet().unwrap(), Some(b));
    }

    #[test]
    fn terminator_split_across_reads() {
        let packet = relay_packet("split");
        let frame = encode_frame(&packet).unwrap();
        let cut = frame.len() - 2;

        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&frame[..cut]);
        assert_eq!(decoder.next_packet().unwrap(), None);

        decoder.extend_from_slice(&frame[cut..]);
        assert_eq!(decoder.next_packet().unwrap(), Some(packet));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend_from_slice(&[b'x'; 32]);

        assert!(matches!(decoder.next_frame(), Err(FrameDecodeError::TooLarge { max: 16 })));
    }

    #[test]
    fn oversized_frame_with_terminator_is_rejected() {
        let mut decoder = FrameDecoder::new(4);
        decoder.extend_from_slice(b"{\"number\":1}");
        decoder.extend_from_slice(&TERMINATOR);

        assert!(matches!(decoder.next_frame(), Err(FrameDecodeError::TooLarge { .. })));
    }

    #[test]
    fn frame_at_limit_is_accepted() {
        let mut decoder = FrameDecoder::new(2);
        decoder.extend_from_slice(b"{}");
        decoder.extend_from_slice(&TERMINATOR);

        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::default()));
    }

    #[test]
    fn garbage_frame_fails_to_decode() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(b"not json");
        decoder.extend_from_slice(&TERMINATOR);

        assert!(matches!(decoder.next_packet(), Err(FrameDecodeError::Decode(_))));
    }

    #[test]
    fn empty_frame_fails_to_decode() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&TERMINATOR);

        assert!(matches!(decoder.next_packet(), Err(FrameDecodeError::Decode(_))));
    }

    #[test]
    fn non_ascii_text_is_escaped() {
        let packet = relay_packet("return \u{23ce} and \u{1f600}");
        let frame = encode_frame(&packet).unwrap();
        let body = &frame[..frame.len() - TERMINATOR.len()];

        assert!(body.is_ascii());
        assert!(find_terminator(body).is_none());
        let text = std::str::from_utf8(body).unwrap();
        assert!(text.contains(r"\u23ce"));
        assert!(text.contains(r"\ud83d\ude00"));

        assert_eq!(decode_packet(body).unwrap(), packet);
    }

    #[test]
    fn accepts_client_text_with_spaces() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(
            br#"{ "fromKey": { "key": "12345" }, "registration": { "amount": "1337" } }"#,
        );
        decoder.extend_from_slice(&TERMINATOR);

        let packet = decoder.next_packet().unwrap().unwrap();
        assert_eq!(packet.sender_key(), Some("12345"));
        assert_eq!(packet.amount(), Some(1337));
    }
}
