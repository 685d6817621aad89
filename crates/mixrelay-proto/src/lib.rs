//! Wire protocol for the mixrelay shuffle relay.
//!
//! Two layers, both sans-IO:
//!
//! - [`packet`]: the structured record exchanged with clients. The server only
//!   reads a handful of fields (session binding, keys, phase, blame); every
//!   other field is carried through untouched so relayed packets reach their
//!   destination exactly as the sender wrote them.
//! - [`frame`]: splits a continuous byte stream into packets using a fixed
//!   three-byte terminator, and writes packets back out the same way.
//!
//! ```text
//! bytes ─▶ FrameDecoder ─▶ Packet ─▶ (server) ─▶ encode_frame ─▶ bytes
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod packet;

pub use frame::{
    DEFAULT_MAX_FRAME_LEN, FrameDecodeError, FrameDecoder, FrameEncodeError, TERMINATOR,
    decode_packet, encode_frame,
};
pub use packet::{
    Blame, Message, NEW_ROUND_MESSAGE, Packet, Phase, Reason, Recipient, Registration,
    SessionToken, VerificationKey,
};
