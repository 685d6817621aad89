//! Shuffle protocol packet.
//!
//! The text encoding follows the protobuf JSON mapping used by existing
//! shuffle clients: camelCase field names, enums by name, `bytes` as base64,
//! `uint64` as a decimal string, and default values omitted.
//!
//! ```text
//! {"fromKey":{"key":"12345"},"registration":{"amount":"1337"}}
//! ```
//!
//! Only the fields the relay acts on are modelled. Anything else (encryption
//! keys, hashes, signatures, transactions) lands in an `extra` map and is
//! written back verbatim when the packet is forwarded.

use std::{fmt, marker::PhantomData};

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Unexpected, Visitor},
};
use serde_json::{Map, Value};

/// Text carried by the notice a pool sends after a member leaves.
pub const NEW_ROUND_MESSAGE: &str = "New round";

/// Server-issued token binding packets to one connection.
///
/// On the wire this is a protobuf `bytes` field, so it travels base64
/// encoded. The server issues ASCII tokens, but whatever bytes a client
/// echoes back are compared verbatim.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionToken(Vec<u8>);

impl SessionToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the default (absent) token.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({self})")
    }
}

impl Serialize for SessionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SessionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        // protobuf JSON parsers accept both alphabets
        STANDARD
            .decode(&text)
            .or_else(|_| URL_SAFE.decode(&text))
            .map(Self)
            .map_err(|e| de::Error::custom(format!("session is not base64: {e}")))
    }
}

/// Protocol phase. Only `Announcement` and `Blame` mean anything to the
/// relay; the rest pass through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No phase (server acknowledgements and notices).
    #[default]
    None,
    /// Pool is full, the round may begin.
    Announcement,
    /// Shuffle phase.
    Shuffle,
    /// Broadcast of shuffled outputs.
    Broadcast,
    /// Equivocation check.
    EquivocationCheck,
    /// Transaction signing.
    Signing,
    /// Verification and submission.
    VerificationAndSubmission,
    /// Blame phase.
    Blame,
}

impl Phase {
    /// True for the default phase.
    pub fn is_none(&self) -> bool {
        *self == Self::None
    }
}

/// Reason attached to a blame message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Protobuf default value.
    #[default]
    InsufficientFunds,
    /// Input spent twice.
    DoubleSpend,
    /// Equivocation check failed.
    EquivocationFailure,
    /// Shuffle failed.
    ShuffleFailure,
    /// Shuffle and equivocation both failed.
    ShuffleAndEquivocationFailure,
    /// Bad signature.
    InvalidSignature,
    /// Output missing from the shuffle.
    MissingOutput,
    /// Accused lied; counts as a ban vote on the relay.
    Liar,
    /// Malformed packet; sent by the relay before it disconnects a peer.
    InvalidFormat,
}

impl Reason {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Enums encoded by name, accepted by name or by protobuf number.
///
/// Table order is the protobuf numbering.
trait WireEnum: Copy + PartialEq + 'static {
    const KIND: &'static str;
    const TABLE: &'static [(Self, &'static str)];

    fn wire_name(self) -> &'static str {
        Self::TABLE.iter().find(|(value, _)| *value == self).map_or("", |(_, name)| *name)
    }
}

impl WireEnum for Phase {
    const KIND: &'static str = "phase";
    const TABLE: &'static [(Self, &'static str)] = &[
        (Self::None, "NONE"),
        (Self::Announcement, "ANNOUNCEMENT"),
        (Self::Shuffle, "SHUFFLE"),
        (Self::Broadcast, "BROADCAST"),
        (Self::EquivocationCheck, "EQUIVOCATION_CHECK"),
        (Self::Signing, "SIGNING"),
        (Self::VerificationAndSubmission, "VERIFICATION_AND_SUBMISSION"),
        (Self::Blame, "BLAME"),
    ];
}

impl WireEnum for Reason {
    const KIND: &'static str = "blame reason";
    const TABLE: &'static [(Self, &'static str)] = &[
        (Self::InsufficientFunds, "INSUFFICIENTFUNDS"),
        (Self::DoubleSpend, "DOUBLESPEND"),
        (Self::EquivocationFailure, "EQUIVOCATIONFAILURE"),
        (Self::ShuffleFailure, "SHUFFLEFAILURE"),
        (Self::ShuffleAndEquivocationFailure, "SHUFFLEANDEQUIVOCATIONFAILURE"),
        (Self::InvalidSignature, "INVALIDSIGNATURE"),
        (Self::MissingOutput, "MISSINGOUTPUT"),
        (Self::Liar, "LIAR"),
        (Self::InvalidFormat, "INVALIDFORMAT"),
    ];
}

struct WireEnumVisitor<T>(PhantomData<T>);

impl<T: WireEnum> Visitor<'_> for WireEnumVisitor<T> {
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {} name or number", T::KIND)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
        T::TABLE
            .iter()
            .find(|(_, name)| *name == v)
            .map(|(value, _)| *value)
            .ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
        usize::try_from(v)
            .ok()
            .and_then(|index| T::TABLE.get(index))
            .map(|(value, _)| *value)
            .ok_or_else(|| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
        u64::try_from(v)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            .and_then(|v| self.visit_u64(v))
    }
}

macro_rules! wire_enum_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.wire_name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(WireEnumVisitor::<Self>(PhantomData))
            }
        }
    };
}

wire_enum_serde!(Phase);
wire_enum_serde!(Reason);

/// Reference to a verification key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    /// Key text. Empty in `toKey` means broadcast.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl VerificationKey {
    /// Reference the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Registration data, present on a session's first packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Declared amount.
    #[serde(default, with = "u64_text", skip_serializing_if = "is_zero_u64")]
    pub amount: u64,
    /// Fields the relay does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Blame record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blame {
    /// Why the accused is blamed.
    #[serde(default, skip_serializing_if = "Reason::is_default")]
    pub reason: Reason,
    /// Who is blamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accused: Option<VerificationKey>,
    /// Evidence and other fields the relay does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message body. A protobuf `oneof`: normally at most one member is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Freeform text (`str` on the wire).
    #[serde(rename = "str", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Blame record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blame: Option<Blame>,
    /// Addresses, keys, hashes, signatures, chained messages.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One application packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Session binding token.
    #[serde(default, skip_serializing_if = "SessionToken::is_empty")]
    pub session: SessionToken,
    /// Seat number within the pool (`number` on the wire).
    #[serde(rename = "number", default, skip_serializing_if = "is_zero_u32")]
    pub seat: u32,
    /// Sender's verification key.
    #[serde(rename = "fromKey", alias = "from_key", default, skip_serializing_if = "Option::is_none")]
    pub from_key: Option<VerificationKey>,
    /// Recipient's verification key; empty key means broadcast.
    #[serde(rename = "toKey", alias = "to_key", default, skip_serializing_if = "Option::is_none")]
    pub to_key: Option<VerificationKey>,
    /// Protocol phase.
    #[serde(default, skip_serializing_if = "Phase::is_none")]
    pub phase: Phase,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Registration data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
    /// Fields the relay does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a relayed packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient<'a> {
    /// Every pool member.
    Broadcast,
    /// Members registered under this verification key.
    Key(&'a str),
}

impl Packet {
    /// Registration request a client sends first.
    pub fn register(key: impl Into<String>, amount: u64) -> Self {
        Self {
            from_key: Some(VerificationKey::new(key)),
            registration: Some(Registration { amount, extra: Map::new() }),
            ..Self::default()
        }
    }

    /// Server reply to a registration: token and seat, nothing else.
    pub fn acknowledgement(session: SessionToken, seat: u32) -> Self {
        Self { session, seat, ..Self::default() }
    }

    /// Round start, sent to every member once a pool is full.
    pub fn announcement(pool_size: u32) -> Self {
        Self { seat: pool_size, phase: Phase::Announcement, ..Self::default() }
    }

    /// Notice that membership changed; carries the member's new seat.
    pub fn new_round(session: SessionToken, seat: u32) -> Self {
        Self {
            session,
            seat,
            message: Some(Message {
                text: Some(NEW_ROUND_MESSAGE.to_string()),
                ..Message::default()
            }),
            ..Self::default()
        }
    }

    /// Blame sent by the server itself.
    pub fn blame(reason: Reason) -> Self {
        Self {
            message: Some(Message {
                blame: Some(Blame { reason, ..Blame::default() }),
                ..Message::default()
            }),
            ..Self::default()
        }
    }

    /// Sender key, if any.
    pub fn sender_key(&self) -> Option<&str> {
        self.from_key.as_ref().map(|k| k.key.as_str())
    }

    /// Routing target. `None` when `toKey` is missing altogether.
    pub fn recipient(&self) -> Option<Recipient<'_>> {
        self.to_key.as_ref().map(|k| {
            if k.key.is_empty() { Recipient::Broadcast } else { Recipient::Key(&k.key) }
        })
    }

    /// Declared amount from the registration block.
    pub fn amount(&self) -> Option<u64> {
        self.registration.as_ref().map(|r| r.amount)
    }

    /// Freeform message text.
    pub fn text(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.text.as_deref())
    }

    /// Blame record, if the message carries one.
    pub fn blame_record(&self) -> Option<&Blame> {
        self.message.as_ref().and_then(|m| m.blame.as_ref())
    }

    /// Accused key when this packet is a `LIAR` blame in the blame phase.
    pub fn liar_accusation(&self) -> Option<&str> {
        if self.phase != Phase::Blame {
            return None;
        }

        let blame = self.blame_record()?;
        if blame.reason != Reason::Liar {
            return None;
        }

        blame.accused.as_ref().map(|k| k.key.as_str()).filter(|k| !k.is_empty())
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// `uint64` as protobuf JSON writes it: a decimal string. Numbers are
/// accepted too.
mod u64_text {
    use std::fmt;

    use serde::{Deserializer, Serializer, de};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(U64TextVisitor)
    }

    struct U64TextVisitor;

    impl de::Visitor<'_> for U64TextVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}
