//! Pool
//!
//! A fixed-capacity group of peers relayed together for one shuffle round.
//!
//! ## Responsibilities
//!
//! - Membership: join order defines seats `1..=len`, re-derived on every
//!   departure
//! - Round start: one announcement when the pool reaches capacity
//! - Routing: broadcast or unicast by verification key
//! - Ban votes: `capacity - 1` distinct accusers expel a key for the life of
//!   the pool
//!
//! ## Design
//!
//! The pool is sans-IO. Every operation returns [`PoolAction`]s that the
//! caller dispatches to session mailboxes while it still holds the pool lock,
//! so packets from one pool reach each mailbox in the order they were decided.

use std::collections::{HashMap, HashSet};

use mixrelay_proto::{Packet, Recipient, SessionToken};

use crate::session::DisconnectReason;

/// Pool capacity. Always at least two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolCapacity(u32);

impl PoolCapacity {
    /// Smallest usable capacity.
    pub const MIN: u32 = 2;

    /// Capacity used when none is configured.
    pub const DEFAULT: Self = Self(5);

    /// Number of seats.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Distinct accusers needed to ban a key.
    #[must_use]
    pub fn ban_threshold(self) -> usize {
        self.0 as usize - 1
    }
}

impl Default for PoolCapacity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for PoolCapacity {
    type Error = PoolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value < Self::MIN {
            return Err(PoolError::InvalidCapacity(value));
        }
        Ok(Self(value))
    }
}

/// One seated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Session token of the peer's connection
    pub session: SessionToken,
    /// Verification key declared at registration
    pub key: String,
    /// Declared amount
    pub amount: u64,
    seat: u32,
}

impl Member {
    /// Member not yet seated.
    pub fn new(session: SessionToken, key: impl Into<String>, amount: u64) -> Self {
        Self { session, key: key.into(), amount, seat: 0 }
    }

    /// Current 1-based seat, 0 before joining.
    #[must_use]
    pub fn seat(&self) -> u32 {
        self.seat
    }
}

/// Side effects requested by a pool operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolAction {
    /// Queue a packet on a member's connection
    Send {
        /// Recipient session
        to: SessionToken,
        /// Packet to deliver
        packet: Packet,
    },

    /// Force a member's connection closed
    Disconnect {
        /// Session to close
        session: SessionToken,
        /// Why it is being closed
        reason: DisconnectReason,
    },
}

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Capacity below the minimum
    #[error("pool capacity must be at least {min}, got {0}", min = PoolCapacity::MIN)]
    InvalidCapacity(u32),

    /// Key was voted out of this pool
    #[error("verification key {0:?} is banned from this pool")]
    Banned(String),

    /// Every seat is taken
    #[error("pool is full")]
    Full,

    /// Server is shutting down
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Membership, seating and ban state of one pool.
#[derive(Debug)]
pub struct Pool {
    capacity: PoolCapacity,
    members: Vec<Member>,
    /// Accused key -> distinct voter keys. Never shrinks.
    ban_votes: HashMap<String, HashSet<String>>,
    banned: HashSet<String>,
    shutting_down: bool,
}

impl Pool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(capacity: PoolCapacity) -> Self {
        Self {
            capacity,
            members: Vec::new(),
            ban_votes: HashMap::new(),
            banned: HashSet::new(),
            shutting_down: false,
        }
    }

    /// Seat a member.
    ///
    /// The new member is acknowledged with its token and seat. When this join
    /// fills the pool, every member is sent the round announcement.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` once shutdown has begun
    /// - `Banned` if the key was voted out of this pool
    /// - `Full` if no seat is free
    pub fn join(&mut self, mut member: Member) -> Result<Vec<PoolAction>, PoolError> {
        if self.shutting_down {
            return Err(PoolError::ShuttingDown);
        }
        if self.banned.contains(&member.key) {
            return Err(PoolError::Banned(member.key));
        }
        if self.is_full() {
            return Err(PoolError::Full);
        }

        member.seat = seat_for(self.members.len());
        let mut actions = vec![PoolAction::Send {
            to: member.session.clone(),
            packet: Packet::acknowledgement(member.session.clone(), member.seat),
        }];
        self.members.push(member);

        if self.is_full() {
            let announcement = Packet::announcement(self.capacity.get());
            actions.extend(self.members.iter().map(|m| PoolAction::Send {
                to: m.session.clone(),
                packet: announcement.clone(),
            }));
        }

        Ok(actions)
    }

    /// Remove a member. No-op if the session is not seated.
    ///
    /// Remaining members are renumbered and, unless shutting down, told about
    /// their new seat.
    pub fn leave(&mut self, session: &SessionToken) -> Vec<PoolAction> {
        let before = self.members.len();
        self.members.retain(|m| &m.session != session);
        if self.members.len() == before {
            return Vec::new();
        }

        self.renumber()
    }

    /// Fan a packet out to its recipients.
    ///
    /// A missing or empty `toKey` reaches every member, the sender included.
    /// Otherwise only members registered under that key receive it.
    #[must_use]
    pub fn route(&self, packet: &Packet) -> Vec<PoolAction> {
        let recipient = packet.recipient().unwrap_or(Recipient::Broadcast);

        self.members
            .iter()
            .filter(|m| match recipient {
                Recipient::Broadcast => true,
                Recipient::Key(key) => m.key == key,
            })
            .map(|m| PoolAction::Send { to: m.session.clone(), packet: packet.clone() })
            .collect()
    }

    /// Record that `voter` accuses `accused`.
    ///
    /// The tally counts distinct voters, not accusations: a voter repeating
    /// the same accusation adds nothing, so a ban needs `capacity - 1`
    /// different members. Self-accusations are ignored. Reaching the
    /// threshold bans the key and disconnects every member holding it.
    pub fn register_ban_vote(&mut self, accused: &str, voter: &str) -> Vec<PoolAction> {
        if accused.is_empty() || accused == voter {
            return Vec::new();
        }

        let voters = self.ban_votes.entry(accused.to_string()).or_default();
        voters.insert(voter.to_string());
        let tally = voters.len();

        if tally < self.capacity.ban_threshold() || self.banned.contains(accused) {
            return Vec::new();
        }

        tracing::info!(accused, tally, "verification key banned from pool");
        self.banned.insert(accused.to_string());

        let mut actions = Vec::new();
        self.members.retain(|m| {
            if m.key == accused {
                actions.push(PoolAction::Disconnect {
                    session: m.session.clone(),
                    reason: DisconnectReason::Banned,
                });
                false
            } else {
                true
            }
        });

        if !actions.is_empty() {
            actions.extend(self.renumber());
        }
        actions
    }

    /// Stop admitting members and silence membership notices.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> PoolCapacity {
        self.capacity
    }

    /// Current members in seat order.
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of seated members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when nobody is seated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True when every seat is taken.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity.get() as usize
    }

    /// Whether a key has been voted out.
    #[must_use]
    pub fn is_banned(&self, key: &str) -> bool {
        self.banned.contains(key)
    }

    /// Distinct accusers recorded against a key.
    #[must_use]
    pub fn ban_votes(&self, key: &str) -> usize {
        self.ban_votes.get(key).map_or(0, HashSet::len)
    }

    fn renumber(&mut self) -> Vec<PoolAction> {
        for (index, member) in self.members.iter_mut().enumerate() {
            member.seat = seat_for(index);
        }

        if self.shutting_down {
            return Vec::new();
        }

        self.members
            .iter()
            .map(|m| PoolAction::Send {
                to: m.session.clone(),
                packet: Packet::new_round(m.session.clone(), m.seat),
            })
            .collect()
    }
}

fn seat_for(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}
