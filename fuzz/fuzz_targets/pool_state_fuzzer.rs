//! Fuzz target for [`Pool`] state machine
//!
//! Arbitrary join/leave/vote/route sequences must keep membership sane.
//!
//! # Invariants
//!
//! - Seats are exactly `1..=len` after every operation
//! - Membership never exceeds capacity
//! - A banned key never holds a seat and never rejoins
//! - Ban tallies never decrease
//! - Announcement only on the join that fills the pool
//! - NEVER panic on any operation order

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mixrelay_proto::{Packet, Phase, SessionToken, VerificationKey};
use mixrelay_server::{Member, Pool, PoolAction, PoolCapacity, PoolError};

#[derive(Debug, Clone, Arbitrary)]
enum PoolOp {
    Join { key: u8 },
    Leave { slot: u8 },
    Vote { accused: u8, voter: u8 },
    Route { to: Option<u8> },
    Shutdown,
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    capacity: u8,
    ops: Vec<PoolOp>,
}

fn key(k: u8) -> String {
    format!("k{}", k % 8)
}

fuzz_target!(|input: FuzzInput| {
    let Ok(capacity) = PoolCapacity::try_from(u32::from(input.capacity % 10)) else {
        return;
    };
    let mut pool = Pool::new(capacity);
    let mut next_session = 0u32;
    let mut tallies = std::collections::HashMap::<String, usize>::new();

    for op in input.ops {
        match op {
            PoolOp::Join { key: k } => {
                next_session += 1;
                let was_full = pool.is_full();
                let banned = pool.is_banned(&key(k));
                let session = SessionToken::new(format!("s{next_session}"));

                match pool.join(Member::new(session, key(k), 1)) {
                    Ok(actions) => {
                        assert!(!banned && !was_full);
                        let announced = actions.iter().any(|a| {
                            matches!(a, PoolAction::Send { packet, .. } if packet.phase == Phase::Announcement)
                        });
                        assert_eq!(announced, pool.is_full());
                    },
                    Err(PoolError::Banned(_)) => assert!(banned),
                    Err(PoolError::Full) => assert!(was_full),
                    Err(PoolError::ShuttingDown) => assert!(pool.is_shutting_down()),
                    Err(PoolError::InvalidCapacity(_)) => unreachable!(),
                }
            },
            PoolOp::Leave { slot } => {
                let session = pool
                    .members()
                    .get(usize::from(slot) % pool.len().max(1))
                    .map(|m| m.session.clone());
                if let Some(session) = session {
                    pool.leave(&session);
                }
            },
            PoolOp::Vote { accused, voter } => {
                pool.register_ban_vote(&key(accused), &key(voter));
            },
            PoolOp::Route { to } => {
                let packet = Packet {
                    to_key: Some(to.map_or_else(VerificationKey::default, |k| VerificationKey::new(key(k)))),
                    ..Packet::default()
                };
                let sent = pool.route(&packet).len();
                let expected = pool
                    .members()
                    .iter()
                    .filter(|m| to.is_none_or(|k| m.key == key(k)))
                    .count();
                assert_eq!(sent, expected);
            },
            PoolOp::Shutdown => pool.begin_shutdown(),
        }

        assert!(pool.len() <= capacity.get() as usize);
        for (index, member) in pool.members().iter().enumerate() {
            assert_eq!(member.seat() as usize, index + 1);
            assert!(!pool.is_banned(&member.key));
        }
        for k in 0..8u8 {
            let now = pool.ban_votes(&key(k));
            let before = tallies.insert(key(k), now).unwrap_or(0);
            assert!(now >= before);
        }
    }
});
