//! Pool Directory
//!
//! Registry of every pool on the server. Places newly registered peers into a
//! pool with a free seat, creating pools on demand.
//!
//! Lock order is directory, then pool. The directory lock is only held while
//! placing a peer or starting shutdown; relay traffic takes pool locks alone.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use mixrelay_proto::{Packet, SessionToken};
use tokio::sync::Mutex;

use crate::{
    pool::{Member, Pool, PoolAction, PoolCapacity, PoolError},
    session::{DisconnectReason, PeerCommand, PeerMailbox},
};

/// Arena index of a pool within its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(usize);

impl PoolId {
    /// Position in creation order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Pool state plus the mailboxes of its members.
struct PoolRoom {
    pool: Pool,
    mailboxes: HashMap<SessionToken, PeerMailbox>,
}

impl PoolRoom {
    /// Deliver actions to member mailboxes. Called with the pool lock held.
    ///
    /// A member whose mailbox is down to its last slot is unseated and sent
    /// a forced disconnect in that slot instead of the packet.
    fn dispatch(&mut self, actions: Vec<PoolAction>) {
        let mut pending = VecDeque::from(actions);
        while let Some(action) = pending.pop_front() {
            match action {
                PoolAction::Send { to, packet } => {
                    let Some(mailbox) = self.mailboxes.get(&to) else {
                        tracing::debug!(session = %to, "dropping packet for departed member");
                        continue;
                    };
                    if mailbox.capacity() > 1 {
                        if mailbox.try_send(PeerCommand::Send(packet)).is_err() {
                            tracing::debug!(session = %to, "dropping packet for closed session");
                        }
                        continue;
                    }

                    tracing::warn!(session = %to, "member not keeping up, disconnecting");
                    for followup in self.pool.leave(&to).into_iter().rev() {
                        pending.push_front(followup);
                    }
                    pending.push_front(PoolAction::Disconnect {
                        session: to,
                        reason: DisconnectReason::Overloaded,
                    });
                },
                PoolAction::Disconnect { session, reason } => {
                    if let Some(mailbox) = self.mailboxes.remove(&session) {
                        let _ = mailbox.try_send(PeerCommand::Disconnect(reason));
                    }
                },
            }
        }
    }
}

/// Shared handle to one pool.
#[derive(Clone)]
pub struct PoolHandle {
    id: PoolId,
    room: Arc<Mutex<PoolRoom>>,
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PoolHandle {
    fn new(id: PoolId, capacity: PoolCapacity) -> Self {
        let room = PoolRoom { pool: Pool::new(capacity), mailboxes: HashMap::new() };
        Self { id, room: Arc::new(Mutex::new(room)) }
    }

    /// Identifier within the directory.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    async fn join(&self, member: Member, mailbox: PeerMailbox) -> Result<(), PoolError> {
        let mut room = self.room.lock().await;
        let session = member.session.clone();
        let actions = room.pool.join(member)?;

        room.mailboxes.insert(session, mailbox);
        room.dispatch(actions);
        Ok(())
    }

    /// Remove a member. Safe to call for sessions already removed.
    pub async fn leave(&self, session: &SessionToken) {
        let mut room = self.room.lock().await;
        room.mailboxes.remove(session);
        let actions = room.pool.leave(session);
        room.dispatch(actions);
    }

    /// Forward a packet from `from` to its recipients in this pool.
    ///
    /// Returns `false`, routing nothing, if `from` is no longer seated.
    pub async fn route(&self, from: &SessionToken, packet: &Packet) -> bool {
        let mut room = self.room.lock().await;
        if !room.mailboxes.contains_key(from) {
            return false;
        }
        let actions = room.pool.route(packet);
        room.dispatch(actions);
        true
    }

    /// Record a liar accusation from the member on session `from`, banning
    /// the accused once enough members agree.
    ///
    /// Returns `false`, counting nothing, if `from` is no longer seated.
    pub async fn register_ban_vote(&self, from: &SessionToken, accused: &str, voter: &str) -> bool {
        let mut room = self.room.lock().await;
        if !room.mailboxes.contains_key(from) {
            return false;
        }
        let actions = room.pool.register_ban_vote(accused, voter);
        room.dispatch(actions);
        true
    }

    /// Stop admitting members and silence membership notices.
    pub async fn begin_shutdown(&self) {
        self.room.lock().await.pool.begin_shutdown();
    }

    /// `(session, seat)` for every member, in seat order.
    pub async fn seats(&self) -> Vec<(SessionToken, u32)> {
        let room = self.room.lock().await;
        room.pool.members().iter().map(|m| (m.session.clone(), m.seat())).collect()
    }

    /// Number of seated members.
    pub async fn len(&self) -> usize {
        self.room.lock().await.pool.len()
    }

    /// Whether a key was voted out of this pool.
    pub async fn is_banned(&self, key: &str) -> bool {
        self.room.lock().await.pool.is_banned(key)
    }

    /// Distinct accusers recorded against a key.
    pub async fn ban_votes(&self, key: &str) -> usize {
        self.room.lock().await.pool.ban_votes(key)
    }

    async fn has_free_seat(&self) -> bool {
        !self.room.lock().await.pool.is_full()
    }
}

struct DirectoryState {
    pools: Vec<PoolHandle>,
    shutting_down: bool,
}

/// Registry of pools.
pub struct PoolDirectory {
    capacity: PoolCapacity,
    state: Mutex<DirectoryState>,
}

impl PoolDirectory {
    /// Create an empty directory whose pools have `capacity` seats.
    #[must_use]
    pub fn new(capacity: PoolCapacity) -> Self {
        Self { capacity, state: Mutex::new(DirectoryState { pools: Vec::new(), shutting_down: false }) }
    }

    /// Capacity of every pool.
    #[must_use]
    pub fn capacity(&self) -> PoolCapacity {
        self.capacity
    }

    /// A pool with a free seat, created if none exists.
    pub async fn get_or_create_pool(&self) -> PoolHandle {
        let mut state = self.state.lock().await;
        Self::select_pool(&mut state, self.capacity).await
    }

    /// Seat a member in the first pool with a free seat.
    ///
    /// Selection and join happen under the directory lock, so concurrent
    /// registrations never overfill a pool. The member's mailbox receives the
    /// acknowledgement before any other pool traffic.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` once shutdown has begun
    /// - `Banned` if the selected pool voted this key out
    pub async fn assign(&self, member: Member, mailbox: PeerMailbox) -> Result<PoolHandle, PoolError> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        let pool = Self::select_pool(&mut state, self.capacity).await;
        pool.join(member, mailbox).await?;
        Ok(pool)
    }

    /// Mark every pool as shutting down and refuse further placement.
    pub async fn begin_shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        for pool in &state.pools {
            pool.begin_shutdown().await;
        }
    }

    /// Number of pools created so far.
    pub async fn pool_count(&self) -> usize {
        self.state.lock().await.pools.len()
    }

    /// Look up a pool by id.
    pub async fn pool(&self, id: PoolId) -> Option<PoolHandle> {
        self.state.lock().await.pools.get(id.0).cloned()
    }

    async fn select_pool(state: &mut DirectoryState, capacity: PoolCapacity) -> PoolHandle {
        for pool in &state.pools {
            if pool.has_free_seat().await {
                return pool.clone();
            }
        }

        let pool = PoolHandle::new(PoolId(state.pools.len()), capacity);
        tracing::info!(pool = %pool.id(), seats = capacity.get(), "pool created");
        state.pools.push(pool.clone());
        pool
    }
}
