//! Peer Session
//!
//! One connected client: registration, inbound validation, relay and
//! teardown.
//!
//! ## Lifecycle
//!
//! ```text
//! accept ─▶ Unregistered ─(first packet)─▶ Registered ─▶ Closed
//!                │                              │
//!                └──── invalid / banned ────────┘
//! ```
//!
//! Each session runs as a single task selecting over the server shutdown
//! signal, its mailbox (packets and forced disconnects queued by its pool)
//! and inbound frames. That task is the only writer to the transport.

use std::{fmt, sync::Arc, time::Duration};

use mixrelay_proto::{DEFAULT_MAX_FRAME_LEN, Packet, Reason, SessionToken};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
};

use crate::{
    directory::{PoolDirectory, PoolHandle},
    pool::{Member, PoolError},
    transport::{FramedTransport, TransportError},
};

/// Command queued for a session by its pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Write this packet to the peer
    Send(Packet),
    /// Close the connection
    Disconnect(DisconnectReason),
}

/// Sending half of a session's mailbox. Bounded; see
/// [`SessionConfig::mailbox_capacity`].
pub type PeerMailbox = mpsc::Sender<PeerCommand>;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the connection
    RemoteClosed,
    /// Read or write failed
    Transport(String),
    /// Packet failed validation
    InvalidPacket,
    /// Key was voted out of the pool
    Banned,
    /// No pool would take the peer
    Rejected(String),
    /// Peer fell too far behind on outbound packets
    Overloaded,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::InvalidPacket => write!(f, "invalid packet"),
            Self::Banned => write!(f, "banned"),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
            Self::Overloaded => write!(f, "outbound queue overflow"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest accepted inbound frame body
    pub max_frame_len: usize,
    /// Upper bound on writing one frame or closing the stream
    pub write_timeout: Duration,
    /// Packets queued for the peer before it is disconnected as too slow
    pub mailbox_capacity: usize,
}

impl SessionConfig {
    /// Default write timeout.
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default mailbox capacity.
    pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            mailbox_capacity: Self::DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Generate a fresh session token.
///
/// 16 bytes from the OS RNG, formatted as a hyphenated UUID. The token bytes
/// are that ASCII text.
///
/// # Errors
///
/// Returns error if the OS RNG is unavailable.
pub fn generate_token() -> Result<SessionToken, getrandom::Error> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes)?;

    let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
    Ok(SessionToken::new(id.hyphenated().to_string()))
}

enum SessionState {
    Unregistered,
    Registered { key: String, amount: u64, pool: PoolHandle },
}

/// A connected peer.
pub struct PeerSession<S> {
    token: SessionToken,
    transport: FramedTransport<S>,
    directory: Arc<PoolDirectory>,
    state: SessionState,
    mailbox: PeerMailbox,
    commands: mpsc::Receiver<PeerCommand>,
    shutdown: broadcast::Receiver<()>,
    write_timeout: Duration,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create an unregistered session over an established stream.
    pub fn new(
        token: SessionToken,
        stream: S,
        directory: Arc<PoolDirectory>,
        shutdown: broadcast::Receiver<()>,
        config: &SessionConfig,
    ) -> Self {
        // Room for the forced disconnect that follows a full queue
        let (mailbox, commands) = mpsc::channel(config.mailbox_capacity.max(2));

        Self {
            token,
            transport: FramedTransport::new(stream, config.max_frame_len),
            directory,
            state: SessionState::Unregistered,
            mailbox,
            commands,
            shutdown,
            write_timeout: config.write_timeout,
        }
    }

    /// Session token.
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Drive the session until it ends, then leave the pool and close the
    /// stream.
    pub async fn run(mut self) -> DisconnectReason {
        tracing::debug!(session = %self.token, "session started");

        let reason = self.drive().await;

        if let SessionState::Registered { key, amount, pool } = &self.state {
            tracing::debug!(session = %self.token, key = %key, amount, pool = %pool.id(), "leaving pool");
            pool.leave(&self.token).await;
        }
        match tokio::time::timeout(self.write_timeout, self.transport.close()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::debug!(session = %self.token, "close failed: {}", e),
            Err(_) => tracing::debug!(session = %self.token, "close timed out"),
        }

        tracing::info!(session = %self.token, %reason, "session closed");
        reason
    }

    async fn drive(&mut self) -> DisconnectReason {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => return DisconnectReason::Shutdown,

                command = self.commands.recv() => match command {
                    Some(PeerCommand::Send(packet)) => {
                        if let Err(reason) = self.write(&packet).await {
                            return reason;
                        }
                    },
                    Some(PeerCommand::Disconnect(reason)) => return reason,
                    None => return DisconnectReason::Shutdown,
                },

                inbound = self.transport.receive() => match inbound {
                    Ok(packet) => {
                        if let Err(reason) = self.handle_packet(packet).await {
                            return reason;
                        }
                    },
                    Err(TransportError::Closed) => return DisconnectReason::RemoteClosed,
                    Err(e) => {
                        tracing::debug!(session = %self.token, "receive failed: {}", e);
                        return DisconnectReason::Transport(e.to_string());
                    },
                },
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), DisconnectReason> {
        match &self.state {
            SessionState::Unregistered => self.register(&packet).await,
            SessionState::Registered { .. } => self.relay(&packet).await,
        }
    }

    /// First packet: claim a verification key and take a seat.
    async fn register(&mut self, packet: &Packet) -> Result<(), DisconnectReason> {
        let key = packet.sender_key().filter(|k| !k.is_empty());
        let (Some(key), Some(amount)) = (key, packet.amount()) else {
            tracing::warn!(session = %self.token, "registration without key or amount");
            return Err(self.reject().await);
        };

        let member = Member::new(self.token.clone(), key, amount);
        match self.directory.assign(member, self.mailbox.clone()).await {
            Ok(pool) => {
                tracing::info!(session = %self.token, key, amount, pool = %pool.id(), "peer registered");
                self.state = SessionState::Registered { key: key.to_string(), amount, pool };
                Ok(())
            },
            Err(PoolError::Banned(key)) => {
                tracing::info!(session = %self.token, key = %key, "banned key tried to join");
                Err(DisconnectReason::Banned)
            },
            Err(PoolError::ShuttingDown) => Err(DisconnectReason::Shutdown),
            Err(e) => Err(DisconnectReason::Rejected(e.to_string())),
        }
    }

    /// Later packets: validate, forward, count liar accusations.
    async fn relay(&mut self, packet: &Packet) -> Result<(), DisconnectReason> {
        let SessionState::Registered { key, pool, .. } = &self.state else {
            return Ok(());
        };

        let bound = packet.session == self.token;
        let signed = packet.sender_key() == Some(key.as_str());
        let addressed = packet.to_key.is_some();
        if !(bound && signed && addressed) {
            tracing::warn!(session = %self.token, bound, signed, addressed, "invalid packet");
            return Err(self.reject().await);
        }

        if !pool.route(&self.token, packet).await {
            // Removed from the pool while this packet was in flight
            return Ok(());
        }

        if let Some(accused) = packet.liar_accusation() {
            tracing::info!(session = %self.token, voter = %key, accused, "liar accusation");
            pool.register_ban_vote(&self.token, accused, key).await;
        }

        Ok(())
    }

    /// Tell the peer its packet was malformed. The caller disconnects.
    async fn reject(&mut self) -> DisconnectReason {
        if let Err(reason) = self.write(&Packet::blame(Reason::InvalidFormat)).await {
            tracing::debug!(session = %self.token, %reason, "blame not delivered");
        }
        DisconnectReason::InvalidPacket
    }

    /// Write one packet, giving up after the write timeout.
    ///
    /// A peer that stops reading would otherwise park this task in the write
    /// and keep it from ever seeing shutdown.
    async fn write(&mut self, packet: &Packet) -> Result<(), DisconnectReason> {
        match tokio::time::timeout(self.write_timeout, self.transport.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DisconnectReason::Transport(e.to_string())),
            Err(_) => {
                tracing::warn!(session = %self.token, timeout = ?self.write_timeout, "write timed out");
                Err(DisconnectReason::Transport("write timed out".to_string()))
            },
        }
    }
}
