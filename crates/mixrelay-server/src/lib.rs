//! Mixrelay server.
//!
//! A blind relay for coin-shuffle clients. Peers connect over TLS, register a
//! verification key and are seated in fixed-size pools. Once a pool fills the
//! server announces the round and from then on forwards packets between
//! members, broadcast or by key, while enforcing session binding and a
//! `capacity - 1` vote to expel liars.
//!
//! ## Architecture
//!
//! ```text
//! mixrelay-server
//!   ├─ TlsListener       (TCP accept + rustls)
//!   ├─ PeerSession       (one task per connection)
//!   │    └─ FramedTransport
//!   ├─ PoolDirectory     (pool registry, placement)
//!   │    └─ PoolHandle   (Pool + member mailboxes behind a mutex)
//!   └─ Pool              (Sans-IO membership, seats, ban votes)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
mod error;
pub mod pool;
pub mod session;
pub mod tls;
pub mod transport;

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

pub use directory::{PoolDirectory, PoolHandle, PoolId};
pub use error::ServerError;
use mixrelay_proto::DEFAULT_MAX_FRAME_LEN;
pub use pool::{Member, Pool, PoolAction, PoolCapacity, PoolError};
pub use session::{
    DisconnectReason, PeerCommand, PeerMailbox, PeerSession, SessionConfig, generate_token,
};
pub use tls::TlsListener;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
};
use tokio_rustls::TlsAcceptor;
pub use transport::{FramedTransport, TransportError};

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Path to TLS certificate chain (PEM format)
    pub cert_path: Option<PathBuf>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<PathBuf>,
    /// Seats per pool
    pub pool_capacity: PoolCapacity,
    /// Largest accepted inbound frame body
    pub max_frame_len: usize,
    /// Upper bound on a TLS handshake
    pub handshake_timeout: Duration,
    /// Upper bound on writing one frame to a peer
    pub write_timeout: Duration,
    /// Outbound packets queued per peer before it is dropped as too slow
    pub mailbox_capacity: usize,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            cert_path: None,
            key_path: None,
            pool_capacity: PoolCapacity::DEFAULT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: SessionConfig::DEFAULT_WRITE_TIMEOUT,
            mailbox_capacity: SessionConfig::DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Production relay server.
pub struct Server {
    listener: TlsListener,
    directory: Arc<PoolDirectory>,
    session: SessionConfig,
    handshake_timeout: Duration,
}

impl Server {
    /// Create and bind a new server.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Binding to the address fails
    /// - TLS configuration is invalid
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let listener = TlsListener::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )
        .await?;

        Ok(Self {
            listener,
            directory: Arc::new(PoolDirectory::new(config.pool_capacity)),
            session: SessionConfig {
                max_frame_len: config.max_frame_len,
                write_timeout: config.write_timeout,
                mailbox_capacity: config.mailbox_capacity,
            },
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr()
    }

    /// Pool registry shared by every connection.
    pub fn directory(&self) -> Arc<PoolDirectory> {
        Arc::clone(&self.directory)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// On shutdown every pool stops admitting peers and sending membership
    /// notices, every session is told to close, and this returns once all
    /// connection tasks have finished.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.local_addr()?);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                },

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let connection = Connection {
                            acceptor: self.listener.acceptor(),
                            handshake_timeout: self.handshake_timeout,
                            directory: Arc::clone(&self.directory),
                            session: self.session.clone(),
                            shutdown: shutdown_tx.subscribe(),
                            _done: done_tx.clone(),
                        };

                        tokio::spawn(async move {
                            if let Err(e) = connection.handle(stream).await {
                                tracing::warn!("Connection from {} failed: {}", addr, e);
                            }
                        });
                    },
                    Err(e) => {
                        // EMFILE and the like persist across immediate retries
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    },
                },
            }
        }

        self.directory.begin_shutdown().await;
        let _ = shutdown_tx.send(());
        drop(shutdown_tx);
        drop(done_tx);

        let _ = done_rx.recv().await;
        tracing::info!("All connections closed");

        Ok(())
    }
}

/// Everything one connection task needs.
struct Connection {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    directory: Arc<PoolDirectory>,
    session: SessionConfig,
    shutdown: broadcast::Receiver<()>,
    /// Dropped when the task ends; `run` waits for every clone to go.
    _done: mpsc::Sender<()>,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> Result<DisconnectReason, ServerError> {
        let stream = tls::handshake(&self.acceptor, stream, self.handshake_timeout).await?;
        let token = generate_token()?;

        let session =
            PeerSession::new(token, stream, self.directory, self.shutdown, &self.session);
        Ok(session.run().await)
    }
}
