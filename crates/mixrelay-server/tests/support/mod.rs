//! In-memory relay harness: sessions run on real tasks, clients talk to them
//! over duplex pipes.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use mixrelay_proto::{
    Blame, DEFAULT_MAX_FRAME_LEN, Message, Packet, Phase, Reason, SessionToken, VerificationKey,
};
use mixrelay_server::{
    DisconnectReason, FramedTransport, PeerSession, PoolCapacity, PoolDirectory, SessionConfig,
    TransportError, generate_token,
};
use tokio::{
    io::{DuplexStream, duplex},
    sync::broadcast,
    task::JoinHandle,
};

/// How long a test waits for an expected packet.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits to conclude nothing is coming.
const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Directory plus shutdown signal, as the server would hold them.
pub struct Relay {
    pub directory: Arc<PoolDirectory>,
    shutdown: broadcast::Sender<()>,
}

impl Relay {
    pub fn new(capacity: u32) -> Self {
        let capacity = PoolCapacity::try_from(capacity).expect("valid capacity");
        let (shutdown, _) = broadcast::channel(1);
        Self { directory: Arc::new(PoolDirectory::new(capacity)), shutdown }
    }

    /// Open a connection and start its session task.
    pub fn connect(&self) -> TestPeer {
        self.connect_with(64 * 1024, &SessionConfig::default())
    }

    /// Open a connection over a pipe buffering at most `pipe_capacity` bytes
    /// each way.
    pub fn connect_with(&self, pipe_capacity: usize, config: &SessionConfig) -> TestPeer {
        let (client, server) = duplex(pipe_capacity);
        let token = generate_token().expect("token");
        let session = PeerSession::new(
            token,
            server,
            Arc::clone(&self.directory),
            self.shutdown.subscribe(),
            config,
        );

        TestPeer {
            transport: FramedTransport::new(client, DEFAULT_MAX_FRAME_LEN),
            session: SessionToken::default(),
            key: String::new(),
            task: tokio::spawn(session.run()),
        }
    }

    /// Same order as the server: silence pools, then signal sessions.
    pub async fn shutdown(&self) {
        self.directory.begin_shutdown().await;
        let _ = self.shutdown.send(());
    }
}

/// Client end of one connection.
pub struct TestPeer {
    pub transport: FramedTransport<DuplexStream>,
    pub session: SessionToken,
    pub key: String,
    task: JoinHandle<DisconnectReason>,
}

impl TestPeer {
    /// Register and return the acknowledgement.
    pub async fn register(&mut self, key: &str, amount: u64) -> Packet {
        self.send(&Packet::register(key, amount)).await;
        let ack = self.recv().await;
        self.session = ack.session.clone();
        self.key = key.to_string();
        ack
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.transport.send(packet).await.expect("send");
    }

    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(RECV_TIMEOUT, self.transport.receive())
            .await
            .expect("timed out waiting for packet")
            .expect("receive")
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let result = tokio::time::timeout(QUIET_PERIOD, self.transport.receive()).await;
        assert!(result.is_err(), "unexpected inbound: {result:?}");
    }

    /// Collect everything sent before the server closed the connection.
    pub async fn drain_until_closed(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.transport.receive())
                .await
                .expect("timed out waiting for close");
            match next {
                Ok(packet) => packets.push(packet),
                Err(TransportError::Closed) => return packets,
                Err(e) => panic!("unexpected transport error: {e}"),
            }
        }
    }

    /// Relay packet from this peer, bound to its session and key.
    pub fn packet_to(&self, to: &str, phase: Phase, text: &str) -> Packet {
        Packet {
            session: self.session.clone(),
            from_key: Some(VerificationKey::new(&self.key)),
            to_key: Some(VerificationKey::new(to)),
            phase,
            message: Some(Message { text: Some(text.to_string()), ..Message::default() }),
            ..Packet::default()
        }
    }

    /// Broadcast blame naming `accused` as a liar.
    pub fn liar_blame(&self, accused: &str) -> Packet {
        Packet {
            session: self.session.clone(),
            from_key: Some(VerificationKey::new(&self.key)),
            to_key: Some(VerificationKey::default()),
            phase: Phase::Blame,
            message: Some(Message {
                blame: Some(Blame {
                    reason: Reason::Liar,
                    accused: Some(VerificationKey::new(accused)),
                    ..Blame::default()
                }),
                ..Message::default()
            }),
            ..Packet::default()
        }
    }

    /// Wait for the server side of this connection to finish.
    pub async fn finish(self) -> DisconnectReason {
        let TestPeer { transport, task, .. } = self;
        let reason = tokio::time::timeout(RECV_TIMEOUT, task)
            .await
            .expect("session did not end")
            .expect("session task panicked");
        drop(transport);
        reason
    }

    /// Hang up and wait for the server to notice.
    pub async fn disconnect(self) -> DisconnectReason {
        let TestPeer { transport, task, .. } = self;
        drop(transport);
        tokio::time::timeout(RECV_TIMEOUT, task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}
