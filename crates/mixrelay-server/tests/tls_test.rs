//! Full server over TLS: certificate loading, handshake, registration and
//! graceful shutdown.

use std::{io::Write, sync::Arc, time::Duration};

use mixrelay_proto::{DEFAULT_MAX_FRAME_LEN, Packet};
use mixrelay_server::{FramedTransport, PoolCapacity, Server, ServerRuntimeConfig, TransportError};
use rustls::pki_types::ServerName;
use tokio::{net::TcpStream, sync::oneshot};
use tokio_rustls::TlsConnector;

struct Pki {
    ca_der: rustls::pki_types::CertificateDer<'static>,
    cert_file: tempfile::NamedTempFile,
    key_file: tempfile::NamedTempFile,
}

/// CA plus a `localhost` leaf signed by it, leaf written out as PEM.
fn issue_localhost_cert() -> Pki {
    let ca_key = rcgen::KeyPair::generate().expect("ca key");
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let leaf_key = rcgen::KeyPair::generate().expect("leaf key");
    let leaf_params =
        rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).expect("leaf cert");

    let mut cert_file = tempfile::NamedTempFile::new().expect("temp cert");
    cert_file.write_all(leaf_cert.pem().as_bytes()).expect("write cert");
    let mut key_file = tempfile::NamedTempFile::new().expect("temp key");
    key_file.write_all(leaf_key.serialize_pem().as_bytes()).expect("write key");

    Pki { ca_der: ca_cert.der().clone(), cert_file, key_file }
}

fn connector(ca: rustls::pki_types::CertificateDer<'static>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca).expect("add root");

    let config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn tls_client_registers_and_is_closed_on_shutdown() {
    let pki = issue_localhost_cert();

    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        cert_path: Some(pki.cert_file.path().to_path_buf()),
        key_path: Some(pki.key_file.path().to_path_buf()),
        pool_capacity: PoolCapacity::try_from(2).expect("capacity"),
        handshake_timeout: Duration::from_secs(5),
        ..ServerRuntimeConfig::default()
    };
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("addr");
    let directory = server.directory();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    let tcp = TcpStream::connect(addr).await.expect("connect");
    let tls = connector(pki.ca_der)
        .connect(ServerName::try_from("localhost").expect("name"), tcp)
        .await
        .expect("handshake");
    let mut client = FramedTransport::new(tls, DEFAULT_MAX_FRAME_LEN);

    client.send(&Packet::register("alice", 100)).await.expect("send");
    let ack = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .expect("ack timeout")
        .expect("ack");
    assert_eq!(ack.seat, 1);
    assert!(!ack.session.is_empty());
    assert_eq!(directory.pool_count().await, 1);

    stop_tx.send(()).expect("stop");
    let closed = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .expect("close timeout");
    assert!(matches!(closed, Err(TransportError::Closed | TransportError::Io(_))));

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("server did not stop")
        .expect("server task")
        .expect("server run");
}

#[tokio::test]
async fn server_starts_with_generated_certificate() {
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..ServerRuntimeConfig::default()
    };

    let server = Server::bind(config).await.expect("bind");
    assert_ne!(server.local_addr().expect("addr").port(), 0);

    server.run(async {}).await.expect("immediate shutdown");
}

#[tokio::test]
async fn stalled_handshake_does_not_block_other_clients() {
    let pki = issue_localhost_cert();
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        cert_path: Some(pki.cert_file.path().to_path_buf()),
        key_path: Some(pki.key_file.path().to_path_buf()),
        handshake_timeout: Duration::from_millis(200),
        ..ServerRuntimeConfig::default()
    };
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("addr");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    // Connects but never speaks TLS
    let _silent = TcpStream::connect(addr).await.expect("connect");

    let tcp = TcpStream::connect(addr).await.expect("connect");
    let tls = connector(pki.ca_der)
        .connect(ServerName::try_from("localhost").expect("name"), tcp)
        .await
        .expect("handshake");
    let mut client = FramedTransport::new(tls, DEFAULT_MAX_FRAME_LEN);
    client.send(&Packet::register("bob", 1)).await.expect("send");
    let ack = client.receive().await.expect("ack");
    assert_eq!(ack.seat, 1);

    stop_tx.send(()).expect("stop");
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("server did not stop")
        .expect("server task")
        .expect("server run");
}
