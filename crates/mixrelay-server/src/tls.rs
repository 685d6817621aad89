//! TLS listener.
//!
//! TCP accept plus a rustls acceptor. Handshakes are not run here: the
//! server performs them inside each connection's task so a slow client
//! cannot stall the accept loop.

use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use crate::error::ServerError;

/// Listening socket with its TLS configuration.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Bind to `address`.
    ///
    /// With both `cert_path` and `key_path` the PEM files are loaded;
    /// otherwise a self-signed certificate for `localhost` is generated.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Binding to the address fails
    /// - Only one of certificate and key is given
    /// - The PEM files are unreadable or hold no usable certificate or key
    pub async fn bind(
        address: &str,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let (certs, key) = match (cert_path, key_path) {
            (Some(cert), Some(key)) => (load_certs(cert)?, load_private_key(key)?),
            (None, None) => self_signed_certificate()?,
            _ => {
                return Err(ServerError::Config(
                    "certificate and key must be given together".to_string(),
                ));
            },
        };

        let acceptor = TlsAcceptor::from(Arc::new(server_config(certs, key)?));
        let listener = TcpListener::bind(address).await?;

        Ok(Self { listener, acceptor })
    }

    /// Accept the next TCP connection.
    ///
    /// # Errors
    ///
    /// Socket accept failure.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        Ok(self.listener.accept().await?)
    }

    /// Acceptor for running handshakes on accepted streams.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Run a server-side TLS handshake, giving up after `timeout`.
///
/// # Errors
///
/// Handshake failure or timeout.
pub async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ServerError> {
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ServerError::Tls(e.to_string())),
        Err(_) => Err(ServerError::Tls(format!("handshake timed out after {timeout:?}"))),
    }
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, ServerError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| pem_error(path, &e))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, &e))?;

    if certs.is_empty() {
        return Err(ServerError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| pem_error(path, &e))?);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| pem_error(path, &e))?
        .ok_or_else(|| ServerError::Config(format!("no private key in {}", path.display())))
}

fn self_signed_certificate()
-> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    tracing::warn!("No TLS certificate provided - using self-signed certificate");

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    Ok((vec![certified.cert.der().clone()], PrivateKeyDer::Pkcs8(key)))
}

fn pem_error(path: &Path, err: &std::io::Error) -> ServerError {
    ServerError::Config(format!("{}: {}", path.display(), err))
}
