// ABOUTME: Byte-stream transport between sender and receiver, plain TCP or TLS
// ABOUTME: Dialer trait for the sender side, PEM loading and handshake helpers for both sides

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_native_tls::{TlsAcceptor, TlsConnector};

use crate::error::SyncError;

/// Anything a frame can be written to or read from.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn RelayStream>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens one connection per sender cycle.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream, SyncError>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

#[async_trait]
impl<D> Dialer for std::sync::Arc<D>
where
    D: Dialer + ?Sized,
{
    async fn dial(&self) -> Result<BoxedStream, SyncError> {
        (**self).dial().await
    }

    fn peer(&self) -> String {
        (**self).peer()
    }
}

/// TLS settings for the sender.
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    /// Name checked against the receiver's certificate.
    pub domain: String,
}

/// Dials `host:port`, optionally wrapping the socket in TLS.
#[derive(Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    tls: Option<ClientTls>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpDialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<BoxedStream, SyncError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SyncError::connection(
                    anyhow::Error::new(e).context(format!("Failed to connect to {}", self.peer())),
                ))
            }
            Err(_) => {
                return Err(SyncError::ConnectionFailure(format!(
                    "Timed out after {:?} connecting to {}",
                    self.connect_timeout,
                    self.peer()
                )))
            }
        };
        stream.set_nodelay(true).map_err(SyncError::connection)?;

        match &self.tls {
            None => Ok(Box::new(stream)),
            Some(tls) => {
                let handshake = tls.connector.connect(&tls.domain, stream);
                match tokio::time::timeout(self.handshake_timeout, handshake).await {
                    Ok(Ok(stream)) => Ok(Box::new(stream)),
                    Ok(Err(e)) => Err(SyncError::connection(
                        anyhow::Error::new(e)
                            .context(format!("TLS handshake with {} failed", self.peer())),
                    )),
                    Err(_) => Err(SyncError::ConnectionFailure(format!(
                        "Timed out after {:?} in TLS handshake with {}",
                        self.handshake_timeout,
                        self.peer()
                    ))),
                }
            }
        }
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the sender's TLS connector.
///
/// `ca_cert` adds a PEM root on top of the system store. With
/// `allow_invalid_certs`, certificate and hostname checks are skipped.
pub fn tls_connector(ca_cert: Option<&Path>, allow_invalid_certs: bool) -> Result<TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = ca_cert {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read CA certificate {:?}", path))?;
        let cert = native_tls::Certificate::from_pem(&pem)
            .with_context(|| format!("Invalid PEM certificate in {:?}", path))?;
        builder.add_root_certificate(cert);
    }
    if allow_invalid_certs {
        tracing::warn!("TLS certificate verification is disabled (--allow-self-signed-certs)");
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(TlsConnector::from(connector))
}

/// Build the receiver's TLS acceptor from a PEM certificate chain and a PKCS#8 PEM key.
pub fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_pem =
        std::fs::read(cert).with_context(|| format!("Failed to read certificate {:?}", cert))?;
    let key_pem =
        std::fs::read(key).with_context(|| format!("Failed to read private key {:?}", key))?;
    let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
        .context("Certificate and key do not form a valid identity (key must be PKCS#8 PEM)")?;
    let acceptor = native_tls::TlsAcceptor::new(identity).context("Failed to build TLS acceptor")?;
    Ok(TlsAcceptor::from(acceptor))
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", host, port))
}

/// Finish accepting a socket: TCP options plus the TLS handshake when configured.
///
/// Runs inside the per-connection task so a slow handshake never blocks the
/// accept loop.
pub async fn accept_stream(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsAcceptor>,
) -> Result<BoxedStream, SyncError> {
    stream.set_nodelay(true).map_err(SyncError::connection)?;

    let Some(acceptor) = tls else {
        return Ok(Box::new(stream));
    };

    match tokio::time::timeout(DEFAULT_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(SyncError::connection(
            anyhow::Error::new(e).context(format!("TLS handshake from {} failed", peer)),
        )),
        Err(_) => Err(SyncError::ConnectionFailure(format!(
            "TLS handshake from {} timed out",
            peer
        ))),
    }
}
