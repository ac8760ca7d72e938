//! Handshake-time admission for both listeners.
//!
//! Every accepted socket passes through [`TlsGate::admit`] exactly once. The
//! result is a [`ConnectionOutcome`]: either an established TLS stream plus
//! the identity of the peer, or a rejection. A rejected connection never
//! reaches application code and never produces an error entity.

use std::{fmt, io, net::SocketAddr, time::Duration};

use anyhow::Result;
use frontdoor_common::{tls, ListenerConfig};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

/// How long a rejected peer gets to read the TLS alert before the socket is
/// dropped.
const LINGER: Duration = Duration::from_millis(500);

/// Who is on the other end of an admitted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Peer presented a certificate that verified against the trust anchor
    Certificate { fingerprint: String },
    /// Client authentication is optional and the peer sent no certificate
    Anonymous,
}

impl PeerIdentity {
    /// Identity keyed by the SHA-256 fingerprint of the end-entity certificate.
    pub fn from_certificate(der: &[u8]) -> Self {
        Self::Certificate {
            fingerprint: hex::encode(Sha256::digest(der)),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Certificate { .. })
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Certificate { fingerprint } => Some(fingerprint),
            Self::Anonymous => None,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Certificate { fingerprint } => write!(f, "cert:{fingerprint}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeRejection {
    #[error("TLS handshake with {peer} failed: {source}")]
    Failed {
        peer:   SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {peer} did not complete within {timeout:?}")]
    TimedOut { peer: SocketAddr, timeout: Duration },
}

/// Result of one connection attempt. Terminal; the gate never retries.
#[derive(Debug)]
pub enum ConnectionOutcome<IO> {
    Admitted {
        stream: TlsStream<IO>,
        peer:   PeerIdentity,
    },
    RejectedAtHandshake(HandshakeRejection),
}

/// TLS acceptor bound to one listener's configuration.
#[derive(Clone)]
pub struct TlsGate {
    acceptor:          TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsGate {
    /// Build the gate from the listener's certificate material. The rustls
    /// configuration is frozen here and shared by every connection.
    pub fn new(listener: &ListenerConfig) -> Result<Self> {
        tracing::info!("Configuring TLS gate for {}:", listener.bind_addr);
        tracing::info!("  - Server cert: {:?}", listener.cert_path.cert_path);
        tracing::info!("  - Server key: {:?}", listener.cert_path.key_path);
        tracing::info!("  - CA cert: {:?}", listener.cert_path.ca_path);
        tracing::info!("  - Client auth required: {}", listener.require_client_auth);

        let config = tls::server_config(listener)?;
        Ok(Self {
            acceptor:          TlsAcceptor::from(config),
            handshake_timeout: listener.handshake_timeout,
        })
    }

    /// Run the TLS handshake on `io` and decide whether the peer gets in.
    pub async fn admit<IO>(&self, io: IO, peer_addr: SocketAddr) -> ConnectionOutcome<IO>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = self.acceptor.accept(io).into_fallible();
        let rejection = match timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => {
                let peer = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .map(|cert| PeerIdentity::from_certificate(cert.as_ref()))
                    .unwrap_or(PeerIdentity::Anonymous);
                tracing::info!("✓ TLS handshake with {} complete, peer {}", peer_addr, peer);
                return ConnectionOutcome::Admitted { stream, peer };
            }
            Ok(Err((source, io))) => {
                linger_close(io).await;
                HandshakeRejection::Failed {
                    peer: peer_addr,
                    source,
                }
            }
            Err(_) => HandshakeRejection::TimedOut {
                peer:    peer_addr,
                timeout: self.handshake_timeout,
            },
        };

        tracing::warn!("✗ Rejected connection: {}", rejection);
        ConnectionOutcome::RejectedAtHandshake(rejection)
    }
}

/// Half-close and drain so the peer reads the alert instead of a reset.
async fn linger_close<IO>(mut io: IO)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let _ = io.shutdown().await;
    let mut buf = [0u8; 1024];
    let _ = timeout(LINGER, async {
        while matches!(io.read(&mut buf).await, Ok(n) if n > 0) {}
    })
    .await;
}
