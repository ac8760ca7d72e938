use std::time::Duration;

use frontdoor_common::{tls::client_config, ClientCertPath, CredentialConfig};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::Url;

use crate::ClientError;

/// Configuration shared by the request/response and socket clients
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Trust anchor, optional client identity and host name policy
    pub credentials: CredentialConfig,
    /// Upper bound on connecting and on each request
    pub timeout:     Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialConfig::from_cert_path(ClientCertPath::new()),
            timeout:     Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credentials attached to every connection attempt
    pub fn with_credentials(mut self, credentials: CredentialConfig) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A resolved server endpoint plus the TLS configuration used to reach it.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) url:     Url,
    host:               String,
    port:               u16,
    server_name:        ServerName<'static>,
    connector:          TlsConnector,
    pub(crate) timeout: Duration,
}

impl Endpoint {
    /// Parse `base_url` and freeze `config` into a TLS connector. No network
    /// I/O happens here.
    pub(crate) fn new(base_url: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidUrl(format!("{base_url}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ClientError::InvalidUrl(format!("{base_url}: missing port")))?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;

        let tls = client_config(&config.credentials).map_err(ClientError::Config)?;
        Ok(Self {
            url,
            host,
            port,
            server_name,
            connector: TlsConnector::from(tls),
            timeout: config.timeout,
        })
    }

    /// `host:port`, as sent in the Host header.
    pub(crate) fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or(&self.host), port),
            None => self.url.host_str().unwrap_or(&self.host).to_string(),
        }
    }

    /// TCP connect and TLS handshake, bounded by the configured timeout.
    pub(crate) async fn connect(&self) -> Result<TlsStream<TcpStream>, ClientError> {
        tracing::debug!("Connecting to {}:{}", self.host, self.port);
        let attempt = async {
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(ClientError::Connection)?;
            self.connector
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(ClientError::establishing)
        };

        let stream = tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| ClientError::NoResponseWithinDeadline(self.timeout))??;
        tracing::debug!("✓ TLS session established with {}", self.authority());
        Ok(stream)
    }
}
