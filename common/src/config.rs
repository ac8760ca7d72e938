use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

/// Default address of the request/response (HTTPS) listener
pub const DEFAULT_REST_LISTENER: &str = "127.0.0.1:8088";
/// Default address of the persistent-socket (WSS) listener
pub const DEFAULT_WS_LISTENER: &str = "127.0.0.1:8089";
/// Default upper bound on a TLS handshake before the attempt is rejected
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CERTS_DIR_ENV: &str = "FRONTDOOR_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SERVER_CERTS_SUBDIR: &str = "server";
const CLIENT_CERTS_SUBDIR: &str = "client";
const TRUST_ANCHOR_FILE: &str = "root-ca.pem";

/// Base directory for certificate material, overridable with
/// `FRONTDOOR_CERTS_DIR`.
pub fn certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Server certificate paths for TLS listeners
#[derive(Debug, Clone)]
pub struct ServerCertPath {
    /// Path to the server certificate chain
    pub cert_path: PathBuf,
    /// Path to the server private key
    pub key_path:  PathBuf,
    /// Path to the trust anchor used to verify client certificates
    pub ca_path:   PathBuf,
}

impl ServerCertPath {
    /// Creates ServerCertPath with default certificate locations
    pub fn new() -> Self {
        Self::in_dir(certs_dir())
    }

    /// Server material under `<base>/server/`, trust anchor at
    /// `<base>/root-ca.pem`.
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let server = base.join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: server.join("server.pem"),
            key_path:  server.join("server.key.pem"),
            ca_path:   base.join(TRUST_ANCHOR_FILE),
        }
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for client authentication
#[derive(Debug, Clone)]
pub struct ClientCertPath {
    /// Path to the client certificate chain
    pub cert_path: PathBuf,
    /// Path to the client private key
    pub key_path:  PathBuf,
    /// Path to the trust anchor used to verify the server
    pub ca_path:   PathBuf,
}

impl ClientCertPath {
    /// Creates ClientCertPath with default certificate locations
    pub fn new() -> Self {
        Self::in_dir(certs_dir())
    }

    /// Client material under `<base>/client/`, trust anchor at
    /// `<base>/root-ca.pem`.
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let client = base.join(CLIENT_CERTS_SUBDIR);
        Self {
            cert_path: client.join("client.pem"),
            key_path:  client.join("client.key.pem"),
            ca_path:   base.join(TRUST_ANCHOR_FILE),
        }
    }
}

impl Default for ClientCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of one secure listener.
///
/// The request/response listener and the socket listener are both configured
/// with this type so that `require_client_auth` means the same thing on each.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind
    pub bind_addr:           SocketAddr,
    /// Server certificate, key and trust anchor
    pub cert_path:           ServerCertPath,
    /// Reject handshakes that do not present a certificate trusted by
    /// `cert_path.ca_path`
    pub require_client_auth: bool,
    /// Handshakes that take longer than this are rejected
    pub handshake_timeout:   Duration,
}

impl ListenerConfig {
    /// Listener on `bind_addr` requiring client certificates.
    pub fn new(bind_addr: SocketAddr, cert_path: ServerCertPath) -> Self {
        Self {
            bind_addr,
            cert_path,
            require_client_auth: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set whether clients must present a trusted certificate
    pub fn with_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Client credential for mutual TLS
#[derive(Debug, Clone)]
pub struct ClientIdentityPath {
    /// Path to the client certificate chain
    pub cert_path: PathBuf,
    /// Path to the client private key
    pub key_path:  PathBuf,
}

/// Credentials attached to a connection attempt before its handshake begins.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Trust anchor used to verify the server certificate
    pub trust_anchor:    PathBuf,
    /// Client certificate and key, presented when the server asks for one
    pub client_identity: Option<ClientIdentityPath>,
    /// Check that the server certificate is valid for the host name dialled.
    /// Independent of whether the chain must verify, which it always must.
    pub verify_hostname: bool,
}

impl CredentialConfig {
    /// Credentials trusting `trust_anchor` and presenting no client certificate.
    pub fn new(trust_anchor: impl Into<PathBuf>) -> Self {
        Self {
            trust_anchor:    trust_anchor.into(),
            client_identity: None,
            verify_hostname: true,
        }
    }

    /// Credentials built from the default certificate directory, including the
    /// client certificate.
    pub fn from_cert_path(paths: ClientCertPath) -> Self {
        Self::new(paths.ca_path).with_client_cert(paths.cert_path, paths.key_path)
    }

    /// Present this certificate and key during the handshake
    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_identity = Some(ClientIdentityPath {
            cert_path: cert_path.into(),
            key_path:  key_path.into(),
        });
        self
    }

    /// Enable or disable server host name verification
    pub fn with_hostname_verification(mut self, enabled: bool) -> Self {
        self.verify_hostname = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_client_paths_share_trust_anchor() {
        let server = ServerCertPath::in_dir("/etc/frontdoor");
        let client = ClientCertPath::in_dir("/etc/frontdoor");

        assert_eq!(server.ca_path, client.ca_path);
        assert_eq!(server.cert_path, PathBuf::from("/etc/frontdoor/server/server.pem"));
        assert_eq!(client.key_path, PathBuf::from("/etc/frontdoor/client/client.key.pem"));
    }

    #[test]
    fn credentials_default_to_no_client_certificate() {
        let creds = CredentialConfig::new("ca.pem");
        assert!(creds.client_identity.is_none());
        assert!(creds.verify_hostname);

        let creds = CredentialConfig::from_cert_path(ClientCertPath::in_dir("base"))
            .with_hostname_verification(false);
        assert!(creds.client_identity.is_some());
        assert!(!creds.verify_hostname);
    }

    #[test]
    fn listener_requires_client_auth_by_default() {
        let addr: SocketAddr = DEFAULT_REST_LISTENER.parse().unwrap();
        let config = ListenerConfig::new(addr, ServerCertPath::in_dir("base"));
        assert!(config.require_client_auth);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(!config.with_client_auth(false).require_client_auth);
    }
}
