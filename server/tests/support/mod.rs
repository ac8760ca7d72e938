//! Per-test server fixture with freshly minted certificate material.
//!
//! Every test owns its [`TestServer`]: it is started explicitly, listens on
//! ephemeral ports and is stopped explicitly at the end of the test.

#![allow(dead_code)]

use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use frontdoor_client::{ClientConfig, RestClient, SocketClient};
use frontdoor_common::{CommandRequest, CommandResult, CredentialConfig, ListenerConfig, ServerCertPath};
use frontdoor_server::{
    BuiltinExecutor, CommandExecutor, ErrorDetail, FrontDoorConfig, FrontDoorServer, RowStream,
    RunningServer,
};
use futures_util::{stream, StreamExt};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SanType,
};
use tempfile::TempDir;

pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Command that fails with an error type the mapper knows nothing about.
pub const UNMAPPED_FAILURE_COMMAND: &str = "explode;";
/// Command whose handler panics.
pub const PANIC_COMMAND: &str = "panic;";
/// Streamed command that completes without producing a row.
pub const SILENT_COMMAND: &str = "silent;";

#[derive(Debug, thiserror::Error)]
#[error("segment store corrupted")]
pub struct SegmentCorrupted;

/// Builtin commands plus two that fail in ways no failure type describes and
/// one stream that ends without rows.
pub struct TestExecutor {
    builtin: BuiltinExecutor,
}

impl TestExecutor {
    pub fn new() -> Self {
        Self {
            builtin: BuiltinExecutor::new().with_topics(["orders"]),
        }
    }
}

#[async_trait]
impl CommandExecutor for TestExecutor {
    async fn execute(&self, request: &CommandRequest) -> anyhow::Result<CommandResult> {
        match request.command.as_str() {
            UNMAPPED_FAILURE_COMMAND => Err(anyhow::Error::new(SegmentCorrupted).context("reading offsets")),
            PANIC_COMMAND => panic!("handler bug"),
            _ => self.builtin.execute(request).await,
        }
    }

    async fn stream(&self, request: &CommandRequest) -> anyhow::Result<RowStream> {
        match request.command.as_str() {
            UNMAPPED_FAILURE_COMMAND => Err(anyhow!("stream source vanished")),
            SILENT_COMMAND => Ok(stream::empty().boxed()),
            _ => self.builtin.stream(request).await,
        }
    }
}

/// Certificate material for one test: a trusted CA with server and client
/// identities, and a client identity signed by a CA the server does not trust.
pub struct TestCerts {
    dir:        TempDir,
    pub server: ServerCertPath,
}

impl TestCerts {
    pub fn generate() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let (ca_cert, ca_key) = ca("Frontdoor Test CA");

        let server = ServerCertPath::in_dir(dir.path());
        fs::create_dir_all(server.cert_path.parent().unwrap()).unwrap();
        // Only a DNS name: dialling 127.0.0.1 exercises host name verification.
        let (cert, key) = leaf(
            "localhost",
            vec![SanType::DnsName("localhost".try_into().unwrap())],
            ExtendedKeyUsagePurpose::ServerAuth,
            &ca_cert,
            &ca_key,
        );
        write(&server.cert_path, &cert.pem());
        write(&server.key_path, &key.serialize_pem());
        write(&server.ca_path, &ca_cert.pem());

        let (cert, key) = leaf("trusted-client", vec![], ExtendedKeyUsagePurpose::ClientAuth, &ca_cert, &ca_key);
        write(&dir.path().join("client/client.pem"), &cert.pem());
        write(&dir.path().join("client/client.key.pem"), &key.serialize_pem());

        let (rogue_cert, rogue_key) = ca("Rogue CA");
        let (cert, key) = leaf(
            "untrusted-client",
            vec![],
            ExtendedKeyUsagePurpose::ClientAuth,
            &rogue_cert,
            &rogue_key,
        );
        write(&dir.path().join("rogue/client.pem"), &cert.pem());
        write(&dir.path().join("rogue/client.key.pem"), &key.serialize_pem());

        Self { dir, server }
    }

    /// Trusts the server; presents no certificate.
    pub fn anonymous(&self) -> CredentialConfig {
        CredentialConfig::new(&self.server.ca_path)
    }

    /// Presents a certificate issued by the server's trust anchor.
    pub fn trusted(&self) -> CredentialConfig {
        self.anonymous().with_client_cert(
            self.dir.path().join("client/client.pem"),
            self.dir.path().join("client/client.key.pem"),
        )
    }

    /// Presents a certificate from a CA the server does not trust.
    pub fn untrusted(&self) -> CredentialConfig {
        self.anonymous().with_client_cert(
            self.dir.path().join("rogue/client.pem"),
            self.dir.path().join("rogue/client.key.pem"),
        )
    }
}

fn ca(name: &str) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

fn leaf(
    name: &str,
    sans: Vec<SanType>,
    usage: ExtendedKeyUsagePurpose,
    issuer: &Certificate,
    issuer_key: &KeyPair,
) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.subject_alt_names = sans;
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
    (cert, key)
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Options for [`TestServer::start_with`].
#[derive(Clone, Copy)]
pub struct TestServerOptions {
    pub require_client_auth: bool,
    pub error_detail:        ErrorDetail,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            require_client_auth: true,
            error_detail:        ErrorDetail::Redacted,
        }
    }
}

pub struct TestServer {
    pub certs: TestCerts,
    running:   RunningServer,
}

impl TestServer {
    /// Server requiring client certificates.
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> Self {
        let certs = TestCerts::generate();
        let listener = || {
            ListenerConfig::new("127.0.0.1:0".parse().unwrap(), certs.server.clone())
                .with_client_auth(options.require_client_auth)
                .with_handshake_timeout(Duration::from_secs(5))
        };
        let config = FrontDoorConfig::new(listener(), listener()).with_error_detail(options.error_detail);

        let running = FrontDoorServer::new(config, Arc::new(TestExecutor::new()))
            .start()
            .await
            .expect("server starts");
        Self { certs, running }
    }

    pub fn rest_url(&self) -> String {
        format!("https://localhost:{}", self.running.rest_addr().port())
    }

    pub fn ws_url(&self) -> String {
        format!("wss://localhost:{}", self.running.ws_addr().port())
    }

    pub fn rest_client(&self, credentials: CredentialConfig) -> RestClient {
        RestClient::new(&self.rest_url(), client_config(credentials)).expect("rest client")
    }

    pub fn socket_client(&self, credentials: CredentialConfig) -> SocketClient {
        SocketClient::new(&self.ws_url(), client_config(credentials)).expect("socket client")
    }

    pub async fn stop(self) {
        self.running.shutdown().await.expect("server stops");
    }
}

pub fn client_config(credentials: CredentialConfig) -> ClientConfig {
    ClientConfig::new()
        .with_credentials(credentials)
        .with_timeout(CLIENT_TIMEOUT)
}
