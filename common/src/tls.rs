//! Trust and key material loading shared by both ends of a connection.
//!
//! Certificates and keys are read once, when a listener or client is
//! configured, and frozen into an `Arc`'d rustls config for its lifetime.

use std::{error::Error as StdError, fs, io, io::BufReader, path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use rustls_pemfile::{certs, private_key};

use crate::config::{CredentialConfig, ListenerConfig};

/// Install the default crypto provider for rustls if not already installed.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Read every PEM certificate in `path`.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read certificate from {path:?}"))?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate PEM data in {path:?}"))?;
    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {:?}", path));
    }
    Ok(chain)
}

/// Read the first PEM private key in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read private key from {path:?}"))?;
    private_key(&mut BufReader::new(&*pem))
        .with_context(|| format!("Failed to parse private key PEM data in {path:?}"))?
        .ok_or_else(|| anyhow!("No private key found in {:?}", path))
}

/// Build a root store from the trust anchor(s) in `path`.
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let pem = fs::read(path).with_context(|| format!("Failed to read CA certificate from {path:?}"))?;
    let ca_certs = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA certificate PEM data")?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        return Err(anyhow!(
            "No valid CA certificates found in {:?}. Please check the CA certificate file.",
            path
        ));
    }
    Ok(root_store)
}

/// TLS configuration for a listener.
///
/// With `require_client_auth` every handshake must present a chain that
/// verifies against the listener's trust anchor. Without it, a presented
/// certificate is still verified but anonymous clients are admitted; if no
/// trust anchor file exists, no client certificate is requested at all.
pub fn server_config(listener: &ListenerConfig) -> Result<Arc<ServerConfig>> {
    ensure_crypto_provider();

    let paths = &listener.cert_path;
    let cert_chain = load_certs(&paths.cert_path)?;
    let private_key = load_private_key(&paths.key_path)?;

    let builder = ServerConfig::builder();
    let builder = if listener.require_client_auth {
        let roots = load_root_store(&paths.ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build client verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else if paths.ca_path.exists() {
        let roots = load_root_store(&paths.ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .context("Failed to build client verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(cert_chain, private_key)
        .context("Failed to create TLS config")?;
    Ok(Arc::new(config))
}

/// TLS configuration for a client connection attempt.
pub fn client_config(credentials: &CredentialConfig) -> Result<Arc<ClientConfig>> {
    ensure_crypto_provider();

    let roots = load_root_store(&credentials.trust_anchor)?;

    let builder = if credentials.verify_hostname {
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build server verifier")?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipHostnameVerifier { inner }))
    };

    let config = match &credentials.client_identity {
        Some(identity) => {
            let cert_chain = load_certs(&identity.cert_path)?;
            let private_key = load_private_key(&identity.key_path)?;
            builder
                .with_client_auth_cert(cert_chain, private_key)
                .context("Failed to build TLS client configuration")?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Full WebPKI chain verification, minus the host name check.
#[derive(Debug)]
struct SkipHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The chain is checked before the name, so a name mismatch implies a
        // trusted chain.
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref err)) if is_name_mismatch(err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// The TLS-layer error anywhere in `err`'s cause chain, if there is one.
///
/// Async TLS streams surface rustls failures wrapped in `io::Error`, so those
/// are unwrapped as well.
pub fn find_tls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(tls) = e
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Some(tls);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
    use tempfile::TempDir;

    use super::*;
    use crate::config::{ServerCertPath, DEFAULT_REST_LISTENER};

    fn write_material(dir: &TempDir) -> ServerCertPath {
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name.push(DnType::CommonName, "Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

        let paths = ServerCertPath::in_dir(dir.path());
        fs::create_dir_all(paths.cert_path.parent().unwrap()).unwrap();
        fs::write(&paths.cert_path, cert.pem()).unwrap();
        fs::write(&paths.key_path, key.serialize_pem()).unwrap();
        fs::write(&paths.ca_path, ca_cert.pem()).unwrap();
        paths
    }

    #[test]
    fn loads_generated_material() {
        let dir = TempDir::new().unwrap();
        let paths = write_material(&dir);

        assert_eq!(load_certs(&paths.cert_path).unwrap().len(), 1);
        assert!(load_private_key(&paths.key_path).is_ok());
        assert_eq!(load_root_store(&paths.ca_path).unwrap().len(), 1);
    }

    #[test]
    fn empty_trust_anchor_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "").unwrap();

        let err = load_root_store(&path).unwrap_err();
        assert!(err.to_string().contains("No valid CA certificates"));
    }

    #[test]
    fn missing_key_file_names_the_path() {
        let err = load_private_key(&PathBuf::from("/nonexistent/key.pem")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/key.pem"));
    }

    #[test]
    fn builds_server_config_with_and_without_client_auth() {
        let dir = TempDir::new().unwrap();
        let paths = write_material(&dir);
        let listener = ListenerConfig::new(DEFAULT_REST_LISTENER.parse().unwrap(), paths);

        assert!(server_config(&listener).is_ok());
        assert!(server_config(&listener.clone().with_client_auth(false)).is_ok());
    }

    #[test]
    fn builds_client_config_for_both_hostname_modes() {
        let dir = TempDir::new().unwrap();
        let paths = write_material(&dir);

        let creds = CredentialConfig::new(&paths.ca_path);
        assert!(client_config(&creds).is_ok());
        assert!(client_config(&creds.with_hostname_verification(false)).is_ok());
    }

    #[test]
    fn only_name_mismatches_are_waived() {
        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(is_name_mismatch(&CertificateError::NotValidForNameContext {
            expected:  ServerName::try_from("127.0.0.1").unwrap(),
            presented: vec!["DnsName(\"localhost\")".to_string()],
        }));
        assert!(!is_name_mismatch(&CertificateError::UnknownIssuer));
        assert!(!is_name_mismatch(&CertificateError::Expired));
    }

    #[test]
    fn finds_tls_error_inside_io_error() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::CertificateRequired),
        );
        let found = find_tls_error(&err).unwrap();
        assert!(matches!(found, rustls::Error::AlertReceived(_)));

        let plain = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(find_tls_error(&plain).is_none());
    }
}
