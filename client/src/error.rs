use std::{error::Error as StdError, io, time::Duration};

use frontdoor_common::{tls::find_tls_error, ErrorMessage};
use http::StatusCode;
use thiserror::Error;

/// Failures seen by a client. Application error entities are not failures;
/// they come back as a [`RestResponse::Error`](crate::RestResponse::Error).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Trust anchor or client identity could not be loaded
    #[error("Failed to configure TLS: {0:#}")]
    Config(anyhow::Error),

    /// The TLS handshake was refused or broken off, by either side
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("Connection failed: {0}")]
    Connection(#[source] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server refused the socket upgrade, with the error entity if it sent
    /// one
    #[error("Socket upgrade refused with status {status}")]
    UpgradeRejected {
        status: StatusCode,
        body:   Option<ErrorMessage>,
    },

    #[error("Socket closed by peer with code {code}: {reason}")]
    ClosedByPeer { code: u16, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No response within {0:?}")]
    NoResponseWithinDeadline(Duration),
}

impl ClientError {
    /// True for failures at the TLS layer, as opposed to application errors.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// The rustls error behind a handshake failure, if one was reported.
    pub fn tls_error(&self) -> Option<&rustls::Error> {
        match self {
            Self::Handshake(err) => find_tls_error(err),
            _ => None,
        }
    }

    /// Classify an I/O failure while a connection is being established.
    ///
    /// A peer that aborts the handshake with a reset or an early EOF is
    /// reported the same way as an explicit TLS alert.
    pub(crate) fn establishing(err: io::Error) -> Self {
        if find_tls_error(&err).is_some() || is_abort(&err) {
            Self::Handshake(err)
        } else {
            Self::Connection(err)
        }
    }

    /// Classify a failure on an established connection. A TLS error here is a
    /// server that rejected the certificate after a TLS 1.3 client already
    /// considered the handshake done.
    pub(crate) fn on_established(err: &(dyn StdError + 'static)) -> Self {
        if let Some(tls) = find_tls_error(err) {
            return Self::Handshake(io::Error::new(io::ErrorKind::InvalidData, tls.clone()));
        }
        match io_cause(err) {
            Some(io_err) => Self::Connection(io::Error::new(io_err.kind(), err.to_string())),
            None => Self::Protocol(err.to_string()),
        }
    }
}

fn is_abort(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn io_cause<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use rustls::AlertDescription;

    use super::*;

    #[test]
    fn alert_while_establishing_is_a_handshake_failure() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::CertificateRequired),
        );
        let classified = ClientError::establishing(err);
        assert!(classified.is_handshake_failure());
        assert!(matches!(
            classified.tls_error(),
            Some(rustls::Error::AlertReceived(AlertDescription::CertificateRequired))
        ));
    }

    #[test]
    fn reset_while_establishing_is_a_handshake_failure() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(ClientError::establishing(err).is_handshake_failure());

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            ClientError::establishing(refused),
            ClientError::Connection(_)
        ));
    }

    #[test]
    fn late_alert_on_established_connection_is_a_handshake_failure() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::UnknownCA),
        );
        assert!(ClientError::on_established(&err).is_handshake_failure());

        let closed = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            ClientError::on_established(&closed),
            ClientError::Connection(_)
        ));
    }
}
