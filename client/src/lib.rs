//! Frontdoor Client Library
//!
//! Clients for both frontdoor listeners. Credentials are attached to the
//! connection attempt before the TLS handshake starts; a refused handshake is
//! reported as [`ClientError::Handshake`], never as an error entity.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use frontdoor_client::{ClientConfig, RestClient, RestResponse};
//! use frontdoor_common::{ClientCertPath, CredentialConfig};
//!
//! # async fn run() -> Result<(), frontdoor_client::ClientError> {
//! let config = ClientConfig::new()
//!     .with_credentials(CredentialConfig::from_cert_path(ClientCertPath::new()))
//!     .with_timeout(Duration::from_secs(10));
//!
//! let client = RestClient::new("https://localhost:8088", config)?;
//! let mut connection = client.connect().await?;
//! match connection.make_command_request("show topics;").await? {
//!     RestResponse::Success(result) => println!("{}", result.payload),
//!     RestResponse::Error(error) => println!("error {}", error.body.error_code),
//! }
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod rest;
mod socket;

pub use client::ClientConfig;
pub use error::ClientError;
pub use rest::{RawResponse, RestClient, RestConnection, RestResponse};
pub use socket::{
    SocketClient, SocketListener, SocketSession, TerminalEventListener, TerminalSocketEvent,
    QUERY_PATH,
};
// Re-export credential types from frontdoor-common for convenience
pub use frontdoor_common::{ClientCertPath, CredentialConfig};
