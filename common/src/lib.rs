//! Frontdoor Common Library
//!
//! Shared pieces used by both the frontdoor server and its clients:
//!
//! - Listener and credential configuration
//! - The error code registry
//! - Wire entities (error entities, command requests and results)
//! - Certificate, key and trust anchor loading into rustls configs
//!
//! # Features
//!
//! - **Mutual TLS**: one trust-anchor policy for HTTPS and WSS listeners
//! - **Stable error codes**: a fixed status to error-code table with a total
//!   lookup

/// Listener and credential configuration
pub mod config;

/// Wire entities
pub mod entity;

/// Error code registry
pub mod errors;

/// Certificate and key loading
pub mod tls;

// Re-export commonly used types for convenience
pub use config::{ClientCertPath, CredentialConfig, ListenerConfig, ServerCertPath};
pub use entity::{CommandRequest, CommandResult, ErrorMessage, ErrorResponse};
pub use errors::ErrorCategory;
