//! Translation of request failures into error entities.
//!
//! [`ErrorMapper::to_response`] is total. It checks the failure and its cause
//! chain in three tiers:
//!
//! 1. [`RestException`]: its pre-built response is returned verbatim.
//! 2. [`StatusError`]: the status is kept and the error code looked up in the
//!    registry.
//! 3. Anything else: a generic server error.
//!
//! The mapper is immutable and shared by every connection.

use std::any::Any;

use frontdoor_common::{
    errors::{to_error_code, ERROR_CODE_SERVER_ERROR},
    ErrorMessage, ErrorResponse,
};
use http::StatusCode;

use crate::failure::{RestException, StatusError};

/// Message sent in place of the real one for redacted server errors.
pub const REDACTED_SERVER_ERROR: &str = "Internal server error";

/// How much of an unclassified failure reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorDetail {
    /// Fixed message only
    #[default]
    Redacted,
    /// Message and cause chain, for authenticated callers only
    Verbose,
}

/// What the mapper knows about the caller of the failed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    /// Peer presented a certificate that verified against the trust anchor
    pub authenticated: bool,
}

impl RequestContext {
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorMapper {
    detail: ErrorDetail,
}

impl ErrorMapper {
    pub fn new(detail: ErrorDetail) -> Self {
        Self { detail }
    }

    pub fn detail(&self) -> ErrorDetail {
        self.detail
    }

    /// Error entity for `err`.
    pub fn to_response(&self, err: &anyhow::Error, ctx: &RequestContext) -> ErrorResponse {
        if let Some(rest) = find_cause::<RestException>(err) {
            tracing::debug!("Mapped domain failure: {}", rest);
            return rest.response().clone();
        }

        if let Some(status_error) = find_cause::<StatusError>(err) {
            tracing::debug!(
                "Mapped framework failure {}: {}",
                status_error.status,
                status_error.message
            );
            return ErrorResponse::new(
                status_error.status,
                ErrorMessage::new(to_error_code(status_error.status), &status_error.message),
            );
        }

        tracing::error!("Unhandled failure while serving request: {:#}", err);
        let causes = err.chain().map(|cause| cause.to_string()).collect();
        self.server_error(err.to_string(), causes, ctx)
    }

    /// Error entity for a request handler that panicked.
    pub fn from_panic(&self, payload: Box<dyn Any + Send>, ctx: &RequestContext) -> ErrorResponse {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());

        tracing::error!("Request handler panicked: {}", message);
        self.server_error(format!("Request handler panicked: {message}"), Vec::new(), ctx)
    }

    fn server_error(&self, message: String, causes: Vec<String>, ctx: &RequestContext) -> ErrorResponse {
        let body = if self.detail == ErrorDetail::Verbose && ctx.authenticated {
            ErrorMessage::new(ERROR_CODE_SERVER_ERROR, message).with_stack_trace(causes)
        } else {
            ErrorMessage::new(ERROR_CODE_SERVER_ERROR, REDACTED_SERVER_ERROR)
        };
        ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, body)
    }
}

/// `T` as the failure itself, a context layer, or anywhere in the cause chain.
fn find_cause<T>(err: &anyhow::Error) -> Option<&T>
where
    T: std::error::Error + Send + Sync + 'static,
{
    err.downcast_ref::<T>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<T>()))
}
