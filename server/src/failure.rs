//! Failure types raised while serving an admitted request.
//!
//! Anything that is neither of these is an unclassified failure and is
//! rendered as a generic server error by the mapper.

use frontdoor_common::{ErrorCategory, ErrorMessage, ErrorResponse};
use http::StatusCode;
use thiserror::Error;

/// A domain failure that carries its own pre-built wire response.
///
/// The response is returned to the caller verbatim, which allows shapes the
/// generic mapping cannot infer, such as echoing the failing statement back.
#[derive(Debug, Clone, Error)]
#[error("{}", .response.body.message)]
pub struct RestException {
    response: ErrorResponse,
}

impl RestException {
    pub fn new(response: ErrorResponse) -> Self {
        Self { response }
    }

    /// Failure in the given category with the category's status and code.
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(ErrorResponse::new(
            category.status(),
            ErrorMessage::new(category.error_code(), message),
        ))
    }

    /// A statement the engine rejected. The statement is echoed back in
    /// `statementText`.
    pub fn bad_statement(message: impl Into<String>, statement: impl Into<String>) -> Self {
        let category = ErrorCategory::BadStatement;
        Self::new(ErrorResponse::new(
            category.status(),
            ErrorMessage::new(category.error_code(), message).with_statement_text(statement),
        ))
    }

    /// A streaming query sent to the request/response endpoint.
    pub fn query_endpoint(statement: impl Into<String>) -> Self {
        let category = ErrorCategory::QueryEndpoint;
        Self::new(ErrorResponse::new(
            category.status(),
            ErrorMessage::new(
                category.error_code(),
                "The command must be sent over the socket endpoint to stream results",
            )
            .with_statement_text(statement),
        ))
    }

    pub fn server_not_ready(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::ServerNotReady, message)
    }

    pub fn server_shutting_down() -> Self {
        Self::from_category(
            ErrorCategory::ServerShuttingDown,
            "The server is shutting down",
        )
    }

    pub fn response(&self) -> &ErrorResponse {
        &self.response
    }

    pub fn into_response(self) -> ErrorResponse {
        self.response
    }
}

/// A generic framework failure: only an HTTP status and a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StatusError {
    pub status:  StatusCode,
    pub message: String,
}

impl StatusError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("No resource at {path}"))
    }

    pub fn method_not_allowed(method: &http::Method, path: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method {method} not allowed on {path}"),
        )
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Request body exceeds {limit} bytes"),
        )
    }
}
