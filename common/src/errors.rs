//! Error code registry.
//!
//! Stable, machine-readable error codes returned in the `errorCode` field of
//! every error entity. The table is fixed at compile time and only ever grows;
//! codes are never reassigned. Lookup is total: statuses without an entry
//! resolve to [`ERROR_CODE_SERVER_ERROR`].

use http::StatusCode;

pub const ERROR_CODE_BAD_REQUEST: i32 = 40000;
pub const ERROR_CODE_BAD_STATEMENT: i32 = 40001;
pub const ERROR_CODE_QUERY_ENDPOINT: i32 = 40002;
pub const ERROR_CODE_UNAUTHORIZED: i32 = 40100;
pub const ERROR_CODE_FORBIDDEN: i32 = 40300;
pub const ERROR_CODE_FORBIDDEN_ACCESS: i32 = 40301;
pub const ERROR_CODE_NOT_FOUND: i32 = 40400;
pub const ERROR_CODE_METHOD_NOT_ALLOWED: i32 = 40500;
pub const ERROR_CODE_NOT_ACCEPTABLE: i32 = 40600;
pub const ERROR_CODE_REQUEST_TIMEOUT: i32 = 40800;
pub const ERROR_CODE_CONFLICT: i32 = 40900;
pub const ERROR_CODE_PAYLOAD_TOO_LARGE: i32 = 41300;
pub const ERROR_CODE_UNSUPPORTED_MEDIA_TYPE: i32 = 41500;
pub const ERROR_CODE_TOO_MANY_REQUESTS: i32 = 42900;
pub const ERROR_CODE_SERVER_ERROR: i32 = 50000;
pub const ERROR_CODE_NOT_IMPLEMENTED: i32 = 50100;
pub const ERROR_CODE_BAD_GATEWAY: i32 = 50200;
pub const ERROR_CODE_SERVICE_UNAVAILABLE: i32 = 50300;
pub const ERROR_CODE_COMMAND_QUEUE_CATCHUP_TIMEOUT: i32 = 50301;
pub const ERROR_CODE_SERVER_SHUTTING_DOWN: i32 = 50302;
pub const ERROR_CODE_SERVER_NOT_READY: i32 = 50303;
pub const ERROR_CODE_GATEWAY_TIMEOUT: i32 = 50400;

/// Status code to error code. Append only.
const STATUS_TABLE: &[(u16, i32)] = &[
    (400, ERROR_CODE_BAD_REQUEST),
    (401, ERROR_CODE_UNAUTHORIZED),
    (403, ERROR_CODE_FORBIDDEN),
    (404, ERROR_CODE_NOT_FOUND),
    (405, ERROR_CODE_METHOD_NOT_ALLOWED),
    (406, ERROR_CODE_NOT_ACCEPTABLE),
    (408, ERROR_CODE_REQUEST_TIMEOUT),
    (409, ERROR_CODE_CONFLICT),
    (413, ERROR_CODE_PAYLOAD_TOO_LARGE),
    (415, ERROR_CODE_UNSUPPORTED_MEDIA_TYPE),
    (429, ERROR_CODE_TOO_MANY_REQUESTS),
    (500, ERROR_CODE_SERVER_ERROR),
    (501, ERROR_CODE_NOT_IMPLEMENTED),
    (502, ERROR_CODE_BAD_GATEWAY),
    (503, ERROR_CODE_SERVICE_UNAVAILABLE),
    (504, ERROR_CODE_GATEWAY_TIMEOUT),
];

/// Error code registered for `status`, or [`ERROR_CODE_SERVER_ERROR`] if the
/// status has no entry.
pub fn to_error_code(status: StatusCode) -> i32 {
    let status = status.as_u16();
    STATUS_TABLE
        .iter()
        .find(|(registered, _)| *registered == status)
        .map_or(ERROR_CODE_SERVER_ERROR, |(_, code)| *code)
}

/// Failure categories finer than a bare status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A statement could not be parsed or executed
    BadStatement,
    /// A streaming query was sent to the request/response endpoint
    QueryEndpoint,
    /// The caller is authenticated but lacks access to a backing resource
    ForbiddenAccess,
    /// Timed out waiting for prior commands to be applied
    CommandQueueCatchupTimeout,
    ServerShuttingDown,
    ServerNotReady,
    /// Catch-all for anything not otherwise classified
    ServerError,
}

impl ErrorCategory {
    pub const fn error_code(self) -> i32 {
        match self {
            Self::BadStatement => ERROR_CODE_BAD_STATEMENT,
            Self::QueryEndpoint => ERROR_CODE_QUERY_ENDPOINT,
            Self::ForbiddenAccess => ERROR_CODE_FORBIDDEN_ACCESS,
            Self::CommandQueueCatchupTimeout => ERROR_CODE_COMMAND_QUEUE_CATCHUP_TIMEOUT,
            Self::ServerShuttingDown => ERROR_CODE_SERVER_SHUTTING_DOWN,
            Self::ServerNotReady => ERROR_CODE_SERVER_NOT_READY,
            Self::ServerError => ERROR_CODE_SERVER_ERROR,
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::BadStatement | Self::QueryEndpoint => StatusCode::BAD_REQUEST,
            Self::ForbiddenAccess => StatusCode::FORBIDDEN,
            Self::CommandQueueCatchupTimeout
            | Self::ServerShuttingDown
            | Self::ServerNotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
