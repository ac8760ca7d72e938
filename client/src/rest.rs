//! Request/response client.
//!
//! [`RestClient::connect`] acquires a TLS connection and returns a
//! [`RestConnection`]. Release it with [`RestConnection::close`]; dropping it
//! on any other path aborts the connection.

use std::time::Duration;

use bytes::Bytes;
use frontdoor_common::{
    entity::{HealthCheck, ServerInfo},
    CommandRequest, CommandResult, ErrorMessage, ErrorResponse,
};
use http::{
    header::{CONTENT_TYPE, HOST},
    Method, Request, StatusCode,
};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::{client::Endpoint, ClientConfig, ClientError};

const COMMAND_PATH: &str = "/command";
const HEALTHCHECK_PATH: &str = "/healthcheck";
const INFO_PATH: &str = "/info";

/// How long a closing connection gets to shut down cleanly.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a request that reached application code.
#[derive(Debug, Clone, PartialEq)]
pub enum RestResponse<T> {
    Success(T),
    Error(ErrorResponse),
}

impl<T> RestResponse<T> {
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Success(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

/// Raw status and body of a response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body:   Bytes,
}

impl RawResponse {
    /// Decode a success body as `T` or an error body as an error entity.
    pub fn decode<T: DeserializeOwned>(self) -> Result<RestResponse<T>, ClientError> {
        if self.status.is_success() {
            serde_json::from_slice(&self.body)
                .map(RestResponse::Success)
                .map_err(|e| ClientError::Protocol(format!("Malformed response body: {e}")))
        } else {
            serde_json::from_slice::<ErrorMessage>(&self.body)
                .map(|body| RestResponse::Error(ErrorResponse::new(self.status, body)))
                .map_err(|e| {
                    ClientError::Protocol(format!(
                        "Malformed error entity with status {}: {e}",
                        self.status
                    ))
                })
        }
    }
}

/// Client for the request/response listener.
#[derive(Clone)]
pub struct RestClient {
    endpoint: Endpoint,
}

impl RestClient {
    /// Client for the server at `base_url`, e.g. `https://localhost:8088`.
    pub fn new(base_url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, &config)?,
        })
    }

    /// Establish a TLS connection. Handshake refusals are reported here when
    /// the TLS version lets the client observe them before sending data.
    pub async fn connect(&self) -> Result<RestConnection, ClientError> {
        let stream = self.endpoint.connect().await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClientError::on_established(&e))?;
        let conn = tokio::spawn(conn);

        Ok(RestConnection {
            sender: Some(sender),
            conn: Some(conn),
            authority: self.endpoint.authority(),
            timeout: self.endpoint.timeout,
        })
    }

    /// Connect, run one command and close.
    pub async fn make_command_request(
        &self,
        command: &str,
    ) -> Result<RestResponse<CommandResult>, ClientError> {
        let mut connection = self.connect().await?;
        let result = connection.make_command_request(command).await;
        connection.close().await;
        result
    }
}

/// An open connection to the request/response listener.
pub struct RestConnection {
    sender:    Option<SendRequest<Full<Bytes>>>,
    conn:      Option<JoinHandle<hyper::Result<()>>>,
    authority: String,
    timeout:   Duration,
}

impl RestConnection {
    /// Submit `command` to the execution engine.
    pub async fn make_command_request(
        &mut self,
        command: &str,
    ) -> Result<RestResponse<CommandResult>, ClientError> {
        let body = serde_json::to_vec(&CommandRequest::new(command))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.send(Method::POST, COMMAND_PATH, Bytes::from(body))
            .await?
            .decode()
    }

    pub async fn healthcheck(&mut self) -> Result<RestResponse<HealthCheck>, ClientError> {
        self.send(Method::GET, HEALTHCHECK_PATH, Bytes::new())
            .await?
            .decode()
    }

    pub async fn server_info(&mut self) -> Result<RestResponse<ServerInfo>, ClientError> {
        self.send(Method::GET, INFO_PATH, Bytes::new()).await?.decode()
    }

    /// Send an arbitrary request and return the undecoded response.
    pub async fn send(
        &mut self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<RawResponse, ClientError> {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, &self.authority)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let sender = self.sender.as_mut().ok_or(ClientError::ConnectionClosed)?;
        let exchange = async {
            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, hyper::Error>(RawResponse { status, body })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(self.failure(err).await),
            Err(_) => Err(ClientError::NoResponseWithinDeadline(self.timeout)),
        }
    }

    /// Classify a failed exchange. The connection task may hold a more
    /// precise cause than the request, such as the alert that ended it.
    async fn failure(&mut self, err: hyper::Error) -> ClientError {
        let classified = ClientError::on_established(&err);
        if classified.is_handshake_failure() {
            return classified;
        }
        self.sender = None;
        if let Some(conn) = self.conn.take() {
            if let Ok(Ok(Err(conn_err))) = tokio::time::timeout(CLOSE_GRACE, conn).await {
                let from_conn = ClientError::on_established(&conn_err);
                if from_conn.is_handshake_failure() {
                    return from_conn;
                }
            }
        }
        classified
    }

    /// Release the connection.
    pub async fn close(mut self) {
        self.sender = None;
        if let Some(conn) = self.conn.take() {
            let abort = conn.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, conn).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for RestConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use frontdoor_common::errors::ERROR_CODE_BAD_STATEMENT;
    use serde_json::json;

    use super::*;

    fn raw(status: StatusCode, body: serde_json::Value) -> RawResponse {
        RawResponse {
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn success_body_decodes_as_payload() {
        let response = raw(
            StatusCode::OK,
            json!({ "statementText": "status", "payload": "OK" }),
        )
        .decode::<CommandResult>()
        .unwrap();
        assert_eq!(response.success().unwrap().payload, json!("OK"));
    }

    #[test]
    fn error_body_decodes_as_entity_with_status() {
        let response = raw(
            StatusCode::BAD_REQUEST,
            json!({ "errorCode": ERROR_CODE_BAD_STATEMENT, "message": "bad", "statementText": "x;" }),
        )
        .decode::<CommandResult>()
        .unwrap();

        let error = response.error().unwrap();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.body.error_code, ERROR_CODE_BAD_STATEMENT);
        assert_eq!(error.body.statement_text.as_deref(), Some("x;"));
    }

    #[test]
    fn non_entity_error_body_is_a_protocol_error() {
        let response = RawResponse {
            status: StatusCode::BAD_GATEWAY,
            body:   Bytes::from_static(b"<html>upstream</html>"),
        };
        assert!(matches!(
            response.decode::<CommandResult>(),
            Err(ClientError::Protocol(_))
        ));
    }
}
