//! Request/response endpoint served over an admitted TLS stream.
//!
//! Each request produces exactly one response. Handler failures, including
//! panics, are rendered by the [`ErrorMapper`](crate::mapper::ErrorMapper).

use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use frontdoor_common::{
    entity::{HealthCheck, ServerInfo},
    CommandRequest, ErrorResponse,
};
use futures_util::FutureExt;
use http::{header::CONTENT_TYPE, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    failure::StatusError,
    gate::PeerIdentity,
    mapper::RequestContext,
    AppState,
};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const COMMAND_PATH: &str = "/command";
pub const HEALTHCHECK_PATH: &str = "/healthcheck";
pub const INFO_PATH: &str = "/info";

/// Serve HTTP/1.1 on an admitted connection until the peer goes away.
pub async fn serve_connection<IO>(stream: IO, peer: PeerIdentity, state: Arc<AppState>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ctx = RequestContext {
        authenticated: peer.is_authenticated(),
    };
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle(&state, ctx, req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("Connection closed with error: {}", e);
    }
}

async fn handle(state: &AppState, ctx: RequestContext, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!("{} {}", method, path);

    match AssertUnwindSafe(route(state, req)).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => error_response(&state.mapper.to_response(&err, &ctx)),
        Err(panic) => error_response(&state.mapper.from_panic(panic, &ctx)),
    }
}

async fn route(state: &AppState, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let path = req.uri().path().to_string();
    match (path.as_str(), req.method()) {
        (COMMAND_PATH, &Method::POST) => {
            let request: CommandRequest = read_json(req).await?;
            let result = state.executor.execute(&request).await?;
            json_response(StatusCode::OK, &result)
        }
        (HEALTHCHECK_PATH, &Method::GET) => {
            json_response(StatusCode::OK, &HealthCheck { is_healthy: true })
        }
        (INFO_PATH, &Method::GET) => json_response(
            StatusCode::OK,
            &ServerInfo {
                version:              env!("CARGO_PKG_VERSION").to_string(),
                client_auth_required: state.client_auth_required,
            },
        ),
        (COMMAND_PATH | HEALTHCHECK_PATH | INFO_PATH, method) => {
            Err(StatusError::method_not_allowed(method, &path).into())
        }
        _ => Err(StatusError::not_found(&path).into()),
    }
}

/// Body of `req` decoded as JSON, bounded by [`MAX_BODY_BYTES`].
async fn read_json<T>(req: Request<Incoming>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                StatusError::payload_too_large(MAX_BODY_BYTES)
            } else {
                StatusError::bad_request(format!("Failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    let value = serde_json::from_slice(&body)
        .map_err(|e| StatusError::bad_request(format!("Malformed request body: {e}")))?;
    Ok(value)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value).context("Failed to serialize response body")?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .context("Failed to build response")
}

/// Wire form of a mapped failure. Cannot fail.
pub fn error_response(error: &ErrorResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(error.to_json())));
    *response.status_mut() = error.status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
