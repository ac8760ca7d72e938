//! Persistent-socket endpoint: WebSocket upgrade over an admitted TLS stream.
//!
//! The upgrade request names the command to stream in its `request` query
//! parameter. Refused upgrades carry a mapped error entity in the HTTP
//! response; once upgraded, failures are sent as a text message followed by
//! a close frame.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use frontdoor_common::{CommandRequest, ErrorResponse};
use futures_util::{FutureExt, SinkExt, StreamExt};
use http::{header::CONTENT_TYPE, HeaderValue};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse as RefusalResponse, Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use url::form_urlencoded;

use crate::{
    failure::StatusError,
    gate::PeerIdentity,
    mapper::RequestContext,
    AppState,
};

/// Upgrade target for streamed commands
pub const QUERY_PATH: &str = "/ws/query";
/// Query parameter carrying the JSON encoded [`CommandRequest`]
pub const REQUEST_PARAM: &str = "request";

/// Time allowed for the peer to answer our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Run the upgrade and then stream the requested command's rows.
pub async fn serve_connection<IO>(stream: IO, peer: PeerIdentity, state: Arc<AppState>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ctx = RequestContext {
        authenticated: peer.is_authenticated(),
    };
    let mapper = state.mapper;

    let mut command = None;
    let upgrade = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_upgrade(req) {
            Ok(request) => {
                command = Some(request);
                Ok(resp)
            }
            Err(err) => {
                let error = mapper.to_response(&err, &ctx);
                tracing::warn!("Refused socket upgrade: {}", error.body.message);
                Err(refusal(&error))
            }
        }
    })
    .await;

    let mut socket = match upgrade {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!("Socket upgrade did not complete: {}", e);
            return;
        }
    };
    let Some(command) = command else {
        return;
    };

    tracing::info!("Streaming '{}' to {}", command.command, peer);
    if let Err(e) = stream_rows(&mut socket, &state, &command, &ctx).await {
        tracing::debug!("Socket session ended with error: {:#}", e);
    }
}

/// Command named by the upgrade request, or the failure that refuses it.
fn parse_upgrade(req: &Request) -> Result<CommandRequest> {
    let uri = req.uri();
    if uri.path() != QUERY_PATH {
        return Err(StatusError::not_found(uri.path()).into());
    }

    let raw = form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .find(|(key, _)| key == REQUEST_PARAM)
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| StatusError::bad_request(format!("Missing '{REQUEST_PARAM}' parameter")))?;

    let request = serde_json::from_str(&raw)
        .map_err(|e| StatusError::bad_request(format!("Malformed '{REQUEST_PARAM}' parameter: {e}")))?;
    Ok(request)
}

fn refusal(error: &ErrorResponse) -> RefusalResponse {
    let mut response = RefusalResponse::new(Some(error.to_json()));
    *response.status_mut() = error.status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn stream_rows<IO>(
    socket: &mut WebSocketStream<IO>,
    state: &AppState,
    command: &CommandRequest,
    ctx: &RequestContext,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = AssertUnwindSafe(pump(socket, state, command)).catch_unwind().await;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) if is_transport(&err) => return Err(err),
        Ok(Err(err)) => Some(state.mapper.to_response(&err, ctx)),
        Err(panic) => Some(state.mapper.from_panic(panic, ctx)),
    };

    let frame = match failure {
        None => CloseFrame {
            code:   CloseCode::Normal,
            reason: "done".into(),
        },
        Some(error) => {
            socket
                .send(Message::text(error.to_json()))
                .await
                .context("Failed to send error entity")?;
            CloseFrame {
                code:   CloseCode::Error,
                reason: "command failed".into(),
            }
        }
    };
    close(socket, frame).await
}

/// Marker for failures of the socket itself, which cannot be reported on it.
#[derive(Debug, thiserror::Error)]
#[error("socket write failed")]
struct TransportFailure;

fn is_transport(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransportFailure>().is_some()
}

async fn pump<IO>(
    socket: &mut WebSocketStream<IO>,
    state: &AppState,
    command: &CommandRequest,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut rows = state.executor.stream(command).await?;
    let mut sent = 0usize;
    while let Some(row) = rows.next().await {
        let text = serde_json::to_string(&row?).context("Failed to serialize row")?;
        socket
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow::Error::new(e).context(TransportFailure))?;
        sent += 1;
    }
    tracing::debug!("Sent {} rows", sent);
    Ok(())
}

/// Send `frame` and wait briefly for the peer's close.
async fn close<IO>(socket: &mut WebSocketStream<IO>, frame: CloseFrame) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    socket
        .close(Some(frame))
        .await
        .context("Failed to send close frame")?;
    let _ = timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;
    Ok(())
}
