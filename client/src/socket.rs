//! Persistent-socket client.
//!
//! [`SocketClient::connect`] performs the TLS handshake and the WebSocket
//! upgrade before returning, so a refused handshake is reported to the caller
//! directly and no listener method is ever invoked for it. Once upgraded, a
//! reader task delivers events to the [`SocketListener`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use frontdoor_common::{CommandRequest, ErrorMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{
    client_async,
    tungstenite::{self, protocol::CloseFrame, Message},
};
use url::form_urlencoded;
use uuid::Uuid;

use crate::{client::Endpoint, ClientConfig, ClientError};

/// Upgrade target for streamed commands
pub const QUERY_PATH: &str = "/ws/query";

/// Receiver of session events, invoked from the session's reader task.
pub trait SocketListener: Send + Sync {
    /// The upgrade completed. Called once, before any other event.
    fn on_connect(&self, _session: &SocketSession) {}

    /// The session failed or was closed abnormally by the server.
    fn on_error(&self, error: ClientError);

    /// A text message arrived.
    fn on_message(&self, message: String);
}

/// Client for the persistent-socket listener.
#[derive(Clone)]
pub struct SocketClient {
    endpoint: Endpoint,
}

impl SocketClient {
    /// Client for the server at `base_url`, e.g. `wss://localhost:8089`.
    pub fn new(base_url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, &config)?,
        })
    }

    /// Open a session streaming the results of `request`.
    pub async fn connect(
        &self,
        request: &CommandRequest,
        listener: Arc<dyn SocketListener>,
    ) -> Result<SocketSession, ClientError> {
        let json = serde_json::to_string(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("request", &json)
            .finish();
        self.connect_target(&format!("{QUERY_PATH}?{query}"), listener)
            .await
    }

    /// Open a session against an arbitrary path and query.
    pub async fn connect_target(
        &self,
        path_and_query: &str,
        listener: Arc<dyn SocketListener>,
    ) -> Result<SocketSession, ClientError> {
        let stream = self.endpoint.connect().await?;

        let mut url = self.endpoint.url.clone();
        url.set_path("");
        url.set_query(None);
        let target = format!("{}{}", url.as_str().trim_end_matches('/'), path_and_query);

        let upgrade = tokio::time::timeout(self.endpoint.timeout, client_async(target, stream))
            .await
            .map_err(|_| ClientError::NoResponseWithinDeadline(self.endpoint.timeout))?;
        let (socket, _) = upgrade.map_err(upgrade_failure)?;

        let (mut sink, mut source) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let session = SocketSession {
            id: Uuid::new_v4(),
            outbound,
            closing: Arc::new(AtomicBool::new(false)),
        };
        tracing::debug!("Socket session {} open", session.id);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        listener.on_connect(&session);

        let reader = session.clone();
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Message::Text(text)) => listener.on_message(text.to_string()),
                    Ok(Message::Binary(data)) => {
                        listener.on_message(String::from_utf8_lossy(&data).into_owned())
                    }
                    Ok(Message::Close(frame)) => {
                        // A close the client did not ask for ends the session,
                        // normal or not, so the listener always hears about it.
                        if !reader.is_closing() {
                            listener.on_error(close_error(frame.as_ref()));
                        }
                        reader.close();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !reader.is_closing() {
                            listener.on_error(session_failure(e));
                        }
                        return;
                    }
                }
            }
            if !reader.is_closing() {
                listener.on_error(ClientError::ConnectionClosed);
            }
        });

        Ok(session)
    }
}

/// Handle to an open socket session. Cheap to clone.
#[derive(Clone)]
pub struct SocketSession {
    id:       Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    closing:  Arc<AtomicBool>,
}

impl SocketSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a text message to the server.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outbound
            .send(Message::text(text.into()))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Begin closing the session. Best effort and idempotent; failures are
    /// ignored.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closing socket session {}", self.id);
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSession")
            .field("id", &self.id)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Error reported for a close frame received before the client closed.
fn close_error(frame: Option<&CloseFrame>) -> ClientError {
    match frame {
        Some(frame) => ClientError::ClosedByPeer {
            code:   frame.code.into(),
            reason: frame.reason.to_string(),
        },
        None => ClientError::ConnectionClosed,
    }
}

fn upgrade_failure(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .and_then(|body| serde_json::from_slice::<ErrorMessage>(body).ok());
            ClientError::UpgradeRejected {
                status: response.status(),
                body,
            }
        }
        tungstenite::Error::Io(io_err) => ClientError::establishing(io_err),
        other => session_failure(other),
    }
}

fn session_failure(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Io(io_err) => ClientError::on_established(&io_err),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ClientError::ConnectionClosed
        }
        other => ClientError::on_established(&other),
    }
}

/// The event that ended a session from the listener's point of view.
#[derive(Debug, Clone)]
pub enum TerminalSocketEvent {
    ErrorObserved(Arc<ClientError>),
    MessageObserved(String),
}

impl TerminalSocketEvent {
    /// The message, decoded as an error entity, if it is one.
    pub fn error_entity(&self) -> Option<ErrorMessage> {
        match self {
            Self::MessageObserved(text) => serde_json::from_str(text).ok(),
            Self::ErrorObserved(_) => None,
        }
    }
}

/// Listener that keeps the first terminal event and closes the session.
///
/// The first of `on_error`/`on_message` wins; later events only close the
/// session again, which is harmless. Exactly one waiter is released.
#[derive(Default)]
pub struct TerminalEventListener {
    event:   OnceLock<TerminalSocketEvent>,
    session: OnceLock<SocketSession>,
    done:    Notify,
}

impl TerminalEventListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the terminal event. Times out with
    /// [`ClientError::NoResponseWithinDeadline`]; events arriving after that
    /// are still recorded and handled.
    pub async fn await_terminal_event(
        &self,
        deadline: Duration,
    ) -> Result<TerminalSocketEvent, ClientError> {
        if let Some(event) = self.event.get() {
            return Ok(event.clone());
        }
        tokio::time::timeout(deadline, self.done.notified())
            .await
            .map_err(|_| ClientError::NoResponseWithinDeadline(deadline))?;
        self.event.get().cloned().ok_or(ClientError::ConnectionClosed)
    }

    /// The recorded event, without waiting.
    pub fn terminal_event(&self) -> Option<&TerminalSocketEvent> {
        self.event.get()
    }

    fn complete(&self, event: TerminalSocketEvent) {
        let won = self.event.set(event).is_ok();
        if let Some(session) = self.session.get() {
            session.close();
        }
        if won {
            self.done.notify_one();
        } else {
            tracing::debug!("Ignoring event after terminal event was recorded");
        }
    }
}

impl SocketListener for TerminalEventListener {
    fn on_connect(&self, session: &SocketSession) {
        let _ = self.session.set(session.clone());
    }

    fn on_error(&self, error: ClientError) {
        self.complete(TerminalSocketEvent::ErrorObserved(Arc::new(error)));
    }

    fn on_message(&self, message: String) {
        self.complete(TerminalSocketEvent::MessageObserved(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_session() -> (SocketSession, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = SocketSession {
            id: Uuid::new_v4(),
            outbound,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (session, rx)
    }

    #[tokio::test]
    async fn first_event_wins() {
        let listener = TerminalEventListener::new();
        listener.on_message("first".into());
        listener.on_error(ClientError::ConnectionClosed);
        listener.on_message("second".into());

        match listener.await_terminal_event(Duration::from_millis(10)).await.unwrap() {
            TerminalSocketEvent::MessageObserved(text) => assert_eq!(text, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiter_is_released_by_event_from_another_task() {
        let listener = TerminalEventListener::new();
        let producer = listener.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.on_error(ClientError::ConnectionClosed);
        });

        let event = listener.await_terminal_event(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(event, TerminalSocketEvent::ErrorObserved(_)));
    }

    #[tokio::test]
    async fn timeout_is_distinct_and_late_event_is_harmless() {
        let listener = TerminalEventListener::new();
        let err = listener
            .await_terminal_event(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoResponseWithinDeadline(_)));

        listener.on_message("late".into());
        assert!(matches!(
            listener.terminal_event(),
            Some(TerminalSocketEvent::MessageObserved(_))
        ));
    }

    #[tokio::test]
    async fn terminal_event_closes_session_once() {
        let (session, mut rx) = detached_session();
        let listener = TerminalEventListener::new();
        listener.on_connect(&session);

        listener.on_message("row".into());
        listener.on_message("another row".into());

        assert!(session.is_closing());
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_on_dead_session_is_swallowed() {
        let (session, rx) = detached_session();
        drop(rx);
        session.close();
        session.close();
        assert!(session.is_closing());
        assert!(session.send_text("x").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_events_release_one_waiter_and_keep_the_winner() {
        for _ in 0..50 {
            let listener = TerminalEventListener::new();
            let start = Arc::new(tokio::sync::Barrier::new(2));

            let (l, b) = (listener.clone(), start.clone());
            let error = tokio::spawn(async move {
                b.wait().await;
                l.on_error(ClientError::ConnectionClosed);
                format!("{:?}", l.terminal_event())
            });
            let (l, b) = (listener.clone(), start.clone());
            let message = tokio::spawn(async move {
                b.wait().await;
                l.on_message("row".into());
                format!("{:?}", l.terminal_event())
            });
            let seen = [error.await.unwrap(), message.await.unwrap()];
            let stored = format!("{:?}", listener.terminal_event());
            assert!(seen.iter().all(|s| *s == stored), "{seen:?} vs {stored}");

            // Exactly one notification was issued.
            let short = Duration::from_millis(20);
            assert!(tokio::time::timeout(short, listener.done.notified()).await.is_ok());
            assert!(tokio::time::timeout(short, listener.done.notified()).await.is_err());

            let event = listener.await_terminal_event(short).await.unwrap();
            assert_eq!(format!("{:?}", Some(&event)), stored);
        }
    }

    #[test]
    fn unrequested_close_is_always_an_error() {
        let normal = CloseFrame {
            code:   tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: "done".into(),
        };
        assert!(matches!(
            close_error(Some(&normal)),
            ClientError::ClosedByPeer { code: 1000, .. }
        ));
        assert!(matches!(close_error(None), ClientError::ConnectionClosed));
    }

    #[test]
    fn error_entity_is_decoded_from_message() {
        let event = TerminalSocketEvent::MessageObserved(
            r#"{"errorCode":40001,"message":"bad","statementText":"x;"}"#.into(),
        );
        assert_eq!(event.error_entity().unwrap().error_code, 40001);
        assert!(TerminalSocketEvent::MessageObserved("[1,2]".into()).error_entity().is_none());
    }
}
