//! Frontdoor Server Library
//!
//! Two TLS listeners in front of a command execution engine:
//!
//! - a request/response (HTTPS) listener, see [`rest`]
//! - a persistent-socket (WSS) listener, see [`ws`]
//!
//! Both run every accepted socket through the same [`TlsGate`] before any
//! application byte is read, and render every failure raised after admission
//! through one [`ErrorMapper`].

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use frontdoor_common::ListenerConfig;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::Instrument;
use uuid::Uuid;

pub mod executor;
pub mod failure;
pub mod gate;
pub mod mapper;
pub mod rest;
pub mod ws;

pub use executor::{BuiltinExecutor, CommandExecutor, RowStream};
pub use failure::{RestException, StatusError};
pub use gate::{ConnectionOutcome, HandshakeRejection, PeerIdentity, TlsGate};
pub use mapper::{ErrorDetail, ErrorMapper, RequestContext};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection task on both listeners.
pub struct AppState {
    pub executor:             Arc<dyn CommandExecutor>,
    pub mapper:               ErrorMapper,
    /// Reported by the info endpoint
    pub client_auth_required: bool,
}

/// Configuration of both listeners.
#[derive(Debug, Clone)]
pub struct FrontDoorConfig {
    /// Request/response listener
    pub rest:         ListenerConfig,
    /// Persistent-socket listener
    pub ws:           ListenerConfig,
    /// Detail included in unclassified failures
    pub error_detail: ErrorDetail,
}

impl FrontDoorConfig {
    pub fn new(rest: ListenerConfig, ws: ListenerConfig) -> Self {
        Self {
            rest,
            ws,
            error_detail: ErrorDetail::default(),
        }
    }

    /// Set the detail level for unclassified failures
    pub fn with_error_detail(mut self, detail: ErrorDetail) -> Self {
        self.error_detail = detail;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Rest,
    Socket,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Socket => "ws",
        }
    }
}

/// A front door that has not started listening yet.
pub struct FrontDoorServer {
    config:   FrontDoorConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl FrontDoorServer {
    pub fn new(config: FrontDoorConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, executor }
    }

    /// Configure both TLS gates, bind both listeners and start accepting.
    ///
    /// Certificate problems and bind failures are reported here, before any
    /// connection is accepted.
    pub async fn start(self) -> Result<RunningServer> {
        let rest_gate = TlsGate::new(&self.config.rest).context("Failed to configure REST listener TLS")?;
        let ws_gate = TlsGate::new(&self.config.ws).context("Failed to configure socket listener TLS")?;

        let rest_listener = bind(&self.config.rest).await?;
        let ws_listener = bind(&self.config.ws).await?;
        let rest_addr = rest_listener.local_addr()?;
        let ws_addr = ws_listener.local_addr()?;

        let state = Arc::new(AppState {
            executor:             self.executor,
            mapper:               ErrorMapper::new(self.config.error_detail),
            client_auth_required: self.config.rest.require_client_auth,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(accept_loop(
                Endpoint::Rest,
                rest_listener,
                rest_gate,
                state.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(accept_loop(
                Endpoint::Socket,
                ws_listener,
                ws_gate,
                state,
                shutdown_rx,
            )),
        ];

        tracing::info!("✓ Front door listening: rest on {}, ws on {}", rest_addr, ws_addr);
        Ok(RunningServer {
            rest_addr,
            ws_addr,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Handle to a started front door. Dropping it without calling
/// [`RunningServer::shutdown`] also stops the listeners.
pub struct RunningServer {
    rest_addr: SocketAddr,
    ws_addr:   SocketAddr,
    shutdown:  watch::Sender<bool>,
    tasks:     Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Bound address of the request/response listener
    pub fn rest_addr(&self) -> SocketAddr {
        self.rest_addr
    }

    /// Bound address of the persistent-socket listener
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Stop accepting on both listeners and wait for the accept loops to exit.
    /// Connections already admitted finish on their own.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!("Server shutdown signal received, stopping gracefully");
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.await.context("Accept loop terminated abnormally")?;
        }
        Ok(())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn bind(config: &ListenerConfig) -> Result<TcpListener> {
    TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))
}

async fn accept_loop(
    endpoint: Endpoint,
    listener: TcpListener,
    gate: TlsGate,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("Stopped accepting on {} listener", endpoint.name());
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, peer_addr)) => {
                        let span = tracing::info_span!(
                            "connection",
                            id = %Uuid::new_v4(),
                            endpoint = endpoint.name(),
                            peer = %peer_addr,
                        );
                        let gate = gate.clone();
                        let state = state.clone();
                        tokio::spawn(
                            handle_connection(endpoint, tcp, peer_addr, gate, state).instrument(span),
                        );
                    }
                    Err(e) => accept_failed(endpoint, &e).await,
                }
            }
        }
    }
}

/// Pause after a failed accept. Errors such as running out of file
/// descriptors persist until some connection closes.
async fn accept_failed(endpoint: Endpoint, err: &io::Error) {
    tracing::error!("Failed to accept on {} listener: {}", endpoint.name(), err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn handle_connection(
    endpoint: Endpoint,
    tcp: TcpStream,
    peer_addr: SocketAddr,
    gate: TlsGate,
    state: Arc<AppState>,
) {
    tracing::debug!("New connection received");
    match gate.admit(tcp, peer_addr).await {
        ConnectionOutcome::Admitted { stream, peer } => match endpoint {
            Endpoint::Rest => rest::serve_connection(stream, peer, state).await,
            Endpoint::Socket => ws::serve_connection(stream, peer, state).await,
        },
        ConnectionOutcome::RejectedAtHandshake(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn failed_accept_backs_off_before_retrying() {
        let err = io::Error::new(io::ErrorKind::Other, "Too many open files");
        let started = Instant::now();
        accept_failed(Endpoint::Rest, &err).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }
}
