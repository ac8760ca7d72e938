use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use frontdoor_common::{
    config::{certs_dir, DEFAULT_REST_LISTENER, DEFAULT_WS_LISTENER},
    ListenerConfig, ServerCertPath,
};
use frontdoor_server::{BuiltinExecutor, ErrorDetail, FrontDoorConfig, FrontDoorServer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frontdoor-server")]
#[command(about = "Mutually authenticated HTTPS and WSS front door")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Address of the request/response listener
    #[arg(long, env = "FRONTDOOR_REST_LISTENER", default_value = DEFAULT_REST_LISTENER)]
    rest_listener: SocketAddr,

    /// Address of the persistent-socket listener
    #[arg(long, env = "FRONTDOOR_WS_LISTENER", default_value = DEFAULT_WS_LISTENER)]
    ws_listener: SocketAddr,

    /// Directory holding `server/` material and `root-ca.pem`
    #[arg(long, env = "FRONTDOOR_CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Reject clients that do not present a trusted certificate
    #[arg(
        long,
        env = "FRONTDOOR_SSL_CLIENT_AUTH",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    require_client_auth: bool,

    /// Include failure detail in generic server errors for authenticated peers
    #[arg(long)]
    verbose_errors: bool,

    /// Seconds allowed for a TLS handshake
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Topics known to the builtin executor
    #[arg(long, value_delimiter = ',', default_value = "orders,pageviews")]
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Starting frontdoor server...");

    let cert_path = ServerCertPath::in_dir(args.certs_dir.unwrap_or_else(certs_dir));
    let handshake_timeout = Duration::from_secs(args.handshake_timeout_secs);
    let listener = |addr| {
        ListenerConfig::new(addr, cert_path.clone())
            .with_client_auth(args.require_client_auth)
            .with_handshake_timeout(handshake_timeout)
    };

    let detail = if args.verbose_errors {
        ErrorDetail::Verbose
    } else {
        ErrorDetail::Redacted
    };
    let config = FrontDoorConfig::new(listener(args.rest_listener), listener(args.ws_listener))
        .with_error_detail(detail);
    let executor = Arc::new(BuiltinExecutor::new().with_topics(args.topics));

    let server = FrontDoorServer::new(config, executor)
        .start()
        .await
        .context("Failed to start server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    server.shutdown().await
}
