use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frontdoor_client::{
    ClientConfig, RestClient, RestResponse, SocketClient, TerminalEventListener,
    TerminalSocketEvent,
};
use frontdoor_common::{
    config::{certs_dir, DEFAULT_REST_LISTENER, DEFAULT_WS_LISTENER},
    ClientCertPath, CommandRequest, CredentialConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frontdoor-client")]
#[command(about = "Frontdoor mutual TLS client")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Directory holding `client/` material and `root-ca.pem`
    #[arg(long, env = "FRONTDOOR_CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Connect without presenting a client certificate
    #[arg(long)]
    anonymous: bool,

    /// Skip the server host name check; the chain is still verified
    #[arg(long)]
    no_verify_hostname: bool,

    /// Seconds to wait for connections and responses
    #[arg(short, long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command over the request/response listener
    Command {
        /// Command text, e.g. "show topics;"
        command: String,
        #[arg(long, default_value_t = format!("https://{DEFAULT_REST_LISTENER}"))]
        url: String,
    },
    /// Check server health
    Health {
        #[arg(long, default_value_t = format!("https://{DEFAULT_REST_LISTENER}"))]
        url: String,
    },
    /// Stream a command over the socket listener and print the first event
    Ws {
        /// Command text, e.g. "print orders;"
        command: String,
        #[arg(long, default_value_t = format!("wss://{DEFAULT_WS_LISTENER}"))]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let paths = ClientCertPath::in_dir(args.certs_dir.unwrap_or_else(certs_dir));
    let credentials = if args.anonymous {
        CredentialConfig::new(paths.ca_path)
    } else {
        CredentialConfig::from_cert_path(paths)
    }
    .with_hostname_verification(!args.no_verify_hostname);
    let timeout = Duration::from_secs(args.timeout_secs);
    let config = ClientConfig::new()
        .with_credentials(credentials)
        .with_timeout(timeout);

    match args.command {
        Commands::Command { command, url } => {
            let client = RestClient::new(&url, config)?;
            let response = client
                .make_command_request(&command)
                .await
                .context("Failed to run command")?;
            print_response(response)?;
        }

        Commands::Health { url } => {
            let client = RestClient::new(&url, config)?;
            let mut connection = client.connect().await.context("Failed to connect")?;
            let response = connection.healthcheck().await;
            connection.close().await;
            print_response(response.context("Failed to check health")?)?;
        }

        Commands::Ws { command, url } => {
            let client = SocketClient::new(&url, config)?;
            let listener = TerminalEventListener::new();
            let request = CommandRequest::new(command).streamed();
            let _session = client
                .connect(&request, listener.clone())
                .await
                .context("Failed to open socket session")?;

            match listener.await_terminal_event(timeout).await? {
                TerminalSocketEvent::MessageObserved(message) => println!("{message}"),
                TerminalSocketEvent::ErrorObserved(error) => {
                    return Err(anyhow::anyhow!("Socket session failed: {error}"));
                }
            }
        }
    }

    Ok(())
}

fn print_response<T: serde::Serialize>(response: RestResponse<T>) -> Result<()> {
    match response {
        RestResponse::Success(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        RestResponse::Error(error) => {
            println!("{} {}", error.status, error.to_json());
        }
    }
    Ok(())
}
