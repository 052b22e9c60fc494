//! OCPP-J Node - CLI for the OCPP-J engine
//!
//! Runs either end of an OCPP 2.0.1 link and exposes it as JSON lines:
//! intents are read from stdin, events and receipts are written to stdout,
//! logs go to stderr.
//!
//! # Usage
//!
//! The bundled schemas are found relative to the workspace root; pass
//! `--schemas <dir>` when running from anywhere else.
//!
//! ```bash
//! # CSMS on port 9220, stations connect to ws://host:9220/ocpp/<id>
//! ocpp-j-node csms --listen 0.0.0.0:9220 --user CS001:secret
//!
//! # Charging station
//! ocpp-j-node cs --url ws://localhost:9220/ocpp --station CS001 --password secret
//!
//! # Then, on stdin:
//! {"msgType": 2, "command": "Heartbeat", "data": {}}
//! {"msgType": 99, "command": "close"}
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use ocpp_j::{
    BackoffConfig, ClientHandle, CsmsConfig, CsmsHandle, CsmsServer, Event, Intent, OcppError,
    Receipt, SchemaRegistry, StationClient, StationConfig,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// OCPP-J message exchange node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding <Action>Request.json / <Action>Response.json schemas
    #[arg(long, default_value = "ocpp-j/schemas")]
    schemas: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds an outstanding request waits for its reply
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Do not answer rejected inbound CALLs with a CALLERROR
    #[arg(long)]
    no_call_errors: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run as a charging station
    Cs(StationArgs),
    /// Run as a CSMS
    Csms(CsmsArgs),
}

#[derive(ClapArgs, Debug)]
struct StationArgs {
    /// CSMS WebSocket URL (without station ID)
    #[arg(long, default_value = "ws://localhost:9220/ocpp")]
    url: String,

    /// Station identity
    #[arg(short, long, default_value = "CS001")]
    station: String,

    /// Basic auth password
    #[arg(long)]
    password: Option<String>,

    /// Wait for a connect command instead of connecting at startup
    #[arg(long)]
    no_auto_connect: bool,

    /// Keepalive ping interval in seconds
    #[arg(long, default_value = "30")]
    ping: u64,

    /// Minimum reconnect wait in seconds
    #[arg(long, default_value = "5")]
    backoff_min: u64,

    /// Maximum reconnect wait in seconds
    #[arg(long, default_value = "360")]
    backoff_max: u64,

    /// Reconnect wait increment in seconds
    #[arg(long, default_value = "5")]
    backoff_inc: u64,
}

#[derive(ClapArgs, Debug)]
struct CsmsArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9220")]
    listen: SocketAddr,

    /// Path prefix in front of the station identity
    #[arg(long, default_value = "/ocpp")]
    base_path: String,

    /// Allowed station credentials as ID:PASSWORD (can be repeated)
    #[arg(long)]
    user: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let schemas = Arc::new(SchemaRegistry::from_dir(&args.schemas)?);

    let timeout = Duration::from_secs(args.timeout);

    match args.role {
        Role::Cs(station) => run_station(station, timeout, args.no_call_errors, schemas).await,
        Role::Csms(csms) => run_csms(csms, timeout, args.no_call_errors, schemas).await,
    }
}

async fn run_station(
    args: StationArgs,
    timeout: Duration,
    no_call_errors: bool,
    schemas: Arc<SchemaRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = StationConfig::new(&args.url, &args.station)
        .with_message_timeout(timeout)
        .with_ping_interval(Duration::from_secs(args.ping))
        .with_backoff(BackoffConfig::new(
            Duration::from_secs(args.backoff_min),
            Duration::from_secs(args.backoff_max),
            Duration::from_secs(args.backoff_inc),
        ));
    if let Some(password) = args.password {
        config = config.with_password(password);
    }
    if args.no_auto_connect {
        config = config.without_auto_connect();
    }
    if no_call_errors {
        config = config.without_call_error_replies();
    }

    banner("Charging Station", &[("Station", &args.station), ("CSMS", &args.url)]);

    let (client, handle, events) = StationClient::new(config, schemas);
    tokio::spawn(async move {
        if let Err(e) = client.run().await {
            error!("Station client failed: {}", e);
        }
    });

    pump(Node::Station(handle), events).await;
    Ok(())
}

async fn run_csms(
    args: CsmsArgs,
    timeout: Duration,
    no_call_errors: bool,
    schemas: Arc<SchemaRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CsmsConfig::new(args.listen)
        .with_base_path(&args.base_path)
        .with_message_timeout(timeout);
    for entry in &args.user {
        match entry.split_once(':') {
            Some((station, password)) => config = config.with_user(station, password),
            None => warn!("Ignoring --user {}: expected ID:PASSWORD", entry),
        }
    }
    if no_call_errors {
        config = config.without_call_error_replies();
    }

    let listen = args.listen.to_string();
    banner("CSMS", &[("Listen", &listen), ("Path", &args.base_path)]);

    let (server, handle, events) = CsmsServer::bind(config, schemas).await?;
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("CSMS stopped: {}", e);
        }
    });

    pump(Node::Csms(handle), events).await;
    Ok(())
}

enum Node {
    Station(ClientHandle),
    Csms(CsmsHandle),
}

impl Node {
    async fn submit(&self, intent: Intent) -> Result<Receipt, OcppError> {
        match self {
            Node::Station(handle) => handle.submit(intent).await,
            Node::Csms(handle) => handle.submit(intent).await,
        }
    }
}

/// Shuttle stdin intents into the node and node events onto stdout
async fn pump(node: Node, mut events: mpsc::Receiver<Event>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let outcome = match line.parse::<Intent>() {
                        Ok(intent) => node.submit(intent).await,
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(receipt) => emit(&receipt),
                        Err(e) => {
                            warn!("Intent failed: {}", e);
                            emit(&json!({ "error": e.to_string() }));
                        }
                    }
                }
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },

            event = events.recv() => match event {
                Some(event) => emit(&event),
                None => break,
            },
        }
    }
}

fn emit<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

fn banner(role: &str, rows: &[(&str, &str)]) {
    eprintln!();
    eprintln!("╔══════════════════════════════════════════════════════════════╗");
    eprintln!("║  OCPP-J Node - {:<46}║", role);
    eprintln!("╠══════════════════════════════════════════════════════════════╣");
    for (label, value) in rows {
        eprintln!("║  {:<8} {:<51}║", format!("{}:", label), truncate(value, 50));
    }
    eprintln!("╚══════════════════════════════════════════════════════════════╝");
    eprintln!();
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
