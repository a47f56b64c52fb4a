//! Shipwatch CLI
//!
//! Follow shipments live from the command line:
//! - `track`: one shipment by tracking code
//! - `dispatch`: every shipment in transit
//! - `config`: print or write the default configuration
//!
//! Locations are printed to stdout as JSON lines, logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shipwatch::broker::{ConnectionState, StompTransport, Transport};
use shipwatch::config::{generate_default_config, Config, LoggingConfig};
use shipwatch::session::{DispatchBoard, SessionSettings, UserTracker};
use shipwatch::tracking::{FleetSnapshot, LocationUpdate};

#[derive(Parser)]
#[command(name = "shipwatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live shipment tracking over a STOMP broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Broker WebSocket URL, overriding the config
    #[arg(long, global = true)]
    pub broker_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow one shipment
    Track {
        /// Tracking code. Without it, codes are read from stdin, one per line,
        /// and each line switches to the new code.
        code: Option<String>,
    },

    /// Follow every shipment in transit
    Dispatch,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("Wrote default config to {}", path.display());
            }
            None => print!("{content}"),
        }
        return Ok(());
    }

    let loaded = match &cli.config {
        Some(path) => Config::load_with_env(path),
        None => Config::load_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            // No config means no logging settings yet
            init_logging(&LoggingConfig::default())?;
            tracing::error!(error = %e, "Failed to load config");
            return Err(e).context("no usable configuration");
        }
    };
    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }

    init_logging(&config.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.url,
        "Shipwatch starting"
    );

    let transport: Arc<dyn Transport> = Arc::new(StompTransport::new(config.broker.stomp_config()));
    let settings = SessionSettings::from_config(&config);

    match cli.command {
        Commands::Track { code } => track(transport, settings, code).await,
        Commands::Dispatch => dispatch(transport, settings).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("shipwatch={}", logging.level)))
        .with_context(|| format!("invalid log level {:?}", logging.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    if !matches!(logging.format.as_str(), "json" | "pretty") {
        tracing::warn!(format = %logging.format, "Unknown log format, using pretty");
    }
    Ok(())
}

/// Log every connection state change until aborted
fn log_connection(mut states: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(state = %state, "Connection state");
        }
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize output"),
    }
}

async fn track(
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    code: Option<String>,
) -> anyhow::Result<()> {
    let mut tracker = UserTracker::new(transport, settings);
    tracker
        .binding()
        .subscribe(|location: &Option<Arc<LocationUpdate>>| {
            if let Some(update) = location {
                print_json(update.as_ref());
            }
        });
    let logger = log_connection(tracker.watch_connection());

    match code {
        Some(code) => {
            let topic = tracker.track(&code).await?;
            eprintln!("Tracking {topic}, waiting for signal");
            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        }
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line.context("failed to read stdin")? {
                        Some(line) if line.trim().is_empty() => continue,
                        Some(line) => match tracker.track(&line).await {
                            Ok(topic) => eprintln!("Tracking {topic}, waiting for signal"),
                            Err(e) => eprintln!("{e}"),
                        },
                        None => {
                            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    tracker.stop().await;
    logger.abort();
    Ok(())
}

async fn dispatch(transport: Arc<dyn Transport>, settings: SessionSettings) -> anyhow::Result<()> {
    let mut board = DispatchBoard::new(transport, settings);
    board.binding().subscribe(|fleet: &FleetSnapshot| {
        print_json(&serde_json::json!({
            "active": fleet.len(),
            "cargos": fleet.sorted(),
        }));
    });
    let logger = log_connection(board.watch_connection());

    let topic = board.mount().await?;
    eprintln!("Watching {topic}");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down...");
    board.unmount().await;
    logger.abort();
    Ok(())
}
