//! Supervised RabbitMQ consumer - Main Entry Point

use clap::{Parser, Subcommand};
use rmq_consumer::broker::{probe, AmqpDialer, Dialer};
use rmq_consumer::config::{ConfigStore, ConsumerConfig};
use rmq_consumer::error::redact_uri;
use rmq_consumer::manager::Manager;
use rmq_consumer::observability::{init_default_logging, HealthServer};
use rmq_consumer::watchdog::ReconnectTimer;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Supervised RabbitMQ consumer
#[derive(Parser)]
#[command(name = "rmq-consumer")]
#[command(about = "Supervised RabbitMQ consumer with watchdog reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Test connectivity to the broker and exit
    Check {
        /// Broker URI to test; defaults to the configured one
        #[arg(long)]
        uri: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        "Starting rmq-consumer v{}",
        env!("CARGO_PKG_VERSION")
    );

    let loaded = match load_configuration(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let (config, config_path) = match loaded {
        Some(loaded) => loaded,
        None => match fallback_for_missing_config(&cli.command) {
            Some(fallback) => {
                info!("No configuration file found, using defaults");
                fallback
            }
            None => {
                error!(
                    "No configuration file found. Please provide one with -c/--config or create rmq-consumer.toml"
                );
                process::exit(1);
            }
        },
    };

    let result = match cli.command {
        Commands::Run => run_consumer(config, config_path).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Check { uri } => handle_check_command(config, uri).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

/// Loads configuration from the given path or the default locations.
/// `Ok(None)` means no file was found anywhere; the caller decides whether
/// that is fatal.
fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<Option<(ConsumerConfig, PathBuf)>, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(Some((ConsumerConfig::load_from_file(path)?, path.clone())))
        }
        None => {
            // Try default locations
            let default_paths = vec!["rmq-consumer.toml", "config/rmq-consumer.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(Some((ConsumerConfig::load_from_file(&path)?, path)));
                }
            }

            Ok(None)
        }
    }
}

/// Connectivity checks against an explicit `--uri` need no configuration
/// file; everything else does.
fn fallback_for_missing_config(command: &Commands) -> Option<(ConsumerConfig, PathBuf)> {
    match command {
        Commands::Check { uri: Some(_) } => Some((ConsumerConfig::default(), PathBuf::new())),
        _ => None,
    }
}

async fn run_consumer(
    config: ConsumerConfig,
    config_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let watchdog_period = config.watchdog_period;
    let store = ConfigStore::new(config);
    let dialer: Arc<dyn Dialer> = Arc::new(AmqpDialer::new());
    let manager = Manager::new(dialer, store.clone());

    // Start health server
    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let health_server = Arc::new(HealthServer::new(health_port, Arc::clone(&manager)));
    tokio::spawn(async move {
        if let Err(e) = health_server.start().await {
            error!("Health server error: {}", e);
        }
    });

    // First connection attempt; later attempts come from the watchdog.
    manager.update().await;

    let timer = ReconnectTimer::new(Arc::clone(&manager), watchdog_period);
    timer.start();

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;

    info!("Consumer is running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                reload_configuration(&config_path, &store, &manager, &timer).await;
            }
        }
    }

    info!("Application shutdown initiated");
    timer.stop();
    if let Err(e) = manager.shutdown_with_wait().await {
        error!("Error during shutdown: {}", e);
        return Err(e.into());
    }

    Ok(())
}

async fn reload_configuration(
    path: &PathBuf,
    store: &ConfigStore,
    manager: &Arc<Manager>,
    timer: &ReconnectTimer,
) {
    match ConsumerConfig::load_from_file(path) {
        Ok(config) => {
            timer.set_recurrence_period(config.watchdog_period);
            store.replace(config);
            manager.update().await;
            info!("Configuration reloaded");
        }
        Err(e) => {
            warn!("Configuration reload failed, keeping previous config: {}", e);
        }
    }
}

fn handle_config_command(
    config: ConsumerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{config:#?}");
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn handle_check_command(
    config: ConsumerConfig,
    uri: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let uri = match uri.or(config.service_uri) {
        Some(uri) => uri,
        None => return Err("no service URI configured or given with --uri".into()),
    };

    info!("Testing connection to {}", redact_uri(&uri));
    probe(
        &uri,
        config.user_name.as_deref(),
        config.password.as_ref().map(|p| p.expose()),
    )
    .await?;

    println!("Connection to {} succeeded", redact_uri(&uri));
    Ok(())
}
