//! Dispatcher gateway entry point

use clap::{Parser, Subcommand};
use dispatcher::api::{self, AppState};
use dispatcher::config::GatewayConfig;
use dispatcher::lifecycle_span;
use dispatcher::messaging::{ConnectionSupervisor, TokioSleeper};
use dispatcher::observability::{bootstrap_dispatch, init_from_config};
use dispatcher::transport::amqp::AmqpConnector;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, Instrument};

/// Task submission gateway for RabbitMQ
#[derive(Parser)]
#[command(name = "dispatcher")]
#[command(about = "Accepts task submissions over HTTP and publishes them to RabbitMQ")]
#[command(version)]
struct Cli {
    /// Env file seeding the configuration (default: ./.env)
    #[arg(long, value_name = "FILE", env = "DISPATCHER_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and serve HTTP until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Warnings raised while loading precede the configured subscriber
    let loaded = tracing::dispatcher::with_default(&bootstrap_dispatch(), || {
        GatewayConfig::load(cli.env_file.as_deref())
    });
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    init_from_config(&config.log, cli.verbose);

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

async fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.redacted_url(),
        auto_declare = config.topology.auto_declare,
        "Starting dispatcher"
    );

    let supervisor = Arc::new(
        ConnectionSupervisor::start(&config.broker, &AmqpConnector::default(), &TokioSleeper)
            .instrument(lifecycle_span!(phase = "startup"))
            .await?,
    );

    let host: IpAddr = config.http.host.parse()?;
    let addr = SocketAddr::new(host, config.http.port);
    let state = AppState::new(&config, supervisor.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = match api::bind(state, addr, async move {
        let _ = shutdown_rx.await;
    }) {
        Ok((_, server)) => tokio::spawn(server),
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind HTTP listener");
            let _ = supervisor.shutdown().await;
            return Err(e.into());
        }
    };

    wait_for_signal().await?;

    info!("Shutdown initiated, no longer accepting requests");
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        error!("HTTP server task failed: {}", e);
    }

    supervisor.shutdown().await?;
    info!("Dispatcher shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<(), std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

fn handle_config_command(
    config: &GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.to_redacted_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
