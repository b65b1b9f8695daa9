// Copyright (c) 2026 Cloak Contributors. MIT License.
// See LICENSE for details.

//! # Cloak Gateway Node
//!
//! Entry point for the `cloak-node` binary. Parses CLI arguments, initializes
//! logging and metrics, deploys the configured contracts, and serves the
//! decryption boundary over HTTP.
//!
//! The binary supports three subcommands:
//!
//! - `run`: start the gateway
//! - `keygen`: generate a responder keypair and a network key
//! - `version`: print build version information

mod api;
mod cli;
mod config;
mod dev_responder;
mod logging;
mod metrics;
mod sweeper;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cloak_protocol::crypto::{CloakKeypair, CloakPublicKey, NetworkKey};
use cloak_protocol::{CiphertextStore, Clock, SystemClock, TrustedResponder};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use cli::{CloakNodeCli, Commands};
use config::NodeConfig;
use dev_responder::DevResponder;
use logging::LogFormat;
use metrics::NodeMetrics;
use sweeper::ExpirySweeper;

/// How often the in-process responder polls for pending requests.
const DEV_RESPONDER_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CloakNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the gateway: runtime, API server, metrics endpoint, expiry
/// sweeper, and (on devnet) the in-process responder.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            tracing::info!("no config file given, deploying the devnet layout");
            NodeConfig::devnet()
        }
    };

    tracing::info!(
        network = %config.network,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        ledgers = config.ledgers.len(),
        vaults = config.vaults.len(),
        "starting cloak-node"
    );

    // --- Keys ---
    let network_key = match &args.network_key {
        Some(hex) => NetworkKey::from_hex(hex).context("invalid network key")?,
        None => {
            if !args.dev_responder {
                bail!("--network-key is required unless --dev-responder is set");
            }
            tracing::warn!("no network key given, generated an ephemeral one");
            NetworkKey::generate()
        }
    };

    let dev_keypair = if args.dev_responder {
        Some(match &args.dev_responder_secret {
            Some(hex) => CloakKeypair::from_hex(hex).context("invalid dev responder secret")?,
            None => CloakKeypair::generate(),
        })
    } else {
        None
    };

    let responder_key = match (&dev_keypair, &args.responder_key) {
        (Some(keypair), None) => keypair.public_key(),
        (Some(_), Some(_)) => bail!("--responder-key conflicts with --dev-responder"),
        (None, Some(hex)) => CloakPublicKey::from_hex(hex).context("invalid responder key")?,
        (None, None) => bail!("--responder-key is required unless --dev-responder is set"),
    };
    tracing::info!(responder = %responder_key, "responder key pinned");

    // --- Runtime ---
    let runtime = Arc::new(config.build_runtime(
        CiphertextStore::new(network_key.clone()),
        responder_key,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    )?);
    for ledger in runtime.ledgers() {
        tracing::info!(address = %ledger.address, symbol = %ledger.symbol, "ledger ready");
    }
    for vault in runtime.vaults() {
        tracing::info!(address = %vault.address, asset = %vault.asset, "vault ready");
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    node_metrics.observe(&runtime.stats());

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            cloak_protocol::config::PROTOCOL_VERSION,
        ),
        network: config.network.clone(),
        runtime: Arc::clone(&runtime),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = ExpirySweeper::new(
        Arc::clone(&runtime),
        Arc::clone(&node_metrics),
        Duration::from_secs(args.sweep_interval.max(1)),
    );
    let sweeper_rx = shutdown_rx.clone();
    let sweeper_task = tokio::spawn(async move { sweeper.run(sweeper_rx).await });

    let responder_task = dev_keypair.map(|keypair| {
        let dev = DevResponder::new(
            Arc::clone(&runtime),
            TrustedResponder::new(keypair, network_key),
            Arc::clone(&node_metrics),
            DEV_RESPONDER_POLL,
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { dev.run(rx).await })
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping background tasks");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_task.await {
        tracing::warn!("sweeper task ended abnormally: {}", e);
    }
    if let Some(task) = responder_task {
        if let Err(e) = task.await {
            tracing::warn!("dev responder task ended abnormally: {}", e);
        }
    }

    tracing::info!("cloak-node stopped");
    Ok(())
}

/// Generates a responder keypair and a network key. Prints both; writes
/// them with owner-only permissions when `--out-dir` is given.
fn keygen(args: cli::KeygenArgs) -> Result<()> {
    let keypair = CloakKeypair::generate();
    let network_key = NetworkKey::generate();

    if let Some(dir) = &args.out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create key directory: {}", dir.display()))?;
        write_secret(&dir.join("responder.key"), &keypair.to_hex())?;
        write_secret(&dir.join("network.key"), &network_key.to_hex())?;
        println!("Keys written to {}", dir.display());
    }

    println!("  Responder public key : {}", keypair.public_key().to_hex());
    println!("  Responder secret     : {}", keypair.to_hex());
    println!("  Network key          : {}", network_key.to_hex());
    Ok(())
}

fn write_secret(path: &Path, hex: &str) -> Result<()> {
    std::fs::write(path, hex)
        .with_context(|| format!("failed to write key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("cloak-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", cloak_protocol::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
