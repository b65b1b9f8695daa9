//! # CLI Interface
//!
//! Command-line arguments for `cloak-node`, via `clap` derive. Every `run`
//! flag also reads a `CLOAK_*` environment variable.

use clap::{Parser, Subcommand};
use cloak_protocol::config::{DEFAULT_API_PORT, DEFAULT_EXPIRY_SWEEP_INTERVAL, DEFAULT_METRICS_PORT};
use std::path::PathBuf;

/// Cloak gateway node.
///
/// Hosts the confidential ledger runtime, serves the decryption boundary for
/// the trusted responder, publishes the event log, and expires stale
/// decryption requests.
#[derive(Parser, Debug)]
#[command(
    name = "cloak-node",
    about = "Cloak confidential ledger gateway",
    version,
    propagate_version = true
)]
pub struct CloakNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway.
    Run(RunArgs),
    /// Generate a responder keypair and a network key.
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (JSON).
    ///
    /// When omitted, the node deploys the built-in devnet configuration.
    #[arg(long, short = 'c', env = "CLOAK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the REST API.
    #[arg(long, env = "CLOAK_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "CLOAK_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "CLOAK_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Hex-encoded network key shared with the responder.
    ///
    /// A fresh key is generated when omitted; only useful with
    /// `--dev-responder`, since no external responder could know it.
    #[arg(long, env = "CLOAK_NETWORK_KEY")]
    pub network_key: Option<String>,

    /// Hex-encoded Ed25519 public key of the external trusted responder.
    #[arg(long, env = "CLOAK_RESPONDER_KEY")]
    pub responder_key: Option<String>,

    /// Answer decryption requests in-process. Devnet only.
    #[arg(long, env = "CLOAK_DEV_RESPONDER")]
    pub dev_responder: bool,

    /// Hex-encoded Ed25519 secret for the in-process responder. Generated
    /// when omitted.
    #[arg(long, env = "CLOAK_DEV_RESPONDER_SECRET", requires = "dev_responder")]
    pub dev_responder_secret: Option<String>,

    /// Seconds between expiry sweeps.
    #[arg(long, env = "CLOAK_SWEEP_INTERVAL", default_value_t = DEFAULT_EXPIRY_SWEEP_INTERVAL.as_secs())]
    pub sweep_interval: u64,
}

#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Directory to write `responder.key` and `network.key` into. When
    /// omitted, the keys are only printed.
    #[arg(long, short = 'd')]
    pub out_dir: Option<PathBuf>,
}
