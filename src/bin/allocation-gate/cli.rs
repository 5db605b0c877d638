//! Command-line interface definition.

use allocation_gate::config::GatewayConfig;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Payment-gated, idempotent admission gateway for allocation jobs.
#[derive(Parser, Debug)]
#[command(name = "allocation-gate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, env = "ALLOCGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run against the in-process devnet chain and pipeline.
    #[arg(long, env = "ALLOCGATE_DEV")]
    pub dev: bool,

    /// Address to listen on.
    #[arg(long, short, env = "ALLOCGATE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Take the client IP from `X-Forwarded-For` (trusted proxy only).
    #[arg(long, env = "ALLOCGATE_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// JSON-RPC endpoint of the chain.
    #[arg(long, env = "ALLOCGATE_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Network name reported to callers.
    #[arg(long, env = "ALLOCGATE_NETWORK")]
    pub network: Option<String>,

    /// Stablecoin token contract (e.g., "0x...").
    #[arg(long, env = "ALLOCGATE_TOKEN_CONTRACT")]
    pub token_contract: Option<String>,

    /// Address payments must be sent to (e.g., "0x...").
    #[arg(long, env = "ALLOCGATE_PAYEE_ADDRESS")]
    pub payee_address: Option<String>,

    /// Confirmations required before a transfer counts.
    #[arg(long, env = "ALLOCGATE_CONFIRMATIONS")]
    pub confirmations: Option<u64>,

    /// Base URL of the pipeline service.
    #[arg(long, env = "ALLOCGATE_PIPELINE_URL")]
    pub pipeline_url: Option<String>,

    /// Price of an allocation, in display units (e.g., "19").
    #[arg(long, env = "ALLOCGATE_BASE_PRICE")]
    pub base_price: Option<String>,

    /// Extra charge when a report is requested.
    #[arg(long, env = "ALLOCGATE_REPORT_ADD_ON")]
    pub report_add_on: Option<String>,

    /// Accepted payments allowed per payer per UTC day (0 to disable).
    #[arg(long, env = "ALLOCGATE_PAYER_DAILY_CAP")]
    pub payer_daily_cap: Option<u64>,

    /// Orchestrations allowed to run at once (0 for unbounded).
    #[arg(long, env = "ALLOCGATE_CONCURRENCY_CAP")]
    pub concurrency_cap: Option<usize>,

    /// Persist admission metrics to this directory.
    #[arg(long, env = "ALLOCGATE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level.
    #[arg(long, value_enum, env = "ALLOCGATE_LOG_LEVEL")]
    pub log_level: Option<CliLogLevel>,
}

/// Log level CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum CliLogLevel {
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace messages (verbose).
    Trace,
}

impl Cli {
    /// Convert CLI arguments into a `GatewayConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<GatewayConfig> {
        // Start with the file, the devnet preset, or defaults
        let mut config = match (self.config.as_ref(), self.dev) {
            (Some(path), _) => GatewayConfig::from_file(path)?,
            (None, true) => GatewayConfig::development(),
            (None, false) => GatewayConfig::default(),
        };

        // Override with CLI arguments
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if self.trust_forwarded_for {
            config.server.trust_forwarded_for = true;
        }
        if let Some(level) = self.log_level {
            config.log_level = level.into();
        }

        // Payment config
        if self.rpc_url.is_some() {
            config.payment.rpc_url = self.rpc_url;
        }
        if let Some(network) = self.network {
            config.payment.network = network;
        }
        if self.token_contract.is_some() {
            config.payment.token_contract = self.token_contract;
        }
        if self.payee_address.is_some() {
            config.payment.payee_address = self.payee_address;
        }
        if let Some(confirmations) = self.confirmations {
            config.payment.confirmations = confirmations;
        }

        // Pricing and limits
        if let Some(price) = self.base_price {
            config.pricing.base_price = price;
        }
        if let Some(add_on) = self.report_add_on {
            config.pricing.report_add_on = add_on;
        }
        if let Some(cap) = self.payer_daily_cap {
            config.limits.payer_daily_cap = cap;
        }
        if let Some(cap) = self.concurrency_cap {
            config.limits.global_concurrency_cap = cap;
        }

        if self.pipeline_url.is_some() {
            config.pipeline.base_url = self.pipeline_url;
        }
        if let Some(dir) = self.data_dir {
            config.metrics.persist = true;
            config.metrics.data_dir = dir;
        }

        Ok(config)
    }
}

impl From<CliLogLevel> for String {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => "error".to_string(),
            CliLogLevel::Warn => "warn".to_string(),
            CliLogLevel::Info => "info".to_string(),
            CliLogLevel::Debug => "debug".to_string(),
            CliLogLevel::Trace => "trace".to_string(),
        }
    }
}
