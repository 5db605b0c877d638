//! Configuration for allocation-gate.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Price configuration.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Quote lifetime configuration.
    #[serde(default)]
    pub quote: QuoteConfig,

    /// Rate-limit configuration.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// On-chain payment verification configuration.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Downstream pipeline configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Metrics persistence configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client IP from the first `X-Forwarded-For` entry.
    /// Only enable behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
        }
    }
}

/// Price configuration. Prices are decimal strings in display units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Asset symbol shown to callers.
    #[serde(default = "default_asset")]
    pub asset: String,

    /// Asset decimals (6 for USDC).
    #[serde(default = "default_decimals")]
    pub decimals: u32,

    /// Price of an allocation.
    #[serde(default = "default_base_price")]
    pub base_price: String,

    /// Extra charge when a report is requested.
    #[serde(default = "default_report_add_on")]
    pub report_add_on: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            asset: default_asset(),
            decimals: default_decimals(),
            base_price: default_base_price(),
            report_add_on: default_report_add_on(),
        }
    }
}

/// Quote lifetime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// How long a quoted price may be paid against.
    #[serde(default = "default_quote_window_secs")]
    pub window_secs: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            window_secs: default_quote_window_secs(),
        }
    }
}

impl QuoteConfig {
    /// Quote window as a duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per IP within the burst window.
    #[serde(default = "default_ip_burst_limit")]
    pub ip_burst_limit: usize,

    /// Burst window length in milliseconds.
    #[serde(default = "default_ip_burst_window_ms")]
    pub ip_burst_window_ms: u64,

    /// Accepted payments allowed per payer per UTC day.
    #[serde(default = "default_payer_daily_cap")]
    pub payer_daily_cap: u64,

    /// Orchestrations allowed to run at once.
    #[serde(default = "default_global_concurrency_cap")]
    pub global_concurrency_cap: usize,

    /// Retry hint returned when the concurrency cap is hit.
    #[serde(default = "default_concurrency_retry_after_secs")]
    pub concurrency_retry_after_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_burst_limit: default_ip_burst_limit(),
            ip_burst_window_ms: default_ip_burst_window_ms(),
            payer_daily_cap: default_payer_daily_cap(),
            global_concurrency_cap: default_global_concurrency_cap(),
            concurrency_retry_after_secs: default_concurrency_retry_after_secs(),
        }
    }
}

/// On-chain payment verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Network name reported to callers and stored with payments.
    #[serde(default = "default_network")]
    pub network: String,

    /// JSON-RPC endpoint of the chain.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Stablecoin token contract. Required unless running on the devnet.
    #[serde(default)]
    pub token_contract: Option<String>,

    /// Address payments must be sent to (e.g., "0x...").
    #[serde(default)]
    pub payee_address: Option<String>,

    /// Confirmations required before a transfer counts.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Total verification budget shared by both strategies.
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,

    /// Sleep between scan attempts.
    #[serde(default = "default_scan_poll_interval_ms")]
    pub scan_poll_interval_ms: u64,

    /// Sleep between receipt polls while waiting for confirmations.
    #[serde(default = "default_confirmation_poll_interval_ms")]
    pub confirmation_poll_interval_ms: u64,

    /// How many recent blocks a scan covers.
    #[serde(default = "default_scan_block_range")]
    pub scan_block_range: u64,

    /// Attempts per RPC call before reporting the chain unavailable.
    #[serde(default = "default_upstream_retry_attempts")]
    pub upstream_retry_attempts: u32,

    /// Initial backoff between RPC attempts (doubles each attempt).
    #[serde(default = "default_upstream_backoff_ms")]
    pub upstream_backoff_ms: u64,

    /// Per-request HTTP timeout for RPC calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            rpc_url: None,
            token_contract: None,
            payee_address: None,
            confirmations: default_confirmations(),
            verify_timeout_secs: default_verify_timeout_secs(),
            scan_poll_interval_ms: default_scan_poll_interval_ms(),
            confirmation_poll_interval_ms: default_confirmation_poll_interval_ms(),
            scan_block_range: default_scan_block_range(),
            upstream_retry_attempts: default_upstream_retry_attempts(),
            upstream_backoff_ms: default_upstream_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Downstream pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base URL of the pipeline service.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Number of sequential phases per job.
    #[serde(default = "default_phase_count")]
    pub phase_count: u32,

    /// Sleep between phase status polls.
    #[serde(default = "default_phase_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for a single phase.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Deadline for the whole orchestration.
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,

    /// Attempts per pipeline call before reporting it unavailable.
    #[serde(default = "default_upstream_retry_attempts")]
    pub upstream_retry_attempts: u32,

    /// Initial backoff between pipeline call attempts.
    #[serde(default = "default_upstream_backoff_ms")]
    pub upstream_backoff_ms: u64,

    /// Per-request HTTP timeout for pipeline calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            phase_count: default_phase_count(),
            poll_interval_ms: default_phase_poll_interval_ms(),
            phase_timeout_secs: default_phase_timeout_secs(),
            overall_timeout_secs: default_overall_timeout_secs(),
            upstream_retry_attempts: default_upstream_retry_attempts(),
            upstream_backoff_ms: default_upstream_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Metrics persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Persist counters across restarts.
    #[serde(default)]
    pub persist: bool,

    /// Directory for persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            persist: false,
            data_dir: default_data_dir(),
        }
    }
}

impl GatewayConfig {
    /// Create a development configuration preset.
    ///
    /// Listens on localhost with short timeouts and a fixed payee address;
    /// meant to run against the in-process devnet.
    #[must_use]
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8402)),
                trust_forwarded_for: false,
            },
            payment: PaymentConfig {
                network: "devnet".to_string(),
                token_contract: Some(DEVNET_TOKEN_ADDRESS.to_string()),
                payee_address: Some(DEVNET_PAYEE_ADDRESS.to_string()),
                confirmations: 1,
                verify_timeout_secs: 10,
                scan_poll_interval_ms: 200,
                confirmation_poll_interval_ms: 100,
                ..PaymentConfig::default()
            },
            pipeline: PipelineConfig {
                poll_interval_ms: 200,
                phase_timeout_secs: 30,
                overall_timeout_secs: 120,
                ..PipelineConfig::default()
            },
            log_level: "debug".to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Token contract of the in-process devnet.
pub const DEVNET_TOKEN_ADDRESS: &str = "0x5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d";

/// Payee used by the development preset.
pub const DEVNET_PAYEE_ADDRESS: &str = "0x00000000000000000000000000000000000a11c0";

fn default_listen_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8402))
}

fn default_asset() -> String {
    "USDC".to_string()
}

const fn default_decimals() -> u32 {
    6
}

fn default_base_price() -> String {
    "19".to_string()
}

fn default_report_add_on() -> String {
    "10".to_string()
}

const fn default_quote_window_secs() -> u64 {
    15 * 60
}

const fn default_ip_burst_limit() -> usize {
    20
}

const fn default_ip_burst_window_ms() -> u64 {
    60_000
}

const fn default_payer_daily_cap() -> u64 {
    5
}

const fn default_global_concurrency_cap() -> usize {
    8
}

const fn default_concurrency_retry_after_secs() -> u64 {
    30
}

fn default_network() -> String {
    "base".to_string()
}

const fn default_confirmations() -> u64 {
    2
}

const fn default_verify_timeout_secs() -> u64 {
    90
}

const fn default_scan_poll_interval_ms() -> u64 {
    3_000
}

const fn default_confirmation_poll_interval_ms() -> u64 {
    1_000
}

const fn default_scan_block_range() -> u64 {
    500
}

const fn default_upstream_retry_attempts() -> u32 {
    3
}

const fn default_upstream_backoff_ms() -> u64 {
    250
}

const fn default_request_timeout_secs() -> u64 {
    10
}

const fn default_phase_count() -> u32 {
    4
}

const fn default_phase_poll_interval_ms() -> u64 {
    2_000
}

const fn default_phase_timeout_secs() -> u64 {
    10 * 60
}

const fn default_overall_timeout_secs() -> u64 {
    60 * 60
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "allocation-gate").map_or_else(
        || PathBuf::from(".allocation-gate"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn default_log_level() -> String {
    "info".to_string()
}
