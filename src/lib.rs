//! # allocation-gate
//!
//! Payment-gated, idempotent admission for allocation jobs.
//!
//! A caller asks for an allocation under a caller-chosen decision
//! identifier. The gateway prices the request, answers 402 until a matching
//! stablecoin transfer is verified on-chain, then starts exactly one
//! pipeline job for the decision. Every later identical request replays the
//! recorded outcome.
//!
//! ## Architecture
//!
//! - `allocation`: wire types, decision identifiers, input fingerprints
//! - `payment`: pricing, receiving wallet, on-chain verification
//! - `store`: decision ledger, transaction reservations, payer usage
//! - `limits`: IP burst, global concurrency, payer daily cap
//! - `pipeline`: downstream client and phase orchestration
//! - `admission`: the request-level flow tying it together
//! - `server` / `gateway`: HTTP binding and process wiring
//!
//! ## Example
//!
//! ```rust,no_run
//! use allocation_gate::{GatewayBuilder, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_file(std::path::Path::new("gate.toml"))?;
//!     let mut gateway = GatewayBuilder::new(config).build().await?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod allocation;
pub mod clock;
pub mod config;
pub mod devnet;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod payment;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod store;

pub use admission::{AdmissionHandler, AdmissionOutcome};
pub use allocation::{
    AcceptedResponse, AdmissionRequest, AdmissionStatus, AllocateRequest, AllocationInputs,
    DecisionId, DecisionRecord, JobId, PaymentRequiredResponse,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GatewayConfig;
pub use devnet::{DevChain, DevPipeline};
pub use error::{Error, Result};
pub use gateway::{GatewayBuilder, RunningGateway};
pub use payment::{AdmissionMetrics, PaymentVerifier, QuotePricer};
pub use pipeline::{JobProgress, JobState};
pub use store::Stores;
