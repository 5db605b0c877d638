//! Payment side of admission: pricing, recipient, and on-chain verification.
//!
//! # Architecture
//!
//! ```text
//! request inputs
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ QuotePricer         │  server-derived price
//! └─────────┬───────────┘
//!           │
//!    ┌──────┴──────┐
//!    │             │
//!  no proof      proof
//!    │             │
//!    ▼             ▼
//!   402      PaymentVerifier ──► ChainClient (JSON-RPC / devnet)
//! ```
//!
//! # Payment Flow
//!
//! 1. Caller asks for a decision and receives a 402 with the price
//! 2. Caller transfers the stablecoin to the receiving address
//! 3. Caller resubmits with `{fromAddress, transactionId?}`
//! 4. Gateway verifies the transfer directly, or scans recent blocks
//! 5. The transaction is reserved so it can never fund another decision

pub mod chain;
pub mod metrics;
pub mod quote;
pub mod rpc;
mod verifier;
pub mod wallet;

pub use chain::{ChainClient, Receipt, TransferFilter, TransferLog};
pub use metrics::{AdmissionMetrics, MetricsSnapshot};
pub use quote::{format_amount, parse_amount, Price, QuotePricer};
pub use rpc::JsonRpcChain;
pub use verifier::{
    NothingSpent, PaymentClaim, PaymentVerifier, SpentTransactions, VerifiedPayment,
    VerifierSettings,
};
pub use wallet::{is_valid_address, EvmAddress, ReceivingWallet, StaticWallet, TxHash};
