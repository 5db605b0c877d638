//! E2E tests for allocation-gate.
//!
//! Every test drives a full gateway wired to the in-process devnet through
//! the HTTP router, without binding a socket.
//!
//! ## Architecture
//!
//! ```text
//! TestGateway
//!     ├── Router (MockConnectInfo peer)
//!     ├── DevChain     transfers, mining
//!     ├── DevPipeline  scripted phases
//!     └── ManualClock  quote windows, UTC days
//! ```

mod harness;

#[cfg(test)]
mod admission_flow;
#[cfg(test)]
mod http_api;
#[cfg(test)]
mod limits;

pub use harness::{call, TestGateway, OTHER_PAYER, PAYER};
