//! Admission control.
//!
//! One call per incoming request, in this order:
//!
//! ```text
//! IP burst ─► lock decision ─► conflict? ─► replay? ─► price
//!     ─► no/bad proof: quote (402)
//!     ─► proof: concurrency slot ─► verify ─► payer cap ─► reserve tx
//!            ─► create + start job ─► mark accepted ─► count payer (202)
//! ```

mod handler;
mod locks;

pub use handler::{AdmissionHandler, AdmissionOutcome, PAYMENT_REQUIRED, QUOTE_EXPIRED};
pub use locks::{KeyGuard, KeyedLocks};
