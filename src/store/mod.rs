//! Shared admission state.
//!
//! Each store is a trait so the gateway can run on in-memory maps or an
//! external key-value service. All operations are single-key atomic; no
//! caller-side locking is assumed and no lock spans multiple keys.
//!
//! ```text
//! DecisionStore      decisionId            -> DecisionRecord
//! ReservationStore   transactionId         -> decisionId   (append-only)
//! UsageStore         (UTC day, payer)      -> accepted payment count
//! ```

mod decisions;
mod reservations;
mod usage;

pub use decisions::{DecisionStore, MemoryDecisionStore};
pub use reservations::{MemoryReservationStore, Reservation, ReservationStore};
pub use usage::{MemoryUsageStore, UsageStore};

use std::sync::Arc;

/// The set of stores the admission handler works against.
#[derive(Clone)]
pub struct Stores {
    /// Decision ledger.
    pub decisions: Arc<dyn DecisionStore>,
    /// Transaction reservation table.
    pub reservations: Arc<dyn ReservationStore>,
    /// Payer daily counters.
    pub usage: Arc<dyn UsageStore>,
}

impl Stores {
    /// In-memory stores for a single process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            decisions: Arc::new(MemoryDecisionStore::new()),
            reservations: Arc::new(MemoryReservationStore::new()),
            usage: Arc::new(MemoryUsageStore::new()),
        }
    }
}
