//! Transaction reservation table.
//!
//! One on-chain transaction funds at most one decision, ever. Entries are
//! append-only.

use crate::allocation::DecisionId;
use crate::error::Result;
use crate::payment::wallet::TxHash;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Result of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Whether the transaction now funds the requesting decision.
    pub accepted: bool,
    /// Decision that owns the transaction.
    pub owner: DecisionId,
}

/// Global registry of claimed transactions.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomically claim `tx` for `decision`.
    ///
    /// Unclaimed or already claimed by the same decision: accepted.
    /// Claimed by another decision: not accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn reserve(&self, tx: &TxHash, decision: &DecisionId) -> Result<Reservation>;

    /// Current owner of `tx`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn owner(&self, tx: &TxHash) -> Result<Option<DecisionId>>;
}

/// In-memory reservation table.
#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    claims: DashMap<TxHash, DecisionId>,
}

impl MemoryReservationStore {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of claimed transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether nothing has been claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn reserve(&self, tx: &TxHash, decision: &DecisionId) -> Result<Reservation> {
        match self.claims.entry(*tx) {
            Entry::Vacant(slot) => {
                slot.insert(decision.clone());
                debug!("Transaction {} reserved for {}", tx, decision);
                Ok(Reservation {
                    accepted: true,
                    owner: decision.clone(),
                })
            }
            Entry::Occupied(slot) => {
                let owner = slot.get().clone();
                let accepted = &owner == decision;
                if !accepted {
                    warn!(
                        "Transaction {} already funds {}; refused for {}",
                        tx, owner, decision
                    );
                }
                Ok(Reservation { accepted, owner })
            }
        }
    }

    async fn owner(&self, tx: &TxHash) -> Result<Option<DecisionId>> {
        Ok(self.claims.get(tx).map(|o| o.value().clone()))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn decision(s: &str) -> DecisionId {
        DecisionId::parse(s).expect("id")
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let store = MemoryReservationStore::new();
        let tx = TxHash::new([7u8; 32]);

        let a = store.reserve(&tx, &decision("decision-a")).await.expect("a");
        assert!(a.accepted);

        let b = store.reserve(&tx, &decision("decision-b")).await.expect("b");
        assert!(!b.accepted);
        assert_eq!(b.owner, decision("decision-a"));
    }

    #[tokio::test]
    async fn test_same_decision_retry_is_accepted() {
        let store = MemoryReservationStore::new();
        let tx = TxHash::new([7u8; 32]);
        store.reserve(&tx, &decision("decision-a")).await.expect("a");
        let retry = store.reserve(&tx, &decision("decision-a")).await.expect("retry");
        assert!(retry.accepted);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryReservationStore::new());
        let tx = TxHash::new([9u8; 32]);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = decision(&format!("decision-{i:02}"));
                store.reserve(&tx, &id).await.expect("reserve").accepted
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
