//! Decision ledger: one record per decision identifier.

use crate::allocation::{
    AllocationInputs, DecisionId, DecisionRecord, DecisionState, JobId, PaymentRecord,
};
use crate::error::{ConflictKind, Error, Result};
use crate::payment::quote::Price;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keyed store of decision records.
///
/// Every operation is an atomic read-modify-write on a single key.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Look up a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn get(&self, id: &DecisionId) -> Result<Option<DecisionRecord>>;

    /// Create a `Quoted` record, or refresh the quote of an existing one.
    ///
    /// Callers check fingerprints first; a mismatch reaching the store is
    /// still refused rather than overwritten.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on a fingerprint mismatch and `InvalidState` if the
    /// record is already accepted.
    async fn upsert_quoted(
        &self,
        id: &DecisionId,
        inputs: &AllocationInputs,
        price: &Price,
        issued_at: DateTime<Utc>,
        window: Duration,
    ) -> Result<DecisionRecord>;

    /// Transition to `Accepted`. Idempotent: an already accepted record is
    /// returned unchanged and its job id is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the decision was never quoted.
    async fn mark_accepted(
        &self,
        id: &DecisionId,
        payment: Option<PaymentRecord>,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DecisionRecord>;
}

/// In-memory decision ledger.
#[derive(Debug, Default)]
pub struct MemoryDecisionStore {
    records: DashMap<DecisionId, DecisionRecord>,
}

impl MemoryDecisionStore {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn quote_expiry(issued_at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
    issued_at.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl DecisionStore for MemoryDecisionStore {
    async fn get(&self, id: &DecisionId) -> Result<Option<DecisionRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn upsert_quoted(
        &self,
        id: &DecisionId,
        inputs: &AllocationInputs,
        price: &Price,
        issued_at: DateTime<Utc>,
        window: Duration,
    ) -> Result<DecisionRecord> {
        let fingerprint = inputs.fingerprint();
        let expires_at = quote_expiry(issued_at, window);

        match self.records.entry(id.clone()) {
            Entry::Vacant(slot) => {
                let record = DecisionRecord {
                    decision_id: id.clone(),
                    input_fingerprint: fingerprint,
                    inputs: *inputs,
                    charged_amount: price.display.clone(),
                    charged_units: price.units,
                    quote_issued_at: issued_at,
                    quote_expires_at: expires_at,
                    state: DecisionState::Quoted,
                    payment: None,
                    job_id: None,
                    created_at: issued_at,
                    updated_at: issued_at,
                };
                debug!("Quoted new decision {} at {}", id, price.display);
                Ok(slot.insert(record).value().clone())
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.is_accepted() {
                    return Err(Error::InvalidState(format!(
                        "decision {id} is accepted and cannot be re-quoted"
                    )));
                }
                if record.input_fingerprint != fingerprint {
                    return Err(Error::Conflict(ConflictKind::FingerprintMismatch {
                        stored: record.input_fingerprint.to_string(),
                        presented: fingerprint.to_string(),
                    }));
                }
                record.charged_amount.clone_from(&price.display);
                record.charged_units = price.units;
                record.quote_issued_at = issued_at;
                record.quote_expires_at = expires_at;
                record.updated_at = issued_at;
                debug!("Refreshed quote for decision {} at {}", id, price.display);
                Ok(record.clone())
            }
        }
    }

    async fn mark_accepted(
        &self,
        id: &DecisionId,
        payment: Option<PaymentRecord>,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DecisionRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::InvalidState(format!("decision {id} was never quoted")))?;

        if let Some(existing) = &record.job_id {
            if existing != job_id {
                warn!(
                    "Decision {} already bound to job {}; ignoring job {}",
                    id, existing, job_id
                );
            }
            return Ok(record.clone());
        }

        record.state = DecisionState::Accepted;
        record.payment = payment;
        record.job_id = Some(job_id.clone());
        record.updated_at = at;
        info!("Decision {} accepted with job {}", id, job_id);
        Ok(record.clone())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::allocation::{RiskTolerance, Timeframe};
    use chrono::TimeZone;

    fn id() -> DecisionId {
        DecisionId::parse("job-aaa111").expect("id")
    }

    fn inputs(timeframe: Timeframe) -> AllocationInputs {
        AllocationInputs {
            risk_tolerance: RiskTolerance::Balanced,
            timeframe,
            with_report: false,
        }
    }

    fn price(units: u64) -> Price {
        Price {
            units,
            display: crate::payment::quote::format_amount(units, 6),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    const WINDOW: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_upsert_creates_quoted_record() {
        let store = MemoryDecisionStore::new();
        let record = store
            .upsert_quoted(
                &id(),
                &inputs(Timeframe::OneToThreeYears),
                &price(19_000_000),
                t0(),
                WINDOW,
            )
            .await
            .expect("upsert");

        assert_eq!(record.state, DecisionState::Quoted);
        assert_eq!(record.charged_amount, "19");
        assert_eq!(record.quote_expires_at, t0() + ChronoDuration::seconds(900));
        assert!(store.get(&id()).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_creation_time() {
        let store = MemoryDecisionStore::new();
        let inputs = inputs(Timeframe::OneToThreeYears);
        store
            .upsert_quoted(&id(), &inputs, &price(19_000_000), t0(), WINDOW)
            .await
            .expect("first");
        let later = t0() + ChronoDuration::hours(1);
        let refreshed = store
            .upsert_quoted(&id(), &inputs, &price(21_000_000), later, WINDOW)
            .await
            .expect("refresh");

        assert_eq!(refreshed.created_at, t0());
        assert_eq!(refreshed.quote_issued_at, later);
        assert_eq!(refreshed.charged_amount, "21");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_refuses_fingerprint_change() {
        let store = MemoryDecisionStore::new();
        store
            .upsert_quoted(
                &id(),
                &inputs(Timeframe::OneToThreeYears),
                &price(19_000_000),
                t0(),
                WINDOW,
            )
            .await
            .expect("first");

        let err = store
            .upsert_quoted(
                &id(),
                &inputs(Timeframe::OverThreeYears),
                &price(19_000_000),
                t0(),
                WINDOW,
            )
            .await
            .expect_err("conflict");
        assert_eq!(err.code(), "fingerprint_conflict");

        let stored = store.get(&id()).await.expect("get").expect("present");
        assert_eq!(stored.inputs.timeframe, Timeframe::OneToThreeYears);
    }

    #[tokio::test]
    async fn test_mark_accepted_is_idempotent() {
        let store = MemoryDecisionStore::new();
        let inputs = inputs(Timeframe::OneToThreeYears);
        store
            .upsert_quoted(&id(), &inputs, &price(19_000_000), t0(), WINDOW)
            .await
            .expect("quote");

        let first = store
            .mark_accepted(&id(), None, &JobId::new("job-1"), t0())
            .await
            .expect("accept");
        assert!(first.is_accepted());

        let second = store
            .mark_accepted(&id(), None, &JobId::new("job-2"), t0())
            .await
            .expect("accept again");
        assert_eq!(second.job_id, Some(JobId::new("job-1")));
    }

    #[tokio::test]
    async fn test_accepted_cannot_be_requoted() {
        let store = MemoryDecisionStore::new();
        let inputs = inputs(Timeframe::OneToThreeYears);
        store
            .upsert_quoted(&id(), &inputs, &price(19_000_000), t0(), WINDOW)
            .await
            .expect("quote");
        store
            .mark_accepted(&id(), None, &JobId::new("job-1"), t0())
            .await
            .expect("accept");

        let err = store
            .upsert_quoted(&id(), &inputs, &price(19_000_000), t0(), WINDOW)
            .await
            .expect_err("terminal");
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_mark_accepted_requires_quote() {
        let store = MemoryDecisionStore::new();
        assert!(store
            .mark_accepted(&id(), None, &JobId::new("job-1"), t0())
            .await
            .is_err());
    }
}
