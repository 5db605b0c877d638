//! Request-level admission control flow.

use crate::admission::locks::KeyedLocks;
use crate::allocation::{
    status_path, AcceptedResponse, AdmissionRequest, AdmissionStatus, AllocationInputs,
    DecisionId, DecisionRecord, JobId, PaymentAttachment, PaymentOption, PaymentProof,
    PaymentRecord, PaymentRequiredResponse, PaymentSummary,
};
use crate::clock::Clock;
use crate::error::{ConflictKind, Error, Result};
use crate::limits::{RateLimiter, RunningSlot};
use crate::payment::metrics::AdmissionMetrics;
use crate::payment::quote::{Price, QuotePricer};
use crate::payment::wallet::{EvmAddress, TxHash};
use crate::payment::{PaymentClaim, PaymentVerifier, SpentTransactions, VerifiedPayment};
use crate::pipeline::{JobOrchestrator, JobProgress};
use crate::store::{ReservationStore, Stores};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 402 code for a request without usable payment.
pub const PAYMENT_REQUIRED: &str = "payment_required";

/// 402 code for a proof presented against a lapsed quote.
pub const QUOTE_EXPIRED: &str = "quote_expired";

/// Result of a successful admission call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The caller must pay (or pay again) before the job is admitted.
    PaymentRequired(PaymentRequiredResponse),
    /// The decision is admitted, now or earlier.
    Admitted(AcceptedResponse),
}

/// Scanning must not match transactions owned by other decisions.
struct ClaimedElsewhere<'a> {
    reservations: &'a dyn ReservationStore,
    decision: &'a DecisionId,
}

#[async_trait]
impl SpentTransactions for ClaimedElsewhere<'_> {
    async fn is_spent(&self, tx: &TxHash) -> Result<bool> {
        Ok(self
            .reservations
            .owner(tx)
            .await?
            .is_some_and(|owner| &owner != self.decision))
    }
}

/// Composes pricing, limits, verification, reservation, and orchestration
/// into the admission protocol.
pub struct AdmissionHandler {
    stores: Stores,
    pricer: QuotePricer,
    limiter: RateLimiter,
    verifier: PaymentVerifier,
    orchestrator: JobOrchestrator,
    metrics: Arc<AdmissionMetrics>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<DecisionId>,
    pay_to: EvmAddress,
    quote_window: Duration,
}

impl AdmissionHandler {
    /// Wire a handler. `pay_to` is the receiving address resolved at
    /// startup.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        pricer: QuotePricer,
        limiter: RateLimiter,
        verifier: PaymentVerifier,
        orchestrator: JobOrchestrator,
        metrics: Arc<AdmissionMetrics>,
        clock: Arc<dyn Clock>,
        pay_to: EvmAddress,
        quote_window: Duration,
    ) -> Self {
        Self {
            stores,
            pricer,
            limiter,
            verifier,
            orchestrator,
            metrics,
            clock,
            locks: KeyedLocks::new(),
            pay_to,
            quote_window,
        }
    }

    /// Handle one submit/continue request.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited`, `Conflict`, `UpstreamUnavailable`, or a store
    /// error. Missing, malformed, unconfirmed, or stale payments are not
    /// errors: they produce [`AdmissionOutcome::PaymentRequired`].
    pub async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionOutcome> {
        let result = self.admit_inner(request).await;
        match &result {
            Err(Error::RateLimited { .. }) => self.metrics.record_rate_limited(),
            Err(Error::Conflict(_)) => self.metrics.record_conflict(),
            _ => {}
        }
        result
    }

    async fn admit_inner(&self, request: AdmissionRequest) -> Result<AdmissionOutcome> {
        let AdmissionRequest {
            decision_id,
            inputs,
            payment,
            client_ip,
        } = request;

        // Step 1: IP burst, before any state is touched
        self.limiter.check_ip(client_ip, self.clock.now())?;

        // Step 2: serialize everything that follows per decision
        let _guard = self.locks.lock(&decision_id).await;
        let existing = self.stores.decisions.get(&decision_id).await?;

        // Step 3: fingerprint conflicts beat replays and payments
        if let Some(record) = &existing {
            if !record.matches(&inputs) {
                warn!("Decision {} resubmitted with different inputs", decision_id);
                return Err(Error::Conflict(ConflictKind::FingerprintMismatch {
                    stored: record.input_fingerprint.to_string(),
                    presented: inputs.fingerprint().to_string(),
                }));
            }
            if record.is_accepted() {
                self.metrics.record_replay();
                return Ok(AdmissionOutcome::Admitted(self.replay(record)));
            }
        }

        // Step 4: server-side price
        let price = self.pricer.price(&inputs);
        let now = self.clock.now();

        if price.is_free() {
            return self.admit_free(&decision_id, &inputs, &price, now).await;
        }

        // Step 5: without a usable proof, (re)quote
        let proof = match payment {
            PaymentAttachment::None => {
                let record = self
                    .requote(&decision_id, &inputs, &price, existing.as_ref(), now)
                    .await?;
                return Ok(self.payment_required(
                    &record,
                    PAYMENT_REQUIRED,
                    format!(
                        "pay {} {} to continue",
                        record.charged_amount,
                        self.pricer.asset()
                    ),
                ));
            }
            PaymentAttachment::Malformed(reason) => {
                warn!("Malformed payment proof for {}: {}", decision_id, reason);
                let record = self
                    .requote(&decision_id, &inputs, &price, existing.as_ref(), now)
                    .await?;
                return Ok(self.payment_required(&record, "invalid_payment_proof", reason));
            }
            PaymentAttachment::Presented(proof) => proof,
        };

        let record = match existing {
            Some(record) if record.is_quote_expired(now) => {
                info!("Quote for {} expired; re-quoting before payment", decision_id);
                let record = self
                    .stores
                    .decisions
                    .upsert_quoted(&decision_id, &inputs, &price, now, self.quote_window)
                    .await?;
                return Ok(self.payment_required(
                    &record,
                    QUOTE_EXPIRED,
                    "quote expired; pay the refreshed quote".to_string(),
                ));
            }
            Some(record) => record,
            None => {
                self.stores
                    .decisions
                    .upsert_quoted(&decision_id, &inputs, &price, now, self.quote_window)
                    .await?
            }
        };

        // Step 6: paid path
        self.admit_paid(&record, &proof, &price).await
    }

    async fn admit_paid(
        &self,
        record: &DecisionRecord,
        proof: &PaymentProof,
        price: &Price,
    ) -> Result<AdmissionOutcome> {
        let decision_id = &record.decision_id;
        let slot = self.limiter.acquire_slot(decision_id.as_str())?;

        let claim = PaymentClaim {
            payer: proof.from_address,
            recipient: self.pay_to,
            min_amount: record.charged_units,
            transaction_id: proof.transaction_id,
        };
        let spent = ClaimedElsewhere {
            reservations: self.stores.reservations.as_ref(),
            decision: decision_id,
        };
        let verified = match self.verifier.verify(&claim, &spent).await {
            Ok(verified) => verified,
            Err(Error::PaymentNotConfirmed(reason)) => {
                self.metrics.record_payment_failure();
                warn!("Payment for {} not confirmed: {}", decision_id, reason);
                let refreshed = self
                    .requote(
                        decision_id,
                        &record.inputs,
                        price,
                        Some(record),
                        self.clock.now(),
                    )
                    .await?;
                return Ok(self.payment_required(&refreshed, "payment_not_confirmed", reason));
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_payment_verified();

        // Step 7: payer quota is taken atomically and returned unless the
        // decision ends up accepted
        let now = self.clock.now();
        let unit = self.limiter.consume_payer(&proof.from_address, now).await?;
        let accepted = match self.accept_paid(record, proof, &verified, slot, now).await {
            Ok(accepted) => accepted,
            Err(e) => {
                if let Err(release) = self.limiter.release_payer(unit).await {
                    error!(
                        "Failed to release quota of payer {}: {}",
                        proof.from_address, release
                    );
                }
                return Err(e);
            }
        };
        debug!(
            "Payer {} has {} accepted payment(s) today",
            proof.from_address,
            unit.used()
        );

        self.metrics.record_admission();
        info!(
            "Admitted {} as job {} (tx {})",
            decision_id,
            accepted.job_id.as_ref().map_or("-", JobId::as_str),
            verified.transaction_id
        );
        Ok(AdmissionOutcome::Admitted(
            self.accepted_response(&accepted, AdmissionStatus::Accepted),
        ))
    }

    /// Reserve the transaction, start the job, and record acceptance.
    async fn accept_paid(
        &self,
        record: &DecisionRecord,
        proof: &PaymentProof,
        verified: &VerifiedPayment,
        mut slot: RunningSlot,
        now: DateTime<Utc>,
    ) -> Result<DecisionRecord> {
        let decision_id = &record.decision_id;
        let reservation = self
            .stores
            .reservations
            .reserve(&verified.transaction_id, decision_id)
            .await?;
        if !reservation.accepted {
            return Err(Error::Conflict(ConflictKind::TransactionClaimed {
                transaction_id: verified.transaction_id.to_string(),
                owner: reservation.owner.to_string(),
            }));
        }

        let job_id = self.orchestrator.create_job(decision_id, &record.inputs).await?;
        slot.rekey(job_id.as_str())
            .map_err(|_| Error::InvalidState(format!("job {job_id} is already running")))?;
        drop(
            self.orchestrator
                .start_with_slot(slot, job_id.clone(), decision_id.clone(), record.inputs),
        );

        let payment = PaymentRecord {
            from_address: proof.from_address,
            transaction_id: verified.transaction_id,
            network: self.verifier.network().to_string(),
            amount_units: u64::try_from(verified.amount).unwrap_or(u64::MAX),
            block_number: verified.block_number,
            verified_at: now,
        };
        self.stores
            .decisions
            .mark_accepted(decision_id, Some(payment), &job_id, now)
            .await
            .map_err(|e| {
                error!("Job {} started but {} not accepted: {}", job_id, decision_id, e);
                e
            })
    }

    /// A zero charge needs no payment and moves no payer counter.
    async fn admit_free(
        &self,
        decision_id: &DecisionId,
        inputs: &AllocationInputs,
        price: &Price,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome> {
        let mut slot = self.limiter.acquire_slot(decision_id.as_str())?;
        self.stores
            .decisions
            .upsert_quoted(decision_id, inputs, price, now, self.quote_window)
            .await?;

        let job_id = self.orchestrator.create_job(decision_id, inputs).await?;
        slot.rekey(job_id.as_str())
            .map_err(|_| Error::InvalidState(format!("job {job_id} is already running")))?;
        drop(
            self.orchestrator
                .start_with_slot(slot, job_id.clone(), decision_id.clone(), *inputs),
        );

        let accepted = self
            .stores
            .decisions
            .mark_accepted(decision_id, None, &job_id, now)
            .await?;
        self.metrics.record_admission();
        info!("Admitted {} free of charge as job {}", decision_id, job_id);
        Ok(AdmissionOutcome::Admitted(
            self.accepted_response(&accepted, AdmissionStatus::Accepted),
        ))
    }

    /// Keep a live quote; refresh a missing or lapsed one.
    async fn requote(
        &self,
        decision_id: &DecisionId,
        inputs: &AllocationInputs,
        price: &Price,
        existing: Option<&DecisionRecord>,
        now: DateTime<Utc>,
    ) -> Result<DecisionRecord> {
        match existing {
            Some(record) if !record.is_quote_expired(now) => Ok(record.clone()),
            _ => {
                self.stores
                    .decisions
                    .upsert_quoted(decision_id, inputs, price, now, self.quote_window)
                    .await
            }
        }
    }

    fn replay(&self, record: &DecisionRecord) -> AcceptedResponse {
        let status = match &record.job_id {
            Some(job) if self.orchestrator.board().is_complete(job) => {
                AdmissionStatus::AlreadyComplete
            }
            _ => AdmissionStatus::AlreadyAccepted,
        };
        debug!("Replaying {} as {:?}", record.decision_id, status);
        self.accepted_response(record, status)
    }

    fn accepted_response(
        &self,
        record: &DecisionRecord,
        status: AdmissionStatus,
    ) -> AcceptedResponse {
        let job_id = record.job_id.clone().unwrap_or_else(|| JobId::new(""));
        AcceptedResponse {
            status,
            status_path: status_path(&job_id),
            job_id,
            decision_id: record.decision_id.clone(),
            inputs: record.inputs,
            payment: PaymentSummary {
                required: record.charged_units > 0,
                charged_amount: record.charged_amount.clone(),
                verified: record.payment.is_some(),
                from_address: record.payment.as_ref().map(|p| p.from_address),
                transaction_id: record.payment.as_ref().map(|p| p.transaction_id),
            },
        }
    }

    fn payment_required(
        &self,
        record: &DecisionRecord,
        code: &str,
        message: String,
    ) -> AdmissionOutcome {
        self.metrics.record_quote();
        AdmissionOutcome::PaymentRequired(PaymentRequiredResponse {
            error: code.to_string(),
            message,
            amount_usdc: record.charged_amount.clone(),
            asset: self.pricer.asset().to_string(),
            pay_to: self.pay_to,
            decision_id: record.decision_id.clone(),
            quote_expires_at: record.quote_expires_at,
            accepts: vec![PaymentOption {
                scheme: "exact".to_string(),
                network: self.verifier.network().to_string(),
                asset: self.pricer.asset().to_string(),
                token_contract: self.verifier.token(),
                pay_to: self.pay_to,
                min_amount_units: record.charged_units.to_string(),
                decimals: self.pricer.decimals(),
            }],
        })
    }

    /// Stored decision, if any.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn decision(&self, id: &DecisionId) -> Result<Option<DecisionRecord>> {
        self.stores.decisions.get(id).await
    }

    /// Progress of a job.
    #[must_use]
    pub fn job(&self, job: &JobId) -> Option<JobProgress> {
        self.orchestrator.board().get(job)
    }

    /// Admission counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<AdmissionMetrics> {
        &self.metrics
    }

    /// The receiving address payments must go to.
    #[must_use]
    pub fn pay_to(&self) -> EvmAddress {
        self.pay_to
    }

    /// Drop idle rate-limit state.
    pub fn sweep(&self) {
        self.limiter.sweep(self.clock.now());
    }
}
