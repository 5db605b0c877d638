//! Allocation admission protocol.
//!
//! Callers buy one allocation job per decision identifier. The protocol is a
//! single idempotent submit call that is repeated until it succeeds:
//!
//! 1. Caller POSTs `{decisionId, riskTolerance, timeframe, withReport}`
//! 2. Gateway answers 402 with the price, asset, and recipient
//! 3. Caller transfers the stablecoin on-chain
//! 4. Caller repeats the POST with a payment proof
//! 5. Gateway verifies the transfer, starts the job, and answers 202
//! 6. Any further identical POST replays the outcome (200 once complete)
//!
//! # Example
//!
//! ```rust,ignore
//! use allocation_gate::allocation::{AllocateRequest, RouteKind};
//!
//! let body: AllocateRequest = serde_json::from_slice(&bytes)?;
//! let request = body.resolve(RouteKind::Generic, header_key, payment_header, peer_ip)?;
//! let outcome = handler.admit(request).await?;
//! ```

pub mod decision;
pub mod messages;

pub use decision::{
    AllocationInputs, DecisionId, DecisionRecord, DecisionState, Fingerprint, JobId,
    PaymentRecord, RiskTolerance, Timeframe,
};
pub use messages::{
    AcceptedResponse, AdmissionRequest, AdmissionStatus, AllocateRequest, ErrorResponse,
    PaymentAttachment, PaymentOption, PaymentProof, PaymentProofBody, PaymentRequiredResponse,
    PaymentSummary, RouteKind,
};

/// Generic submission route.
pub const ALLOCATE_PATH: &str = "/allocate";

/// Allocation-with-report submission route.
pub const ALLOCATE_REPORT_PATH: &str = "/allocate/report";

/// Prefix of job status paths (`/jobs/{jobId}`).
pub const JOB_STATUS_PREFIX: &str = "/jobs";

/// Header that may carry the decision identifier.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header that may carry a base64 JSON payment proof.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Build the status path for a job.
#[must_use]
pub fn status_path(job_id: &JobId) -> String {
    format!("{JOB_STATUS_PREFIX}/{job_id}")
}
