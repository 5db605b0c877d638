//! Error types for allocation-gate.

use crate::limits::RateLimitReason;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a request conflicts with state already recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Same decision identifier, different input fingerprint.
    FingerprintMismatch {
        /// Fingerprint stored with the decision.
        stored: String,
        /// Fingerprint of the incoming request.
        presented: String,
    },
    /// The transaction already funds a different decision.
    TransactionClaimed {
        /// The contested transaction hash.
        transaction_id: String,
        /// Decision that owns the transaction.
        owner: String,
    },
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FingerprintMismatch { stored, presented } => write!(
                f,
                "decision inputs changed (stored fingerprint {stored}, presented {presented})"
            ),
            Self::TransactionClaimed {
                transaction_id,
                owner,
            } => write!(
                f,
                "transaction {transaction_id} already funds decision {owner}"
            ),
        }
    }
}

/// Errors that can occur in allocation-gate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Gateway startup error.
    #[error("gateway startup failed: {0}")]
    Startup(String),

    /// Malformed request. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Request conflicts with recorded state.
    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    /// A rate-limit axis rejected the request.
    #[error("rate limited ({reason}), retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Which limit was hit.
        reason: RateLimitReason,
        /// How long the caller should wait.
        retry_after: Duration,
    },

    /// The attached payment proof could not be parsed or is unusable.
    #[error("invalid payment proof: {0}")]
    InvalidPaymentProof(String),

    /// Payment verification exhausted its time budget.
    #[error("payment not confirmed: {0}")]
    PaymentNotConfirmed(String),

    /// Blockchain RPC or pipeline collaborator unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A pipeline phase reported failure.
    #[error("pipeline phase {phase} failed: {message}")]
    PipelinePhaseFailed {
        /// 1-based phase number.
        phase: u32,
        /// Failure message reported by the pipeline.
        message: String,
    },

    /// A pipeline phase did not finish within its deadline.
    #[error("pipeline phase {phase} timed out")]
    PhaseTimeout {
        /// 1-based phase number.
        phase: u32,
    },

    /// A job did not finish all phases within the overall deadline.
    #[error("job exceeded overall timeout of {}s", after.as_secs())]
    JobTimeout {
        /// The overall deadline that elapsed.
        after: Duration,
    },

    /// Operation is not valid for the record's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Startup(_) => "startup_error",
            Self::Validation(_) => "validation_error",
            Self::Conflict(ConflictKind::FingerprintMismatch { .. }) => "fingerprint_conflict",
            Self::Conflict(ConflictKind::TransactionClaimed { .. }) => {
                "transaction_already_claimed"
            }
            Self::RateLimited { reason, .. } => reason.code(),
            Self::InvalidPaymentProof(_) => "invalid_payment_proof",
            Self::PaymentNotConfirmed(_) => "payment_not_confirmed",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::PipelinePhaseFailed { .. } => "pipeline_phase_failed",
            Self::PhaseTimeout { .. } => "phase_timeout",
            Self::JobTimeout { .. } => "job_timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Only upstream outages are retried internally.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
