//! Request and response bodies of the allocation admission protocol.
//!
//! Transport-neutral: the HTTP layer deserializes [`AllocateRequest`],
//! resolves it into an [`AdmissionRequest`], and serializes whichever
//! response the admission handler produced.

use crate::allocation::decision::{AllocationInputs, DecisionId, JobId, RiskTolerance, Timeframe};
use crate::error::{Error, Result};
use crate::payment::wallet::{parse_address, parse_tx_hash, EvmAddress, TxHash};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// =============================================================================
// Requests
// =============================================================================

/// Which submission route the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Generic route; `withReport` comes from the body (default `false`).
    Generic,
    /// Allocation-with-report route; implies `withReport = true`.
    WithReport,
}

/// Payment proof as presented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProofBody {
    /// Address the transfer was sent from.
    pub from_address: String,
    /// Transaction that carries the transfer, if the caller knows it.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// A parsed payment proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentProof {
    /// Claimed payer.
    pub from_address: EvmAddress,
    /// Claimed funding transaction.
    pub transaction_id: Option<TxHash>,
}

impl PaymentProofBody {
    /// Parse the wire proof.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPaymentProof` if the address or hash is malformed.
    pub fn parse(&self) -> Result<PaymentProof> {
        let from_address = parse_address(&self.from_address)?;
        let transaction_id = self
            .transaction_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_tx_hash)
            .transpose()?;
        Ok(PaymentProof {
            from_address,
            transaction_id,
        })
    }

    /// Decode an `X-PAYMENT` header value (base64 of the JSON body).
    ///
    /// # Errors
    ///
    /// Returns `InvalidPaymentProof` if the header is not base64 JSON.
    pub fn from_header(value: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map_err(|e| Error::InvalidPaymentProof(format!("X-PAYMENT is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidPaymentProof(format!("X-PAYMENT is not a proof: {e}")))
    }

    /// Encode as an `X-PAYMENT` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(json)
    }
}

/// What the caller attached as payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentAttachment {
    /// Nothing attached.
    None,
    /// A well-formed proof, not yet verified.
    Presented(PaymentProof),
    /// Something was attached but could not be parsed.
    Malformed(String),
}

/// Body of a submit/continue request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    /// Caller-chosen decision identifier.
    #[serde(default)]
    pub decision_id: Option<String>,
    /// Alias for `decision_id`.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Risk appetite.
    #[serde(default)]
    pub risk_tolerance: Option<RiskTolerance>,
    /// Investment horizon.
    #[serde(default)]
    pub timeframe: Option<Timeframe>,
    /// Whether a report is requested.
    #[serde(default)]
    pub with_report: Option<bool>,
    /// Payment proof.
    #[serde(default)]
    pub payment: Option<PaymentProofBody>,
}

/// A fully resolved admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Validated decision identifier.
    pub decision_id: DecisionId,
    /// Normalized parameters.
    pub inputs: AllocationInputs,
    /// Attached payment, if any.
    pub payment: PaymentAttachment,
    /// Requesting client address.
    pub client_ip: IpAddr,
}

impl AllocateRequest {
    /// Resolve the body plus transport metadata into an [`AdmissionRequest`].
    ///
    /// Every supplied identifier (body `decisionId`, body `idempotencyKey`,
    /// `Idempotency-Key` header) must be identical.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a missing or inconsistent identifier,
    /// missing parameters, or a `withReport` that contradicts the route.
    pub fn resolve(
        self,
        route: RouteKind,
        idempotency_header: Option<&str>,
        payment_header: Option<&str>,
        client_ip: IpAddr,
    ) -> Result<AdmissionRequest> {
        let decision_id = resolve_decision_id(
            self.decision_id.as_deref(),
            self.idempotency_key.as_deref(),
            idempotency_header,
        )?;

        let risk_tolerance = self
            .risk_tolerance
            .ok_or_else(|| Error::Validation("riskTolerance is required".to_string()))?;
        let timeframe = self
            .timeframe
            .ok_or_else(|| Error::Validation("timeframe is required".to_string()))?;

        let with_report = match (route, self.with_report) {
            (RouteKind::Generic, flag) => flag.unwrap_or(false),
            (RouteKind::WithReport, None | Some(true)) => true,
            (RouteKind::WithReport, Some(false)) => {
                return Err(Error::Validation(
                    "withReport=false contradicts the allocation-with-report route".to_string(),
                ));
            }
        };

        let payment = resolve_payment(self.payment.as_ref(), payment_header);

        Ok(AdmissionRequest {
            decision_id,
            inputs: AllocationInputs {
                risk_tolerance,
                timeframe,
                with_report,
            },
            payment,
            client_ip,
        })
    }
}

fn resolve_decision_id(
    body_id: Option<&str>,
    body_key: Option<&str>,
    header_key: Option<&str>,
) -> Result<DecisionId> {
    let mut supplied = [body_id, body_key, header_key].into_iter().flatten();
    let first = supplied.next().ok_or_else(|| {
        Error::Validation("decisionId or Idempotency-Key is required".to_string())
    })?;
    if supplied.any(|other| other != first) {
        return Err(Error::Validation(
            "decisionId and idempotency key must match exactly".to_string(),
        ));
    }
    DecisionId::parse(first)
}

fn resolve_payment(body: Option<&PaymentProofBody>, header: Option<&str>) -> PaymentAttachment {
    let from_header = match header.map(PaymentProofBody::from_header).transpose() {
        Ok(proof) => proof,
        Err(e) => return PaymentAttachment::Malformed(e.to_string()),
    };

    let chosen = match (body, from_header.as_ref()) {
        (None, None) => return PaymentAttachment::None,
        (Some(b), Some(h)) if b != h => {
            return PaymentAttachment::Malformed(
                "body payment and X-PAYMENT header disagree".to_string(),
            );
        }
        (Some(b), _) => b,
        (None, Some(h)) => h,
    };

    match chosen.parse() {
        Ok(proof) => PaymentAttachment::Presented(proof),
        Err(e) => PaymentAttachment::Malformed(e.to_string()),
    }
}

// =============================================================================
// Responses
// =============================================================================

/// One way the caller may pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    /// Payment scheme; always an exact on-chain transfer.
    pub scheme: String,
    /// Network name.
    pub network: String,
    /// Asset symbol.
    pub asset: String,
    /// Token contract, when configured.
    pub token_contract: Option<EvmAddress>,
    /// Recipient.
    pub pay_to: EvmAddress,
    /// Minimum transfer in the asset's smallest unit.
    pub min_amount_units: String,
    /// Asset decimals.
    pub decimals: u32,
}

/// 402: what must be paid before the job is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    /// Always `payment_required`, or a more specific code when a proof was rejected.
    pub error: String,
    /// Human-readable detail.
    pub message: String,
    /// Price in display units.
    pub amount_usdc: String,
    /// Asset symbol.
    pub asset: String,
    /// Recipient.
    pub pay_to: EvmAddress,
    /// The decision being quoted.
    pub decision_id: DecisionId,
    /// When the quote lapses.
    pub quote_expires_at: DateTime<Utc>,
    /// Accepted payment options.
    pub accepts: Vec<PaymentOption>,
}

/// Outcome label of an admitted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    /// Admitted by this request.
    Accepted,
    /// Admitted earlier; job still running.
    AlreadyAccepted,
    /// Admitted earlier; job finished successfully.
    AlreadyComplete,
}

/// Payment section of an admission response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    /// Whether a payment was required.
    pub required: bool,
    /// Charged price in display units.
    pub charged_amount: String,
    /// Whether an on-chain payment was verified.
    pub verified: bool,
    /// Payer.
    pub from_address: Option<EvmAddress>,
    /// Funding transaction.
    pub transaction_id: Option<TxHash>,
}

/// 202 / 200: the decision is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    /// Outcome label.
    pub status: AdmissionStatus,
    /// Pipeline job.
    pub job_id: JobId,
    /// The admitted decision.
    pub decision_id: DecisionId,
    /// Echo of the admitted parameters.
    pub inputs: AllocationInputs,
    /// Payment details.
    pub payment: PaymentSummary,
    /// Path to poll for job progress.
    pub status_path: String,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable machine-readable code.
    pub error: String,
    /// Human-readable detail.
    pub message: String,
    /// Retry hint for rate-limited requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        let retry_after_secs = match e {
            Error::RateLimited { retry_after, .. } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        Self {
            error: e.code().to_string(),
            message: e.to_string(),
            retry_after_secs,
        }
    }
}
