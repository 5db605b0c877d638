//! Decision records and the values they are keyed and fingerprinted by.
//!
//! A decision is one caller-chosen admission attempt. Its identifier is the
//! idempotency key; its fingerprint pins the request parameters so a retry
//! with different parameters is detected as a conflict.

use crate::error::{Error, Result};
use crate::payment::wallet::{EvmAddress, TxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Minimum decision identifier length.
pub const MIN_DECISION_ID_LEN: usize = 6;

/// Maximum decision identifier length.
pub const MAX_DECISION_ID_LEN: usize = 128;

/// Domain tag mixed into every input fingerprint.
const FINGERPRINT_DOMAIN: &[u8] = b"allocation-gate/inputs/v1";

/// Caller-chosen decision identifier.
///
/// 6 to 128 characters from `[A-Za-z0-9:_.-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecisionId(String);

impl DecisionId {
    /// Validate and wrap a decision identifier.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the length or alphabet is wrong.
    pub fn parse(raw: &str) -> Result<Self> {
        let len = raw.chars().count();
        if !(MIN_DECISION_ID_LEN..=MAX_DECISION_ID_LEN).contains(&len) {
            return Err(Error::Validation(format!(
                "decisionId must be {MIN_DECISION_ID_LEN}-{MAX_DECISION_ID_LEN} characters, got {len}"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-')))
        {
            return Err(Error::Validation(format!(
                "decisionId contains invalid character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DecisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DecisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Pipeline job identifier, assigned by the pipeline collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a pipeline-issued job identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller's risk appetite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTolerance {
    /// Capital preservation first.
    Conservative,
    /// Balanced growth and preservation.
    Balanced,
    /// Growth first.
    Aggressive,
}

impl RiskTolerance {
    /// Canonical wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "Conservative",
            Self::Balanced => "Balanced",
            Self::Aggressive => "Aggressive",
        }
    }
}

/// Investment horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// Less than one year.
    #[serde(rename = "<1_year")]
    UnderOneYear,
    /// One to three years.
    #[serde(rename = "1-3_years")]
    OneToThreeYears,
    /// More than three years.
    #[serde(rename = "3+_years")]
    OverThreeYears,
}

impl Timeframe {
    /// Canonical wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnderOneYear => "<1_year",
            Self::OneToThreeYears => "1-3_years",
            Self::OverThreeYears => "3+_years",
        }
    }
}

/// The semantic request parameters of an allocation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationInputs {
    /// Risk appetite.
    pub risk_tolerance: RiskTolerance,
    /// Investment horizon.
    pub timeframe: Timeframe,
    /// Whether a rendered report is included.
    pub with_report: bool,
}

impl AllocationInputs {
    /// Deterministic hash of the normalized parameters.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let canonical = format!(
            "riskTolerance={}|timeframe={}|withReport={}",
            self.risk_tolerance.as_str(),
            self.timeframe.as_str(),
            self.with_report
        );
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        Fingerprint(hasher.finalize().into())
    }
}

/// SHA-256 fingerprint of normalized request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 32 bytes"))?;
        Ok(Self(digest))
    }
}

/// Lifecycle state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    /// A price has been quoted; no job yet.
    Quoted,
    /// Payment verified (or waived) and a job started. Terminal.
    Accepted,
}

/// Verified payment attached to an accepted decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Payer address.
    pub from_address: EvmAddress,
    /// Funding transaction.
    pub transaction_id: TxHash,
    /// Network the transfer was observed on.
    pub network: String,
    /// Transferred amount in the asset's smallest unit.
    pub amount_units: u64,
    /// Block the transfer was included in.
    pub block_number: u64,
    /// When verification succeeded.
    pub verified_at: DateTime<Utc>,
}

/// One record per decision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    /// The idempotency key.
    pub decision_id: DecisionId,
    /// Fingerprint of `inputs`; fixed at creation.
    pub input_fingerprint: Fingerprint,
    /// The request parameters, echoed back to callers.
    pub inputs: AllocationInputs,
    /// Quoted price in display units (e.g. `"19"`).
    pub charged_amount: String,
    /// Quoted price in the asset's smallest unit.
    pub charged_units: u64,
    /// When the current quote was issued.
    pub quote_issued_at: DateTime<Utc>,
    /// When the current quote stops being honored.
    pub quote_expires_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: DecisionState,
    /// Present once accepted with a payment.
    pub payment: Option<PaymentRecord>,
    /// Present once the pipeline has been started. Never changes once set.
    pub job_id: Option<JobId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// Whether the record has reached its terminal state.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.state == DecisionState::Accepted
    }

    /// Whether the quote can no longer be paid against at `now`.
    #[must_use]
    pub fn is_quote_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.quote_expires_at
    }

    /// Whether `inputs` match the stored fingerprint.
    #[must_use]
    pub fn matches(&self, inputs: &AllocationInputs) -> bool {
        self.input_fingerprint == inputs.fingerprint()
    }
}
