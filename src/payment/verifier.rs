//! On-chain payment verification.
//!
//! Two strategies share one deadline:
//!
//! ```text
//! claim ──► tx id given? ──yes──► direct: confirmations + logs of that tx ──► match ──► ok
//!                │                         │ timeout / mismatch / RPC trouble
//!                no                        ▼
//!                └──────────────────► scan: recent logs (from, to, value >= min)
//!                                           poll until match or deadline ──► PaymentNotConfirmed
//! ```
//!
//! The deadline is computed once, so falling through to scanning never
//! extends the overall budget.

use crate::config::PaymentConfig;
use crate::error::{Error, Result};
use crate::payment::chain::{ChainClient, TransferFilter, TransferLog};
use crate::payment::wallet::{parse_address, EvmAddress, TxHash};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A caller's claim that a transfer happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentClaim {
    /// Claimed payer.
    pub payer: EvmAddress,
    /// The service's receiving address.
    pub recipient: EvmAddress,
    /// Minimum transfer in the asset's smallest unit.
    pub min_amount: u64,
    /// Funding transaction, if the caller named one.
    pub transaction_id: Option<TxHash>,
}

/// A transfer the verifier accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedPayment {
    /// Funding transaction.
    pub transaction_id: TxHash,
    /// Transferred amount in the asset's smallest unit.
    pub amount: u128,
    /// Inclusion block.
    pub block_number: u64,
}

/// Transactions that scanning must not match because they already fund
/// another decision.
#[async_trait]
pub trait SpentTransactions: Send + Sync {
    /// Whether `tx` is unavailable to the current claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    async fn is_spent(&self, tx: &TxHash) -> Result<bool>;
}

/// Treats every transaction as available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NothingSpent;

#[async_trait]
impl SpentTransactions for NothingSpent {
    async fn is_spent(&self, _tx: &TxHash) -> Result<bool> {
        Ok(false)
    }
}

/// Verifier tuning.
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Network label recorded with verified payments.
    pub network: String,
    /// Token contract; `None` accepts transfers from any emitter, which the
    /// gateway only allows on the devnet.
    pub token: Option<EvmAddress>,
    /// Confirmation depth required by direct verification.
    pub confirmations: u64,
    /// Overall budget shared by both strategies.
    pub timeout: Duration,
    /// Sleep between scans.
    pub scan_poll_interval: Duration,
    /// Number of recent blocks each scan covers.
    pub scan_block_range: u64,
    /// Retry policy for chain calls.
    pub retry: RetryPolicy,
}

impl VerifierSettings {
    /// Settings from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the token contract is malformed.
    pub fn from_config(config: &PaymentConfig) -> Result<Self> {
        let token = config
            .token_contract
            .as_deref()
            .map(parse_address)
            .transpose()
            .map_err(|e| Error::Config(format!("payment.token_contract: {e}")))?;
        Ok(Self {
            network: config.network.clone(),
            token,
            confirmations: config.confirmations,
            timeout: Duration::from_secs(config.verify_timeout_secs),
            scan_poll_interval: Duration::from_millis(config.scan_poll_interval_ms),
            scan_block_range: config.scan_block_range.max(1),
            retry: RetryPolicy::for_chain(config),
        })
    }
}

/// Confirms that a claimed transfer exists on chain.
pub struct PaymentVerifier {
    chain: Arc<dyn ChainClient>,
    settings: VerifierSettings,
}

impl PaymentVerifier {
    /// Create a verifier over `chain`.
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>, settings: VerifierSettings) -> Self {
        info!(
            "Payment verifier on {} (confirmations={}, timeout={:?})",
            settings.network, settings.confirmations, settings.timeout
        );
        Self { chain, settings }
    }

    /// Network label for payment records.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.settings.network
    }

    /// Token contract payments must be made in, if pinned.
    #[must_use]
    pub fn token(&self) -> Option<EvmAddress> {
        self.settings.token
    }

    /// Verify `claim` within the configured budget.
    ///
    /// Direct verification runs first when a transaction id is supplied;
    /// any inconclusive result falls through to scanning. Scanning skips
    /// transactions `spent` reports as unavailable.
    ///
    /// # Errors
    ///
    /// Returns `PaymentNotConfirmed` when the budget runs out without a
    /// match, or `UpstreamUnavailable` when scanning cannot reach the chain
    /// after retries.
    pub async fn verify(
        &self,
        claim: &PaymentClaim,
        spent: &dyn SpentTransactions,
    ) -> Result<VerifiedPayment> {
        let deadline = Instant::now() + self.settings.timeout;

        if let Some(tx) = claim.transaction_id {
            match self.verify_direct(claim, &tx, deadline).await {
                Some(found) => return Ok(found),
                None => debug!("Direct verification of {} inconclusive; scanning", tx),
            }
        }

        self.scan(claim, spent, deadline).await
    }

    /// Direct strategy. `None` means inconclusive, never a definite no.
    async fn verify_direct(
        &self,
        claim: &PaymentClaim,
        tx: &TxHash,
        deadline: Instant,
    ) -> Option<VerifiedPayment> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let receipt = match tokio::time::timeout_at(
            deadline,
            self.settings.retry.run("wait_for_confirmations", || {
                self.chain
                    .wait_for_confirmations(tx, self.settings.confirmations, remaining)
            }),
        )
        .await
        {
            Ok(Ok(Some(receipt))) => receipt,
            Ok(Ok(None)) | Err(_) => {
                warn!("Transaction {} not confirmed within budget", tx);
                return None;
            }
            Ok(Err(e)) => {
                warn!("Could not confirm transaction {}: {}", tx, e);
                return None;
            }
        };

        if !receipt.success {
            warn!("Transaction {} reverted", tx);
            return None;
        }

        let filter = self.filter(claim, receipt.block_number, receipt.block_number);
        let logs = match tokio::time::timeout_at(
            deadline,
            self.settings
                .retry
                .run("transfer_logs", || self.chain.transfer_logs(&filter)),
        )
        .await
        {
            Ok(Ok(logs)) => logs,
            Ok(Err(e)) => {
                warn!("Could not read logs for block {}: {}", receipt.block_number, e);
                return None;
            }
            Err(_) => return None,
        };

        let found = logs
            .iter()
            .find(|log| log.tx_hash == *tx && self.satisfies(claim, log))
            .map(|log| VerifiedPayment {
                transaction_id: log.tx_hash,
                amount: log.value,
                block_number: log.block_number,
            });
        if found.is_none() {
            warn!(
                "Transaction {} carries no transfer of >= {} from {} to {}",
                tx, claim.min_amount, claim.payer, claim.recipient
            );
        }
        found
    }

    async fn scan(
        &self,
        claim: &PaymentClaim,
        spent: &dyn SpentTransactions,
        deadline: Instant,
    ) -> Result<VerifiedPayment> {
        let not_confirmed = || {
            Error::PaymentNotConfirmed(format!(
                "no transfer of >= {} from {} to {} found within {:?}",
                claim.min_amount, claim.payer, claim.recipient, self.settings.timeout
            ))
        };

        loop {
            if Instant::now() >= deadline {
                return Err(not_confirmed());
            }
            let attempt = tokio::time::timeout_at(deadline, self.scan_once(claim, spent)).await;
            match attempt {
                Ok(Ok(Some(found))) => return Ok(found),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(not_confirmed()),
            }

            let pause = self
                .settings
                .scan_poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    async fn scan_once(
        &self,
        claim: &PaymentClaim,
        spent: &dyn SpentTransactions,
    ) -> Result<Option<VerifiedPayment>> {
        let latest = self
            .settings
            .retry
            .run("block_number", || self.chain.block_number())
            .await?;
        let from_block = latest.saturating_sub(self.settings.scan_block_range - 1);
        let filter = self.filter(claim, from_block, latest);

        let mut logs = self
            .settings
            .retry
            .run("transfer_logs", || self.chain.transfer_logs(&filter))
            .await?;
        logs.retain(|log| self.satisfies(claim, log));
        logs.sort_by_key(|log| (log.block_number, log.tx_hash));

        for log in logs {
            if spent.is_spent(&log.tx_hash).await? {
                debug!("Skipping {}: already funds another decision", log.tx_hash);
                continue;
            }
            debug!("Scan matched {} in block {}", log.tx_hash, log.block_number);
            return Ok(Some(VerifiedPayment {
                transaction_id: log.tx_hash,
                amount: log.value,
                block_number: log.block_number,
            }));
        }
        Ok(None)
    }

    fn filter(&self, claim: &PaymentClaim, from_block: u64, to_block: u64) -> TransferFilter {
        TransferFilter {
            token: self.settings.token,
            from: claim.payer,
            to: claim.recipient,
            from_block,
            to_block,
        }
    }

    fn satisfies(&self, claim: &PaymentClaim, log: &TransferLog) -> bool {
        self.settings.token.map_or(true, |token| token == log.token)
            && log.from == claim.payer
            && log.to == claim.recipient
            && log.value >= u128::from(claim.min_amount)
    }
}
