//! Local devnet: an in-process chain and pipeline.
//!
//! Lets the gateway run end to end on one machine without an RPC node or a
//! pipeline service. Transfers are mined into blocks immediately unless
//! submitted as pending; pipeline phases complete after a fixed number of
//! status polls, or fail where a failure was scripted.

use crate::allocation::{AllocationInputs, DecisionId, JobId};
use crate::error::{Error, Result};
use crate::payment::chain::{confirmations_at, ChainClient, Receipt, TransferFilter, TransferLog};
use crate::payment::wallet::{EvmAddress, TxHash};
use crate::pipeline::client::{PhaseReport, PhaseStatus, PipelineClient};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

// =============================================================================
// Devnet Constants
// =============================================================================

/// Block height the devnet chain starts at.
pub const DEVNET_GENESIS_BLOCK: u64 = 1_000;

/// Status polls a devnet phase needs before it completes.
pub const DEFAULT_POLLS_PER_PHASE: u32 = 2;

/// Polling interval while waiting for confirmations (milliseconds).
const CONFIRMATION_POLL_INTERVAL_MS: u64 = 10;

/// Token contract the devnet's transfers are emitted by.
pub const DEVNET_TOKEN: EvmAddress = EvmAddress::new([0x5d; 20]);

/// Path of the dev-only transfer endpoint.
pub const DEV_TRANSFER_PATH: &str = "/dev/transfers";

// =============================================================================
// Chain
// =============================================================================

#[derive(Debug, Default)]
struct ChainState {
    head: u64,
    mined: Vec<TransferLog>,
    pending: Vec<TransferLog>,
    reverted: Vec<TxHash>,
}

/// In-memory chain carrying one token.
#[derive(Debug)]
pub struct DevChain {
    state: Mutex<ChainState>,
    tx_counter: AtomicU64,
}

impl Default for DevChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DevChain {
    /// Create a chain at [`DEVNET_GENESIS_BLOCK`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                head: DEVNET_GENESIS_BLOCK,
                ..ChainState::default()
            }),
            tx_counter: AtomicU64::new(0),
        }
    }

    fn next_tx_hash(&self) -> TxHash {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let digest = Sha256::new()
            .chain_update(b"allocation-gate/devnet-tx")
            .chain_update(n.to_be_bytes())
            .finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        TxHash::new(hash)
    }

    /// Transfer `value` units of [`DEVNET_TOKEN`] and mine it in a new block.
    pub fn transfer(&self, from: EvmAddress, to: EvmAddress, value: u128) -> TxHash {
        self.transfer_token(DEVNET_TOKEN, from, to, value)
    }

    /// Transfer `value` units of some other `token` and mine it.
    pub fn transfer_token(
        &self,
        token: EvmAddress,
        from: EvmAddress,
        to: EvmAddress,
        value: u128,
    ) -> TxHash {
        let tx_hash = self.next_tx_hash();
        let mut state = self.state.lock();
        state.head += 1;
        let block_number = state.head;
        state.mined.push(TransferLog {
            tx_hash,
            token,
            from,
            to,
            value,
            block_number,
        });
        info!(
            "Devnet transfer {} -> {} of {} units in block {} ({})",
            from, to, value, block_number, tx_hash
        );
        tx_hash
    }

    /// Submit a transfer that stays unmined until [`DevChain::mine`].
    pub fn transfer_pending(&self, from: EvmAddress, to: EvmAddress, value: u128) -> TxHash {
        let tx_hash = self.next_tx_hash();
        self.state.lock().pending.push(TransferLog {
            tx_hash,
            token: DEVNET_TOKEN,
            from,
            to,
            value,
            block_number: 0,
        });
        tx_hash
    }

    /// Mine `blocks` blocks; pending transfers land in the first one.
    pub fn mine(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        let mut state = self.state.lock();
        let first = state.head + 1;
        let pending = std::mem::take(&mut state.pending);
        for mut log in pending {
            log.block_number = first;
            state.mined.push(log);
        }
        state.head += blocks;
        debug!("Devnet mined to block {}", state.head);
    }

    /// Make the receipt of `tx` report a failed execution.
    pub fn revert(&self, tx: TxHash) {
        self.state.lock().reverted.push(tx);
    }

    /// Current head.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.state.lock().head
    }

    fn receipt(&self, tx: &TxHash) -> Option<(Receipt, u64)> {
        let state = self.state.lock();
        state.mined.iter().find(|l| l.tx_hash == *tx).map(|log| {
            (
                Receipt {
                    tx_hash: log.tx_hash,
                    block_number: log.block_number,
                    success: !state.reverted.contains(tx),
                },
                state.head,
            )
        })
    }
}

#[async_trait]
impl ChainClient for DevChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.head())
    }

    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<TransferLog>> {
        let state = self.state.lock();
        Ok(state
            .mined
            .iter()
            .filter(|l| {
                filter.token.map_or(true, |token| token == l.token)
                    && l.from == filter.from
                    && l.to == filter.to
                    && l.block_number >= filter.from_block
                    && l.block_number <= filter.to_block
                    && !state.reverted.contains(&l.tx_hash)
            })
            .copied()
            .collect())
    }

    async fn wait_for_confirmations(
        &self,
        tx: &TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Option<Receipt>> {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(CONFIRMATION_POLL_INTERVAL_MS);
        loop {
            if let Some((receipt, head)) = self.receipt(tx) {
                if confirmations_at(receipt.block_number, head) >= confirmations {
                    return Ok(Some(receipt));
                }
            }
            if Instant::now() + interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Default)]
struct DevJob {
    started: Vec<u32>,
    polls: HashMap<u32, u32>,
}

/// In-memory pipeline with scriptable phase failures.
#[derive(Debug)]
pub struct DevPipeline {
    jobs: DashMap<JobId, DevJob>,
    failures: Mutex<HashMap<u32, String>>,
    polls_per_phase: AtomicU32,
    unavailable: AtomicU32,
    create_delay_ms: AtomicU64,
}

impl Default for DevPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl DevPipeline {
    /// Create a pipeline whose phases complete after
    /// [`DEFAULT_POLLS_PER_PHASE`] polls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            failures: Mutex::new(HashMap::new()),
            polls_per_phase: AtomicU32::new(DEFAULT_POLLS_PER_PHASE),
            unavailable: AtomicU32::new(0),
            create_delay_ms: AtomicU64::new(0),
        }
    }

    /// Every job's `phase` fails with `message`.
    pub fn fail_phase(&self, phase: u32, message: impl Into<String>) {
        self.failures.lock().insert(phase, message.into());
    }

    /// Polls before a phase reports completion.
    pub fn set_polls_per_phase(&self, polls: u32) {
        self.polls_per_phase.store(polls.max(1), Ordering::SeqCst);
    }

    /// The next `calls` pipeline calls fail as unavailable.
    pub fn fail_next_calls(&self, calls: u32) {
        self.unavailable.store(calls, Ordering::SeqCst);
    }

    /// Job creation takes `delay`, like a slow downstream.
    pub fn set_create_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Phases started for `job`, in order.
    #[must_use]
    pub fn started_phases(&self, job: &JobId) -> Vec<u32> {
        self.jobs
            .get(job)
            .map(|j| j.started.clone())
            .unwrap_or_default()
    }

    /// Number of jobs created.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn check_available(&self) -> Result<()> {
        let outage = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if outage.is_ok() {
            return Err(Error::UpstreamUnavailable(
                "devnet pipeline unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineClient for DevPipeline {
    async fn create_job(
        &self,
        decision_id: &DecisionId,
        _inputs: &AllocationInputs,
    ) -> Result<JobId> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        let job = JobId::new(format!("job-{}", uuid::Uuid::new_v4().simple()));
        self.jobs.insert(job.clone(), DevJob::default());
        debug!("Devnet pipeline created {} for {}", job, decision_id);
        Ok(job)
    }

    async fn start_phase(&self, job: &JobId, phase: u32, _phase_inputs: &Value) -> Result<()> {
        self.check_available()?;
        let mut entry = self
            .jobs
            .get_mut(job)
            .ok_or_else(|| Error::PipelinePhaseFailed {
                phase,
                message: format!("unknown job {job}"),
            })?;
        if !entry.started.contains(&phase) {
            entry.started.push(phase);
        }
        Ok(())
    }

    async fn phase_status(&self, job: &JobId, phase: u32) -> Result<PhaseReport> {
        self.check_available()?;
        let mut entry = self
            .jobs
            .get_mut(job)
            .ok_or_else(|| Error::PipelinePhaseFailed {
                phase,
                message: format!("unknown job {job}"),
            })?;
        if !entry.started.contains(&phase) {
            return Ok(PhaseReport::new(PhaseStatus::Idle));
        }
        let polls = entry.polls.entry(phase).or_insert(0);
        *polls += 1;
        if *polls < self.polls_per_phase.load(Ordering::SeqCst) {
            return Ok(PhaseReport::new(PhaseStatus::InProgress));
        }
        if let Some(message) = self.failures.lock().get(&phase) {
            return Ok(PhaseReport::failed(message.clone()));
        }
        Ok(PhaseReport::new(PhaseStatus::Complete))
    }
}

// =============================================================================
// Dev-only HTTP routes
// =============================================================================

/// Body of `POST /dev/transfers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevTransferRequest {
    /// Payer.
    pub from_address: EvmAddress,
    /// Recipient; defaults to the gateway's receiving address.
    #[serde(default)]
    pub to_address: Option<EvmAddress>,
    /// Amount in smallest units, as a decimal string.
    pub amount_units: String,
}

/// Response of `POST /dev/transfers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevTransferResponse {
    /// The mined transaction.
    pub transaction_id: TxHash,
    /// Its block.
    pub block_number: u64,
}

#[derive(Clone)]
struct DevRoutesState {
    chain: Arc<DevChain>,
    pay_to: EvmAddress,
}

/// Routes that move devnet money; only mounted in dev mode.
pub fn routes(chain: Arc<DevChain>, pay_to: EvmAddress) -> Router {
    Router::new()
        .route(DEV_TRANSFER_PATH, post(dev_transfer))
        .with_state(DevRoutesState { chain, pay_to })
}

async fn dev_transfer(
    State(state): State<DevRoutesState>,
    Json(body): Json<DevTransferRequest>,
) -> std::result::Result<Json<DevTransferResponse>, (axum::http::StatusCode, String)> {
    let value: u128 = body
        .amount_units
        .parse()
        .map_err(|e| (axum::http::StatusCode::BAD_REQUEST, format!("amountUnits: {e}")))?;
    let to = body.to_address.unwrap_or(state.pay_to);
    let transaction_id = state.chain.transfer(body.from_address, to, value);
    Ok(Json(DevTransferResponse {
        transaction_id,
        block_number: state.chain.head(),
    }))
}
