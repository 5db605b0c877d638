//! Admission metrics tracking.
//!
//! Tracks how decisions move through the gateway:
//! - quotes issued and payments verified
//! - admissions, replays, and conflicts
//! - rate-limit rejections and failed verifications
//! - terminal outcomes of orchestrated jobs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counter tracker for the admission flow.
#[derive(Debug)]
pub struct AdmissionMetrics {
    quotes_issued: AtomicU64,
    payments_verified: AtomicU64,
    admissions: AtomicU64,
    replays: AtomicU64,
    conflicts: AtomicU64,
    rate_limited: AtomicU64,
    payment_failures: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    /// Gateway start time for uptime.
    start_time: Instant,
    /// Path for persisting counters (optional).
    persist_path: Option<PathBuf>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// 402 responses sent.
    pub quotes_issued: u64,
    /// Payments the verifier accepted.
    pub payments_verified: u64,
    /// Decisions admitted.
    pub admissions: u64,
    /// Idempotent replays served.
    pub replays: u64,
    /// Fingerprint and double-claim conflicts.
    pub conflicts: u64,
    /// Requests rejected by any rate-limit axis.
    pub rate_limited: u64,
    /// Verifications that did not confirm.
    pub payment_failures: u64,
    /// Jobs whose every phase completed.
    pub jobs_completed: u64,
    /// Jobs that failed or timed out.
    pub jobs_failed: u64,
    /// Seconds since the gateway started.
    #[serde(default)]
    pub uptime_secs: u64,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionMetrics {
    /// Create a zeroed tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            quotes_issued: AtomicU64::new(0),
            payments_verified: AtomicU64::new(0),
            admissions: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            payment_failures: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            start_time: Instant::now(),
            persist_path: None,
        }
    }

    /// Create a tracker that persists to `persist_path`, resuming from any
    /// counters already stored there.
    #[must_use]
    pub fn with_persistence(persist_path: &std::path::Path) -> Self {
        let mut tracker = Self::new();
        tracker.persist_path = Some(persist_path.to_path_buf());

        if let Some(loaded) = Self::load_from_disk(persist_path) {
            tracker.restore(&loaded);
            info!(
                "Loaded persisted metrics: {} admissions, {} payments verified",
                loaded.admissions, loaded.payments_verified
            );
        }

        tracker
    }

    /// Record a 402 quote.
    pub fn record_quote(&self) {
        self.quotes_issued.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a verified payment.
    pub fn record_payment_verified(&self) {
        self.payments_verified.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an admission.
    pub fn record_admission(&self) {
        let count = self.admissions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Decision admitted, total admissions: {}", count);
        self.persist();
    }

    /// Record an idempotent replay.
    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a conflict rejection.
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a rate-limit rejection.
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a verification that did not confirm.
    pub fn record_payment_failure(&self) {
        self.payment_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a job that completed every phase.
    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.persist();
    }

    /// Record a job that failed or timed out.
    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.persist();
    }

    /// Copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            quotes_issued: self.quotes_issued.load(Ordering::SeqCst),
            payments_verified: self.payments_verified.load(Ordering::SeqCst),
            admissions: self.admissions.load(Ordering::SeqCst),
            replays: self.replays.load(Ordering::SeqCst),
            conflicts: self.conflicts.load(Ordering::SeqCst),
            rate_limited: self.rate_limited.load(Ordering::SeqCst),
            payment_failures: self.payment_failures.load(Ordering::SeqCst),
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Write counters to the persistence path, if any.
    pub fn persist(&self) {
        if let Some(ref path) = self.persist_path {
            match serde_json::to_vec_pretty(&self.snapshot()) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(path, bytes) {
                        warn!("Failed to persist metrics: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode metrics: {}", e),
            }
        }
    }

    fn restore(&self, loaded: &MetricsSnapshot) {
        self.quotes_issued
            .store(loaded.quotes_issued, Ordering::SeqCst);
        self.payments_verified
            .store(loaded.payments_verified, Ordering::SeqCst);
        self.admissions.store(loaded.admissions, Ordering::SeqCst);
        self.replays.store(loaded.replays, Ordering::SeqCst);
        self.conflicts.store(loaded.conflicts, Ordering::SeqCst);
        self.rate_limited.store(loaded.rate_limited, Ordering::SeqCst);
        self.payment_failures
            .store(loaded.payment_failures, Ordering::SeqCst);
        self.jobs_completed
            .store(loaded.jobs_completed, Ordering::SeqCst);
        self.jobs_failed.store(loaded.jobs_failed, Ordering::SeqCst);
    }

    fn load_from_disk(path: &std::path::Path) -> Option<MetricsSnapshot> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}
