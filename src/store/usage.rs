//! Per-payer daily usage counters, keyed by UTC day.
//!
//! Counters reset implicitly: a new UTC day is a new key.

use crate::error::Result;
use crate::payment::wallet::EvmAddress;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;

/// Accepted-payment counters per payer and UTC day.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Accepted payments from `address` on `day`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn get(&self, address: &EvmAddress, day: NaiveDate) -> Result<u64>;

    /// Count one more payment from `address` on `day` if fewer than `limit`
    /// are counted already. Check and increment are one atomic step.
    ///
    /// Returns the new count, or `None` when the payer is at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn try_consume(
        &self,
        address: &EvmAddress,
        day: NaiveDate,
        limit: u64,
    ) -> Result<Option<u64>>;

    /// Give back one unit taken by [`UsageStore::try_consume`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    async fn release(&self, address: &EvmAddress, day: NaiveDate) -> Result<()>;
}

/// In-memory usage counters.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    counts: DashMap<(NaiveDate, EvmAddress), u64>,
}

impl MemoryUsageStore {
    /// Create empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(&self, address: &EvmAddress, day: NaiveDate) -> Result<u64> {
        Ok(self.counts.get(&(day, *address)).map_or(0, |c| *c))
    }

    async fn try_consume(
        &self,
        address: &EvmAddress,
        day: NaiveDate,
        limit: u64,
    ) -> Result<Option<u64>> {
        // The entry guard holds the shard lock across the compare and the add.
        let mut count = self.counts.entry((day, *address)).or_insert(0);
        if *count >= limit {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn release(&self, address: &EvmAddress, day: NaiveDate) -> Result<()> {
        if let Some(mut count) = self.counts.get_mut(&(day, *address)) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}
