//! Multi-axis admission limits.
//!
//! Three independent checks, evaluated in this order by the admission
//! handler:
//!
//! ```text
//! request ──► IP burst ──► global concurrency ──► verify ──► payer daily cap
//!            (per IP)     (RunningJobSet slot)            (per payer, UTC day)
//! ```
//!
//! Each rejection carries a [`RateLimitReason`] code and a retry-after hint.
//! The payer cap is taken as a [`PayerUnit`] in one store step and handed
//! back if the decision is not accepted.

mod burst;
mod running;

pub use burst::IpBurstLimiter;
pub use running::{RunningJobSet, RunningSlot, SlotRefusal};

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::payment::wallet::EvmAddress;
use crate::store::UsageStore;
use chrono::{DateTime, Days, NaiveDate, Utc};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitReason {
    /// Too many requests from one IP inside the burst window.
    IpBurst,
    /// The running-job set is at capacity.
    GlobalConcurrency,
    /// The payer already used its accepted payments for the UTC day.
    PayerDailyCap,
}

impl RateLimitReason {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::IpBurst => "ip_burst_limit",
            Self::GlobalConcurrency => "global_concurrency_cap",
            Self::PayerDailyCap => "from_address_daily_cap",
        }
    }
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One unit of a payer's daily quota, taken before acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PayerUnit {
    payer: EvmAddress,
    day: NaiveDate,
    used: u64,
}

impl PayerUnit {
    /// Accepted payments from this payer today, this one included.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }
}

/// Composition of the three limit axes.
pub struct RateLimiter {
    burst: IpBurstLimiter,
    running: RunningJobSet,
    usage: Arc<dyn UsageStore>,
    payer_daily_cap: u64,
    concurrency_retry_after: Duration,
}

impl RateLimiter {
    /// Build the limiter from configuration.
    ///
    /// `running` is shared with the job orchestrator.
    #[must_use]
    pub fn new(config: &LimitsConfig, running: RunningJobSet, usage: Arc<dyn UsageStore>) -> Self {
        Self {
            burst: IpBurstLimiter::new(
                config.ip_burst_limit,
                Duration::from_millis(config.ip_burst_window_ms),
            ),
            running,
            usage,
            payer_daily_cap: config.payer_daily_cap,
            concurrency_retry_after: Duration::from_secs(config.concurrency_retry_after_secs),
        }
    }

    /// IP burst check. Counts the request when admitted.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited { IpBurst }` when the IP is over its window.
    pub fn check_ip(&self, ip: IpAddr, now: DateTime<Utc>) -> Result<()> {
        self.burst
            .check(ip, now.timestamp_millis())
            .map_err(|retry_after| {
                warn!("Rejected request from {}: IP burst limit", ip);
                Error::RateLimited {
                    reason: RateLimitReason::IpBurst,
                    retry_after,
                }
            })
    }

    /// Global concurrency check: claim a running slot under `key`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited { GlobalConcurrency }` at capacity, or
    /// `InvalidState` if `key` is already running.
    pub fn acquire_slot(&self, key: &str) -> Result<RunningSlot> {
        self.running.try_acquire(key).map_err(|refusal| match refusal {
            SlotRefusal::Full => {
                warn!(
                    "Global concurrency cap reached ({} running)",
                    self.running.len()
                );
                Error::RateLimited {
                    reason: RateLimitReason::GlobalConcurrency,
                    retry_after: self.concurrency_retry_after,
                }
            }
            SlotRefusal::AlreadyRunning => {
                Error::InvalidState(format!("{key} is already being admitted"))
            }
        })
    }

    /// Payer daily cap, evaluated after verification.
    ///
    /// Takes one unit of the payer's daily quota in a single atomic step.
    /// The unit must be handed back with [`RateLimiter::release_payer`] if the
    /// decision is not accepted. A cap of zero disables the limit but still
    /// counts.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited { PayerDailyCap }` when the payer has already
    /// reached its accepted payments for the UTC day, or a store error.
    pub async fn consume_payer(
        &self,
        payer: &EvmAddress,
        now: DateTime<Utc>,
    ) -> Result<PayerUnit> {
        let limit = if self.payer_daily_cap == 0 {
            u64::MAX
        } else {
            self.payer_daily_cap
        };
        let day = now.date_naive();
        match self.usage.try_consume(payer, day, limit).await? {
            Some(used) => {
                debug!("Payer {} used {}/{} today", payer, used, self.payer_daily_cap);
                Ok(PayerUnit {
                    payer: *payer,
                    day,
                    used,
                })
            }
            None => {
                warn!("Rejected payer {}: daily cap reached", payer);
                Err(Error::RateLimited {
                    reason: RateLimitReason::PayerDailyCap,
                    retry_after: until_next_utc_day(now),
                })
            }
        }
    }

    /// Return a unit taken by [`RateLimiter::consume_payer`].
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn release_payer(&self, unit: PayerUnit) -> Result<()> {
        debug!("Releasing daily quota unit of payer {}", unit.payer);
        self.usage.release(&unit.payer, unit.day).await
    }

    /// Drop idle IP buckets.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.burst.sweep(now.timestamp_millis());
    }

    /// The shared running-job set.
    #[must_use]
    pub fn running(&self) -> &RunningJobSet {
        &self.running
    }
}

/// Time left until the next UTC midnight.
#[must_use]
pub fn until_next_utc_day(now: DateTime<Utc>) -> Duration {
    let next_midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    next_midnight
        .and_then(|m| (m - now).to_std().ok())
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_secs(1))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryUsageStore;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn limiter(config: &LimitsConfig) -> (RateLimiter, Arc<MemoryUsageStore>) {
        let usage = Arc::new(MemoryUsageStore::new());
        let running = RunningJobSet::new(config.global_concurrency_cap);
        let limiter = RateLimiter::new(config, running, usage.clone());
        (limiter, usage)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RateLimitReason::IpBurst.code(), "ip_burst_limit");
        assert_eq!(
            RateLimitReason::PayerDailyCap.code(),
            "from_address_daily_cap"
        );
        assert_eq!(
            RateLimitReason::GlobalConcurrency.code(),
            "global_concurrency_cap"
        );
    }

    #[test]
    fn test_until_next_utc_day() {
        assert_eq!(until_next_utc_day(noon()), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_ip_burst_maps_to_rate_limited() {
        let config = LimitsConfig {
            ip_burst_limit: 1,
            ..LimitsConfig::default()
        };
        let (limiter, _) = limiter(&config);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        limiter.check_ip(ip, noon()).expect("first");
        let err = limiter.check_ip(ip, noon()).expect_err("second");
        assert_eq!(err.code(), "ip_burst_limit");
    }

    #[test]
    fn test_global_cap_maps_to_rate_limited() {
        let config = LimitsConfig {
            global_concurrency_cap: 1,
            concurrency_retry_after_secs: 7,
            ..LimitsConfig::default()
        };
        let (limiter, _) = limiter(&config);
        let _slot = limiter.acquire_slot("a").expect("slot");
        match limiter.acquire_slot("b") {
            Err(Error::RateLimited {
                reason: RateLimitReason::GlobalConcurrency,
                retry_after,
            }) => assert_eq!(retry_after, Duration::from_secs(7)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payer_cap_per_payer() {
        let config = LimitsConfig {
            payer_daily_cap: 2,
            ..LimitsConfig::default()
        };
        let (limiter, _) = limiter(&config);
        let alice = EvmAddress::new([1u8; 20]);
        let bob = EvmAddress::new([2u8; 20]);

        for expected in 1..=2 {
            let unit = limiter.consume_payer(&alice, noon()).await.expect("under cap");
            assert_eq!(unit.used(), expected);
        }
        let err = limiter
            .consume_payer(&alice, noon())
            .await
            .expect_err("capped");
        assert_eq!(err.code(), "from_address_daily_cap");

        limiter.consume_payer(&bob, noon()).await.expect("bob unaffected");

        let tomorrow = noon() + chrono::Duration::days(1);
        limiter
            .consume_payer(&alice, tomorrow)
            .await
            .expect("new UTC day");
    }

    #[tokio::test]
    async fn test_released_unit_is_available_again() {
        let config = LimitsConfig {
            payer_daily_cap: 1,
            ..LimitsConfig::default()
        };
        let (limiter, usage) = limiter(&config);
        let alice = EvmAddress::new([1u8; 20]);

        let unit = limiter.consume_payer(&alice, noon()).await.expect("first");
        limiter
            .consume_payer(&alice, noon())
            .await
            .expect_err("capped while held");

        limiter.release_payer(unit).await.expect("release");
        assert_eq!(
            usage.get(&alice, noon().date_naive()).await.expect("get"),
            0
        );
        limiter.consume_payer(&alice, noon()).await.expect("freed");
    }

    #[tokio::test]
    async fn test_zero_cap_counts_without_limiting() {
        let config = LimitsConfig {
            payer_daily_cap: 0,
            ..LimitsConfig::default()
        };
        let (limiter, _) = limiter(&config);
        let alice = EvmAddress::new([1u8; 20]);
        for _ in 0..5 {
            limiter.consume_payer(&alice, noon()).await.expect("unlimited");
        }
        let unit = limiter.consume_payer(&alice, noon()).await.expect("sixth");
        assert_eq!(unit.used(), 6);
    }
}
