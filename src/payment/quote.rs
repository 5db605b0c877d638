//! Quote pricing.
//!
//! Prices are always derived on the server from the request parameters;
//! callers never supply an amount. Amounts are carried internally in the
//! asset's smallest unit and rendered as trimmed decimal strings.

use crate::allocation::AllocationInputs;
use crate::config::PricingConfig;
use crate::error::{Error, Result};
use tracing::debug;

/// Largest supported decimals value (`10^19` overflows `u64`).
const MAX_DECIMALS: u32 = 18;

/// A server-derived price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Price {
    /// Amount in the asset's smallest unit.
    pub units: u64,
    /// Amount in display units, e.g. `"19"` or `"19.5"`.
    pub display: String,
}

impl Price {
    /// Whether nothing has to be paid.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.units == 0
    }
}

/// Pure mapping from request parameters to a charge.
#[derive(Debug, Clone)]
pub struct QuotePricer {
    asset: String,
    decimals: u32,
    base_units: u64,
    report_add_on_units: u64,
}

impl QuotePricer {
    /// Build a pricer from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a configured price is not a valid
    /// non-negative decimal with at most `decimals` fractional digits.
    pub fn new(config: &PricingConfig) -> Result<Self> {
        if config.decimals > MAX_DECIMALS {
            return Err(Error::Config(format!(
                "pricing.decimals must be at most {MAX_DECIMALS}, got {}",
                config.decimals
            )));
        }
        let base_units = parse_amount(&config.base_price, config.decimals)
            .map_err(|e| Error::Config(format!("pricing.base_price: {e}")))?;
        let report_add_on_units = parse_amount(&config.report_add_on, config.decimals)
            .map_err(|e| Error::Config(format!("pricing.report_add_on: {e}")))?;
        base_units
            .checked_add(report_add_on_units)
            .ok_or_else(|| Error::Config("pricing total overflows".to_string()))?;

        Ok(Self {
            asset: config.asset.clone(),
            decimals: config.decimals,
            base_units,
            report_add_on_units,
        })
    }

    /// Price for the given parameters: base price plus the report add-on
    /// when a report is requested.
    #[must_use]
    pub fn price(&self, inputs: &AllocationInputs) -> Price {
        let add_on = if inputs.with_report {
            self.report_add_on_units
        } else {
            0
        };
        // Overflow is ruled out in `new`.
        let units = self.base_units.saturating_add(add_on);
        let shown = format_amount(units, self.decimals);
        debug!(
            "Priced {:?}/{:?} report={} at {} {}",
            inputs.risk_tolerance, inputs.timeframe, inputs.with_report, shown, self.asset
        );
        Price {
            units,
            display: shown,
        }
    }

    /// Asset symbol.
    #[must_use]
    pub fn asset(&self) -> &str {
        &self.asset
    }

    /// Asset decimals.
    #[must_use]
    pub fn decimals(&self) -> u32 {
        self.decimals
    }
}

/// Parse a decimal string into smallest units.
///
/// # Errors
///
/// Returns a validation error for signs, exponents, empty strings, too many
/// fractional digits, or values that overflow `u64`.
pub fn parse_amount(value: &str, decimals: u32) -> Result<u64> {
    let value = value.trim();
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));

    if whole.is_empty() && frac.is_empty() {
        return Err(Error::Validation("amount is empty".to_string()));
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!("amount is not a decimal: {value}")));
    }
    if frac.len() > decimals as usize {
        return Err(Error::Validation(format!(
            "amount {value} has more than {decimals} fractional digits"
        )));
    }

    let scale = 10u64
        .checked_pow(decimals)
        .ok_or_else(|| Error::Validation(format!("decimals {decimals} too large")))?;
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u64>()
            .map_err(|e| Error::Validation(format!("amount {value}: {e}")))?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<width$}", width = decimals as usize);
        padded
            .parse::<u64>()
            .map_err(|e| Error::Validation(format!("amount {value}: {e}")))?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| Error::Validation(format!("amount {value} overflows")))
}

/// Render smallest units as a decimal string without trailing zeros.
#[must_use]
pub fn format_amount(units: u64, decimals: u32) -> String {
    let scale = 10u64.pow(decimals.min(MAX_DECIMALS));
    let whole = units / scale;
    let frac = units % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0>width$}", width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
