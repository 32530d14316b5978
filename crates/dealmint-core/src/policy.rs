use chrono::Duration;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::LedgerError;

/// Largest amount a `NUMERIC(14, 2)` money column holds.
pub fn max_money() -> Decimal {
    Decimal::new(99_999_999_999_999, 2)
}

/// Rates are stored as `NUMERIC(6, 4)`.
pub const RATE_SCALE: u32 = 4;

/// Program-wide commission and payout constants. Loaded from the environment by the
/// platform crate; `Default` carries the published program terms.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramPolicy {
    pub attribution_window: Duration,
    pub holding_period: Duration,
    pub minimum_payout: Decimal,
    pub default_commission_rate: Decimal,
    pub flat_commission: Decimal,
}

impl Default for ProgramPolicy {
    fn default() -> Self {
        Self {
            attribution_window: Duration::days(30),
            holding_period: Duration::days(30),
            minimum_payout: Decimal::new(1000, 2),
            default_commission_rate: Decimal::new(5, 2),
            flat_commission: Decimal::new(100, 2),
        }
    }
}

impl ProgramPolicy {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.attribution_window <= Duration::zero() {
            return Err(LedgerError::InvalidRequest(
                "attribution window must be positive".to_string(),
            ));
        }
        if self.holding_period < Duration::zero() {
            return Err(LedgerError::InvalidRequest(
                "holding period cannot be negative".to_string(),
            ));
        }
        if self.minimum_payout <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(
                "minimum payout must be positive".to_string(),
            ));
        }
        validate_rate(self.default_commission_rate)?;
        if self.flat_commission < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(
                "flat commission cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Commission for a conversion at `rate`. Without an order value the flat amount
    /// applies regardless of rate.
    pub fn commission_for(&self, order_value: Option<Decimal>, rate: Decimal) -> Decimal {
        match order_value {
            Some(value) => round_money(value * rate),
            None => round_money(self.flat_commission),
        }
    }
}

pub fn validate_rate(rate: Decimal) -> Result<(), LedgerError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(LedgerError::InvalidAmount(format!(
            "commission rate must be between 0 and 1, got {rate}"
        )));
    }
    if rate.normalize().scale() > RATE_SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "commission rate allows at most {RATE_SCALE} decimals, got {rate}"
        )));
    }
    Ok(())
}

/// Accepts a non-negative money amount with at most two decimals that fits a money column.
pub fn validate_money(amount: Decimal, field: &str) -> Result<(), LedgerError> {
    if amount < Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!("{field} cannot be negative")));
    }
    if amount.normalize().scale() > 2 {
        return Err(LedgerError::InvalidAmount(format!(
            "{field} allows at most two decimals, got {amount}"
        )));
    }
    if amount > max_money() {
        return Err(LedgerError::InvalidAmount(format!(
            "{field} exceeds {}",
            max_money()
        )));
    }
    Ok(())
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
