//! Decimal arithmetic utilities for ledger calculations.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round to `decimals` places, halves away from zero.
pub fn round_half_up(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Clamp a value at zero.
pub fn non_negative(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}

/// Apply a fractional tolerance on top of a limit (`limit * (1 + tolerance)`).
pub fn with_tolerance(limit: Decimal, tolerance: Decimal) -> Decimal {
    limit * (Decimal::ONE + tolerance)
}
