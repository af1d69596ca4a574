//! Equity and exposure arithmetic.
//!
//! `compute_equity` is the only place equity is derived. Risk checks, sizing,
//! daily P&L and monitoring all go through it.

use rust_decimal::Decimal;

use claw_common::Position;

/// Equity = collateral + Σ unrealized P&L.
pub fn compute_equity(collateral: Decimal, positions: &[Position]) -> Decimal {
    collateral + total_unrealized(positions)
}

/// Σ unrealized P&L over all positions.
pub fn total_unrealized(positions: &[Position]) -> Decimal {
    positions.iter().map(|p| p.unrealized_pnl).sum()
}

/// Σ margin committed to positions in `symbol`.
pub fn symbol_margin(positions: &[Position], symbol: &str) -> Decimal {
    positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .map(Position::margin)
        .sum()
}

/// Σ margin committed across all positions.
pub fn total_margin(positions: &[Position]) -> Decimal {
    positions.iter().map(Position::margin).sum()
}

/// `value / equity`, or `None` when equity is not positive.
#[inline]
pub fn fraction_of(value: Decimal, equity: Decimal) -> Option<Decimal> {
    if equity <= Decimal::ZERO {
        None
    } else {
        Some(value / equity)
    }
}
