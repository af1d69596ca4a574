//! Execution of approved signals.
//!
//! Every order checks the kill switch first; once the switch reads active the
//! remaining orders are refused. [`TradeExecutor::flatten`] is the one path
//! past the gate and it can only close. Store mutations happen only after the
//! exchange confirms a fill.
//!
//! ## Sizing
//!
//! - margin = allocation × equity
//! - notional = margin × leverage
//! - size = notional / price

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use claw_common::{Action, Position, Signal, TradeRecord};

use crate::exchange::{Exchange, Fill, OpenRequest};
use crate::market::MarketSnapshot;
use crate::risk::{ApprovedSignal, KillSwitch};
use crate::store::StateStore;

/// Decimal places kept for order sizes.
const SIZE_DP: u32 = 8;

/// What happened to one approved signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Filled(Fill),
    /// Not sent: kill switch active.
    Refused,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub symbol: String,
    pub action: Action,
    pub status: ExecutionStatus,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        matches!(self.status, ExecutionStatus::Filled(_))
    }
}

/// Compute the order size for an entry. `None` when it cannot be sized.
pub fn size_order(allocation: Decimal, equity: Decimal, leverage: Decimal, price: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO || equity <= Decimal::ZERO {
        return None;
    }
    let margin = allocation * equity;
    let notional = margin * leverage.max(Decimal::ONE);
    let size = (notional / price).round_dp(SIZE_DP);
    (size > Decimal::ZERO).then_some(size)
}

pub struct TradeExecutor {
    exchange: Arc<dyn Exchange>,
    store: StateStore,
    kill_switch: KillSwitch,
}

impl TradeExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, store: StateStore, kill_switch: KillSwitch) -> Self {
        Self {
            exchange,
            store,
            kill_switch,
        }
    }

    /// Execute approved signals in order.
    pub async fn execute(
        &self,
        approved: &[ApprovedSignal],
        equity: Decimal,
        snapshot: Option<&MarketSnapshot>,
    ) -> Vec<ExecutionReport> {
        let mut reports = Vec::with_capacity(approved.len());
        for item in approved {
            let signal = &item.signal;
            let status = if self.kill_switch.is_active() {
                warn!(symbol = %signal.symbol, "Kill switch active, order refused");
                ExecutionStatus::Refused
            } else {
                let result = match signal.action {
                    Action::Close => self.close(signal).await,
                    Action::Long | Action::Short => {
                        self.open(signal, item.allocation, equity, snapshot).await
                    }
                    Action::Hold => Err("hold is not executable".to_string()),
                };
                match result {
                    Ok(fill) => ExecutionStatus::Filled(fill),
                    Err(e) => {
                        warn!(symbol = %signal.symbol, action = %signal.action, error = %e, "Execution failed");
                        ExecutionStatus::Failed(e)
                    }
                }
            };
            reports.push(ExecutionReport {
                symbol: signal.symbol.clone(),
                action: signal.action,
                status,
            });
        }
        reports
    }

    /// Emergency close of every position, kill switch or not.
    pub async fn flatten(&self, positions: &[Position], reason: &str) -> Vec<ExecutionReport> {
        let mut reports = Vec::with_capacity(positions.len());
        for position in positions {
            warn!(symbol = %position.symbol, side = %position.side, reason, "Emergency close");
            let signal = Signal::close(position.symbol.clone(), reason);
            let status = match self.close(&signal).await {
                Ok(fill) => ExecutionStatus::Filled(fill),
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "Emergency close failed");
                    ExecutionStatus::Failed(e)
                }
            };
            reports.push(ExecutionReport {
                symbol: position.symbol.clone(),
                action: Action::Close,
                status,
            });
        }
        reports
    }

    async fn open(
        &self,
        signal: &Signal,
        allocation: Decimal,
        equity: Decimal,
        snapshot: Option<&MarketSnapshot>,
    ) -> Result<Fill, String> {
        let side = signal
            .action
            .side()
            .ok_or_else(|| format!("{} is not an entry", signal.action))?;
        let price = signal
            .entry_price
            .or_else(|| snapshot.and_then(|s| s.mid_price(&signal.symbol)))
            .ok_or_else(|| format!("no price for {}", signal.symbol))?;
        let size = size_order(allocation, equity, signal.leverage, price)
            .ok_or_else(|| format!("cannot size {} at {}", signal.symbol, price))?;

        let request = OpenRequest {
            symbol: signal.symbol.clone(),
            side,
            size,
            leverage: signal.leverage,
            reference_price: price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        };
        let fill = self
            .exchange
            .open_position(&request)
            .await
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        let existing = self
            .store
            .positions()
            .map_err(|e| e.to_string())?
            .into_iter()
            .find(|p| p.symbol == signal.symbol);
        let position = match existing {
            Some(p) if p.side == fill.side => {
                let total = p.size + fill.size;
                Position {
                    entry_price: (p.entry_price * p.size + fill.price * fill.size) / total,
                    size: total,
                    leverage: signal.leverage,
                    ..p
                }
            }
            _ => Position {
                symbol: fill.symbol.clone(),
                side: fill.side,
                size: fill.size,
                entry_price: fill.price,
                leverage: signal.leverage,
                opened_at: Some(fill.filled_at),
                unrealized_pnl: Decimal::ZERO,
            },
        };
        if let Err(e) = self.store.upsert_position(position) {
            error!(symbol = %fill.symbol, error = %e, "Fill confirmed but position not stored, next observation reconciles");
        }
        if let Err(e) = self.store.append_trade(TradeRecord {
            symbol: fill.symbol.clone(),
            side: fill.side,
            size: fill.size,
            entry_price: fill.price,
            exit_price: None,
            pnl: None,
            leverage: signal.leverage,
            opened_at: Some(fill.filled_at),
            closed_at: None,
            recorded_at: now,
        }) {
            warn!(error = %e, "Failed to append trade record");
        }

        info!(
            symbol = %fill.symbol,
            side = %fill.side,
            size = %fill.size,
            price = %fill.price,
            "Position opened"
        );
        Ok(fill)
    }

    async fn close(&self, signal: &Signal) -> Result<Fill, String> {
        let fill = self
            .exchange
            .close_position(&signal.symbol)
            .await
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        let removed = match self.store.remove_position(&signal.symbol) {
            Ok(p) => p,
            Err(e) => {
                error!(symbol = %signal.symbol, error = %e, "Close confirmed but position not removed");
                None
            }
        };
        let realized = fill.realized_pnl.unwrap_or(Decimal::ZERO) - fill.fee;

        if let Err(e) = self.store.append_trade(TradeRecord {
            symbol: fill.symbol.clone(),
            side: fill.side,
            size: fill.size,
            entry_price: removed.as_ref().map_or(fill.price, |p| p.entry_price),
            exit_price: Some(fill.price),
            pnl: Some(realized),
            leverage: removed.as_ref().map_or(Decimal::ONE, |p| p.leverage),
            opened_at: removed.as_ref().and_then(|p| p.opened_at),
            closed_at: Some(fill.filled_at),
            recorded_at: now,
        }) {
            warn!(error = %e, "Failed to append trade record");
        }

        let equity_hint = self
            .store
            .daily_pnl()
            .ok()
            .flatten()
            .map_or(Decimal::ZERO, |p| p.equity);
        if let Err(e) = self
            .store
            .add_realized_pnl(now.date_naive(), realized, equity_hint)
        {
            warn!(error = %e, "Failed to record realized P&L");
        }

        info!(symbol = %fill.symbol, price = %fill.price, pnl = %realized, "Position closed");
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_size_order() {
        // 10% of 10k = 1000 margin, 3x = 3000 notional, at 100k = 0.03
        assert_eq!(
            size_order(dec!(0.10), dec!(10000), dec!(3), dec!(100000)),
            Some(dec!(0.03))
        );
        assert_eq!(size_order(dec!(0.10), dec!(10000), dec!(3), dec!(0)), None);
        assert_eq!(size_order(dec!(0.10), dec!(0), dec!(3), dec!(100)), None);
        assert_eq!(
            size_order(dec!(0.000000001), dec!(1), dec!(1), dec!(1000000)),
            None
        );
    }
}
