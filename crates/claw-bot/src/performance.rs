//! Trade performance over the recorded trade history.
//!
//! Only closed trades (those with a realized P&L) count. A trade with P&L
//! above zero is a win; everything else, breakeven included, is a loss.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

use claw_common::TradeRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceStats {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    /// Sum of losing P&L as a positive number.
    pub gross_loss: Decimal,
}

impl PerformanceStats {
    pub fn from_trades<'a>(trades: impl IntoIterator<Item = &'a TradeRecord>) -> Self {
        let mut stats = Self::default();
        for pnl in trades.into_iter().filter_map(|t| t.pnl) {
            stats.add(pnl);
        }
        stats
    }

    /// Per-symbol statistics, keyed by symbol.
    pub fn by_symbol(trades: &[TradeRecord]) -> BTreeMap<String, PerformanceStats> {
        let mut out: BTreeMap<String, PerformanceStats> = BTreeMap::new();
        for trade in trades {
            if let Some(pnl) = trade.pnl {
                out.entry(trade.symbol.clone()).or_default().add(pnl);
            }
        }
        out
    }

    fn add(&mut self, pnl: Decimal) {
        self.trades += 1;
        self.total_pnl += pnl;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += pnl;
        } else {
            self.gross_loss -= pnl;
        }
    }

    pub fn losses(&self) -> usize {
        self.trades - self.wins
    }

    /// Wins / trades, as a fraction.
    pub fn win_rate(&self) -> Option<Decimal> {
        (self.trades > 0).then(|| Decimal::from(self.wins) / Decimal::from(self.trades))
    }

    pub fn avg_pnl(&self) -> Option<Decimal> {
        (self.trades > 0).then(|| self.total_pnl / Decimal::from(self.trades))
    }

    /// Gross profit / gross loss. `None` without losses.
    pub fn profit_factor(&self) -> Option<Decimal> {
        (self.gross_loss > Decimal::ZERO).then(|| self.gross_profit / self.gross_loss)
    }
}

impl std::fmt::Display for PerformanceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.trades == 0 {
            return write!(f, "no closed trades");
        }
        write!(f, "{} trades, {} wins", self.trades, self.wins)?;
        if let Some(rate) = self.win_rate() {
            write!(f, ", win rate {}%", (rate * Decimal::ONE_HUNDRED).round_dp(1))?;
        }
        if let Some(avg) = self.avg_pnl() {
            write!(f, ", avg P&L {}", avg.round_dp(4))?;
        }
        match self.profit_factor() {
            Some(pf) => write!(f, ", PF {}", pf.round_dp(2)),
            None => write!(f, ", PF n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use claw_common::Side;
    use rust_decimal_macros::dec;

    fn trade(symbol: &str, pnl: Option<Decimal>) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            side: Side::Long,
            size: dec!(1),
            entry_price: dec!(100),
            exit_price: pnl.map(|p| dec!(100) + p),
            pnl,
            leverage: dec!(2),
            opened_at: None,
            closed_at: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_history() {
        let stats = PerformanceStats::from_trades(&[]);
        assert_eq!(stats.trades, 0);
        assert_eq!(stats.win_rate(), None);
        assert_eq!(stats.avg_pnl(), None);
        assert_eq!(stats.profit_factor(), None);
        assert_eq!(stats.to_string(), "no closed trades");
    }

    #[test]
    fn test_closed_trades_only() {
        let trades = vec![
            trade("BTC", Some(dec!(30))),
            trade("BTC", None),
            trade("ETH", Some(dec!(-10))),
            trade("ETH", Some(dec!(0))),
            trade("SOL", Some(dec!(20))),
        ];
        let stats = PerformanceStats::from_trades(&trades);

        assert_eq!(stats.trades, 4);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses(), 2);
        assert_eq!(stats.total_pnl, dec!(40));
        assert_eq!(stats.win_rate(), Some(dec!(0.5)));
        assert_eq!(stats.avg_pnl(), Some(dec!(10)));
        assert_eq!(stats.profit_factor(), Some(dec!(5)));
        let text = stats.to_string();
        assert!(text.starts_with("4 trades, 2 wins, win rate 50"), "{text}");
        assert!(text.ends_with("PF 5"), "{text}");
    }

    #[test]
    fn test_by_symbol() {
        let trades = vec![
            trade("BTC", Some(dec!(30))),
            trade("ETH", Some(dec!(-10))),
            trade("BTC", Some(dec!(-5))),
            trade("SOL", None),
        ];
        let per = PerformanceStats::by_symbol(&trades);

        assert_eq!(per.len(), 2);
        assert_eq!(per["BTC"].trades, 2);
        assert_eq!(per["BTC"].profit_factor(), Some(dec!(6)));
        assert_eq!(per["ETH"].win_rate(), Some(dec!(0)));
        assert!(!per.contains_key("SOL"));
    }
}
