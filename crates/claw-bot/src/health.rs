//! Data health monitor.
//!
//! Turns the cycle's market snapshot into an execution mode. It never fails:
//! degraded input demotes the mode instead of erroring.
//!
//! | finding | demotes to |
//! |---|---|
//! | fetch failed, required symbol missing, non-positive mid, empty book, every required symbol stale | close_only |
//! | some required symbols stale, short candle history, price jump, equity drift | reduced |
//!
//! Score = 100 − 20 per close_only finding − 5 per reduced finding.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use claw_common::{DailyPnl, DataHealthStatus, ExecutionMode, HealthIssue};

use crate::market::MarketSnapshot;

/// Thresholds for the health check.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Symbols that must be present in every snapshot.
    pub required_symbols: Vec<String>,
    /// Maximum age of a symbol's data.
    pub max_staleness: Duration,
    /// Minimum candle count per timeframe.
    pub min_candles: BTreeMap<String, usize>,
    /// Mid price move vs previous snapshot that counts as a jump.
    pub max_price_jump_fraction: Decimal,
    /// Live vs persisted equity difference that counts as drift.
    pub max_equity_drift_fraction: Decimal,
    /// Cooldown between alerts for the same degraded mode.
    pub alert_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            required_symbols: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            max_staleness: Duration::seconds(300),
            min_candles: BTreeMap::from([
                ("15m".to_string(), 48),
                ("1h".to_string(), 24),
                ("4h".to_string(), 20),
            ]),
            max_price_jump_fraction: Decimal::new(10, 2), // 10%
            max_equity_drift_fraction: Decimal::new(20, 2), // 20%
            alert_cooldown: Duration::seconds(1800),
        }
    }
}

/// Everything the check looks at for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct HealthInput<'a> {
    /// `None` when the fetch failed.
    pub snapshot: Option<&'a MarketSnapshot>,
    pub previous: Option<&'a MarketSnapshot>,
    /// Daily P&L as persisted before this cycle.
    pub persisted_pnl: Option<&'a DailyPnl>,
    /// Equity derived from the exchange this cycle.
    pub live_equity: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Produce this cycle's verdict.
    pub fn check(&self, input: &HealthInput<'_>, now: DateTime<Utc>) -> DataHealthStatus {
        let mut issues = Vec::new();

        match input.snapshot {
            None => issues.push(HealthIssue::new(
                ExecutionMode::CloseOnly,
                "market data fetch failed",
            )),
            Some(snapshot) => self.check_snapshot(snapshot, input.previous, now, &mut issues),
        }

        if let (Some(pnl), Some(live)) = (input.persisted_pnl, input.live_equity)
            && pnl.equity > Decimal::ZERO
        {
            let drift = (live - pnl.equity).abs() / pnl.equity;
            if drift > self.config.max_equity_drift_fraction {
                issues.push(HealthIssue::new(
                    ExecutionMode::Reduced,
                    format!(
                        "equity drift {} vs persisted {} ({}%)",
                        live,
                        pnl.equity,
                        (drift * Decimal::ONE_HUNDRED).round_dp(1)
                    ),
                ));
            }
        }

        let status = verdict(issues, now);
        if status.is_healthy() {
            debug!(score = status.score, "Data health OK");
        } else {
            warn!(
                mode = %status.execution_mode,
                score = status.score,
                issues = status.issues.len(),
                "Data health degraded"
            );
        }
        status
    }

    fn check_snapshot(
        &self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
        issues: &mut Vec<HealthIssue>,
    ) {
        let required = &self.config.required_symbols;
        let mut stale = Vec::new();

        for symbol in required {
            let Some(data) = snapshot.symbols.get(symbol) else {
                issues.push(HealthIssue::new(
                    ExecutionMode::CloseOnly,
                    format!("{symbol}: missing from snapshot"),
                ));
                continue;
            };

            if data.mid_price <= Decimal::ZERO {
                issues.push(HealthIssue::new(
                    ExecutionMode::CloseOnly,
                    format!("{symbol}: non-positive mid price {}", data.mid_price),
                ));
            }
            if data.order_book.is_empty() {
                issues.push(HealthIssue::new(
                    ExecutionMode::CloseOnly,
                    format!("{symbol}: empty order book"),
                ));
            }

            let age = now - data.updated_at;
            if age > self.config.max_staleness {
                stale.push((symbol.as_str(), age.num_seconds()));
            }

            for (timeframe, min) in &self.config.min_candles {
                let have = data.candles.get(timeframe).map_or(0, Vec::len);
                if have < *min {
                    issues.push(HealthIssue::new(
                        ExecutionMode::Reduced,
                        format!("{symbol}: {timeframe} candles {have} < {min}"),
                    ));
                }
            }

            if let Some(prev) = previous.and_then(|p| p.mid_price(symbol))
                && prev > Decimal::ZERO
                && data.mid_price > Decimal::ZERO
            {
                let jump = (data.mid_price - prev).abs() / prev;
                if jump > self.config.max_price_jump_fraction {
                    issues.push(HealthIssue::new(
                        ExecutionMode::Reduced,
                        format!("{symbol}: price jump {} -> {}", prev, data.mid_price),
                    ));
                }
            }
        }

        if !required.is_empty() && stale.len() == required.len() {
            issues.push(HealthIssue::new(
                ExecutionMode::CloseOnly,
                "all required symbols stale",
            ));
        } else {
            for (symbol, secs) in stale {
                issues.push(HealthIssue::new(
                    ExecutionMode::Reduced,
                    format!("{symbol}: data {secs}s old"),
                ));
            }
        }
    }
}

/// Fold findings into a mode and score.
fn verdict(issues: Vec<HealthIssue>, now: DateTime<Utc>) -> DataHealthStatus {
    let execution_mode = issues
        .iter()
        .map(|i| i.demotes_to)
        .max()
        .unwrap_or(ExecutionMode::All);

    let penalty: u32 = issues
        .iter()
        .map(|i| match i.demotes_to {
            ExecutionMode::CloseOnly => 20,
            ExecutionMode::Reduced => 5,
            ExecutionMode::All => 0,
        })
        .sum();
    let score = 100u32.saturating_sub(penalty) as u8;

    DataHealthStatus {
        execution_mode,
        issues,
        score,
        checked_at: now,
    }
}
