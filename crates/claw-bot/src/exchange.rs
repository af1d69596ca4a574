//! Exchange boundary.
//!
//! The order-placement API of a real venue lives outside this crate; it is
//! reached through the `Exchange` trait. `PaperExchange` is the in-process
//! implementation used for paper trading and tests. It fills at the last
//! mark (or the request's reference price) and can persist its account in
//! the state store so separate `cycle` invocations share one book.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use claw_common::{Position, Side};

use crate::market::MarketSnapshot;
use crate::store::{records, StateStore, StoreError};

/// Errors from the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("No open position for {0}")]
    NoPosition(String),

    #[error("Exchange call timed out")]
    Timeout,
}

/// Request to open (or add to) a position.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    /// Size in coin units.
    pub size: Decimal,
    pub leverage: Decimal,
    /// Price used for sizing; paper fills use it when no mark exists.
    pub reference_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// A confirmed fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    /// Set on closes.
    pub realized_pnl: Option<Decimal>,
    pub filled_at: DateTime<Utc>,
}

/// Venue interface used by observation, execution and monitoring.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Account collateral (equity excluding unrealized P&L).
    async fn collateral(&self) -> Result<Decimal, ExchangeError>;

    /// Open positions with current unrealized P&L.
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn open_position(&self, request: &OpenRequest) -> Result<Fill, ExchangeError>;

    /// Fully close the position in `symbol`.
    async fn close_position(&self, symbol: &str) -> Result<Fill, ExchangeError>;

    /// Refresh marks from a snapshot. Live venues mark themselves.
    async fn update_marks(&self, _snapshot: &MarketSnapshot) {}
}

// ============================================================================
// PaperExchange
// ============================================================================

/// Paper account state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    pub collateral: Decimal,
    pub positions: Vec<Position>,
    pub marks: BTreeMap<String, Decimal>,
}

impl PaperAccount {
    pub fn new(collateral: Decimal) -> Self {
        Self {
            collateral,
            ..Self::default()
        }
    }

    fn remark(&mut self) {
        for p in &mut self.positions {
            if let Some(mark) = self.marks.get(&p.symbol) {
                p.unrealized_pnl = pnl(p.side, p.entry_price, *mark, p.size);
            }
        }
    }
}

fn pnl(side: Side, entry: Decimal, exit: Decimal, size: Decimal) -> Decimal {
    match side {
        Side::Long => (exit - entry) * size,
        Side::Short => (entry - exit) * size,
    }
}

/// In-process simulated venue.
pub struct PaperExchange {
    account: Mutex<PaperAccount>,
    fee_rate: Decimal,
    store: Option<StateStore>,
}

impl PaperExchange {
    /// Ephemeral paper account.
    pub fn new(collateral: Decimal, fee_rate: Decimal) -> Self {
        Self {
            account: Mutex::new(PaperAccount::new(collateral)),
            fee_rate,
            store: None,
        }
    }

    /// Paper account persisted in `store`, created with `initial_collateral`
    /// on first use.
    pub fn persistent(
        store: StateStore,
        initial_collateral: Decimal,
        fee_rate: Decimal,
    ) -> Result<Self, StoreError> {
        let account = store
            .files()
            .read::<PaperAccount>(records::PAPER_ACCOUNT)?
            .map(|v| v.data)
            .unwrap_or_else(|| PaperAccount::new(initial_collateral));
        Ok(Self {
            account: Mutex::new(account),
            fee_rate,
            store: Some(store),
        })
    }

    /// Snapshot of the account.
    pub fn account(&self) -> PaperAccount {
        self.account.lock().clone()
    }

    /// Set a mark price directly.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        let mut account = self.account.lock();
        account.marks.insert(symbol.to_string(), price);
        account.remark();
        self.persist(&account);
    }

    fn persist(&self, account: &PaperAccount) {
        if let Some(store) = &self.store
            && let Err(e) = store.files().write(records::PAPER_ACCOUNT, account)
        {
            warn!(error = %e, "Failed to persist paper account");
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn collateral(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.account.lock().collateral)
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.account.lock().positions.clone())
    }

    async fn open_position(&self, request: &OpenRequest) -> Result<Fill, ExchangeError> {
        if request.size <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "size must be positive, got {}",
                request.size
            )));
        }

        let mut account = self.account.lock();
        let price = account
            .marks
            .get(&request.symbol)
            .copied()
            .unwrap_or(request.reference_price);
        if price <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "no valid price for {}",
                request.symbol
            )));
        }

        let fee = request.size * price * self.fee_rate;
        let now = Utc::now();

        match account
            .positions
            .iter_mut()
            .find(|p| p.symbol == request.symbol)
        {
            Some(existing) if existing.side != request.side => {
                return Err(ExchangeError::Rejected(format!(
                    "{} already open {}",
                    request.symbol, existing.side
                )));
            }
            Some(existing) => {
                let total = existing.size + request.size;
                existing.entry_price =
                    (existing.entry_price * existing.size + price * request.size) / total;
                existing.size = total;
                existing.leverage = request.leverage;
            }
            None => account.positions.push(Position {
                symbol: request.symbol.clone(),
                side: request.side,
                size: request.size,
                entry_price: price,
                leverage: request.leverage,
                opened_at: Some(now),
                unrealized_pnl: Decimal::ZERO,
            }),
        }
        account.collateral -= fee;
        account.remark();
        self.persist(&account);

        info!(
            symbol = %request.symbol,
            side = %request.side,
            size = %request.size,
            %price,
            "Paper fill (open)"
        );
        Ok(Fill {
            symbol: request.symbol.clone(),
            side: request.side,
            size: request.size,
            price,
            fee,
            realized_pnl: None,
            filled_at: now,
        })
    }

    async fn close_position(&self, symbol: &str) -> Result<Fill, ExchangeError> {
        let mut account = self.account.lock();
        let idx = account
            .positions
            .iter()
            .position(|p| p.symbol == symbol)
            .ok_or_else(|| ExchangeError::NoPosition(symbol.to_string()))?;
        let position = account.positions.remove(idx);
        let price = account
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(position.entry_price);

        let realized = pnl(position.side, position.entry_price, price, position.size);
        let fee = position.size * price * self.fee_rate;
        account.collateral += realized - fee;
        self.persist(&account);

        info!(symbol, %price, %realized, "Paper fill (close)");
        Ok(Fill {
            symbol: symbol.to_string(),
            side: position.side,
            size: position.size,
            price,
            fee,
            realized_pnl: Some(realized),
            filled_at: Utc::now(),
        })
    }

    async fn update_marks(&self, snapshot: &MarketSnapshot) {
        let mut account = self.account.lock();
        for (symbol, data) in &snapshot.symbols {
            if data.mid_price > Decimal::ZERO {
                account.marks.insert(symbol.clone(), data.mid_price);
            }
        }
        account.remark();
        self.persist(&account);
        debug!(marks = account.marks.len(), "Paper marks updated");
    }
}
