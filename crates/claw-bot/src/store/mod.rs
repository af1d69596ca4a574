//! Atomic state store shared by every process of the loop.
//!
//! `StateStore` is a typed facade over [`FileStore`]: one method per record
//! the cycle, executor, guardrail and daemon touch. Each method is a single
//! locked read or read-modify-write on one record. There is no cross-record
//! transaction; callers re-derive anything computed from several records
//! (equity in particular is never read back as authority).

pub mod file;

pub use file::{FileStore, StoreError, Versioned};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use claw_common::{
    DailyPnl, DataHealthStatus, ImprovementItem, ImprovementStatus, OodaLogEntry, Position,
    ResearchItem, TradeRecord, TransitionError,
};

use crate::market::MarketSnapshot;

/// Record names on disk.
pub mod records {
    pub const POSITIONS: &str = "positions";
    pub const TRADE_HISTORY: &str = "trade_history";
    pub const DAILY_PNL: &str = "daily_pnl";
    pub const KILL_SWITCH: &str = "kill_switch";
    pub const DATA_HEALTH: &str = "data_health";
    pub const HEALTH_HISTORY: &str = "health_history";
    pub const OODA_LOG: &str = "ooda_log";
    pub const IMPROVEMENT_QUEUE: &str = "improvement_queue";
    pub const RESEARCH_QUEUE: &str = "research_queue";
    pub const ALERT_STATE: &str = "alert_state";
    pub const AGENT_SESSION: &str = "agent_session";
    pub const DAEMON_STATE: &str = "daemon_state";
    pub const MARKET_SNAPSHOT: &str = "market_snapshot";
    pub const PAPER_ACCOUNT: &str = "paper_account";
}

/// Trade history cap.
pub const MAX_TRADE_HISTORY: usize = 100;
/// OODA log cap.
pub const MAX_OODA_LOG: usize = 500;
/// Data health history cap.
pub const MAX_HEALTH_HISTORY: usize = 2500;
/// Research queue cap.
pub const MAX_RESEARCH_QUEUE: usize = 200;
/// Improvement queue cap. Only terminal items are evicted.
pub const MAX_IMPROVEMENT_QUEUE: usize = 500;

/// Append `item`, evicting the oldest entries beyond `cap`.
pub fn append_bounded<T>(list: &mut Vec<T>, item: T, cap: usize) {
    list.push(item);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

// ============================================================================
// Auxiliary records
// ============================================================================

/// Last send time per alert kind, for cooldowns that survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub last_sent: BTreeMap<String, DateTime<Utc>>,
}

/// Persisted reasoning-agent session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Daemon bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub cycles_run: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Errors from improvement queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Improvement item {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// StateStore
// ============================================================================

/// Typed access to every persisted record.
#[derive(Debug, Clone)]
pub struct StateStore {
    files: FileStore,
}

impl StateStore {
    /// Open the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            files: FileStore::open(dir)?,
        })
    }

    pub fn dir(&self) -> &Path {
        self.files.dir()
    }

    /// Raw access for records without a typed method.
    pub fn files(&self) -> &FileStore {
        &self.files
    }

    fn read_or_default<T>(&self, name: &str) -> Result<T, StoreError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        Ok(self.files.read::<T>(name)?.map(|v| v.data).unwrap_or_default())
    }

    // --- positions ----------------------------------------------------------

    pub fn positions(&self) -> Result<Vec<Position>, StoreError> {
        self.read_or_default(records::POSITIONS)
    }

    /// Replace all positions (reconciliation from the exchange).
    pub fn set_positions(&self, positions: &[Position]) -> Result<(), StoreError> {
        let positions: Vec<Position> = positions
            .iter()
            .filter(|p| p.size != Decimal::ZERO)
            .cloned()
            .collect();
        self.files.write(records::POSITIONS, &positions).map(|_| ())
    }

    /// Insert or replace the position for `position.symbol`.
    pub fn upsert_position(&self, position: Position) -> Result<(), StoreError> {
        self.files
            .update::<Vec<Position>, _, _>(records::POSITIONS, |list| {
                list.retain(|p| p.symbol != position.symbol);
                if position.size != Decimal::ZERO {
                    list.push(position);
                }
            })
    }

    /// Remove and return the position for `symbol`.
    pub fn remove_position(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        self.files
            .update::<Vec<Position>, _, _>(records::POSITIONS, |list| {
                let idx = list.iter().position(|p| p.symbol == symbol)?;
                Some(list.remove(idx))
            })
    }

    // --- trade history ------------------------------------------------------

    pub fn trade_history(&self) -> Result<Vec<TradeRecord>, StoreError> {
        self.read_or_default(records::TRADE_HISTORY)
    }

    pub fn append_trade(&self, trade: TradeRecord) -> Result<(), StoreError> {
        self.files
            .update::<Vec<TradeRecord>, _, _>(records::TRADE_HISTORY, |list| {
                append_bounded(list, trade, MAX_TRADE_HISTORY)
            })
    }

    // --- daily pnl ----------------------------------------------------------

    pub fn daily_pnl(&self) -> Result<Option<DailyPnl>, StoreError> {
        self.read_or_default(records::DAILY_PNL)
    }

    /// Record the current equity for `date`, starting a new day when the
    /// stored record belongs to an earlier date.
    pub fn record_equity(
        &self,
        date: NaiveDate,
        equity: Decimal,
        unrealized_pnl: Decimal,
    ) -> Result<DailyPnl, StoreError> {
        self.files
            .update::<Option<DailyPnl>, _, _>(records::DAILY_PNL, |slot| {
                let pnl = current_day(slot, date, equity);
                pnl.equity = equity;
                pnl.unrealized_pnl = unrealized_pnl;
                pnl.peak_equity = pnl.peak_equity.max(equity);
                pnl.clone()
            })
    }

    /// Add realized P&L for `date`.
    pub fn add_realized_pnl(
        &self,
        date: NaiveDate,
        realized: Decimal,
        equity: Decimal,
    ) -> Result<DailyPnl, StoreError> {
        self.files
            .update::<Option<DailyPnl>, _, _>(records::DAILY_PNL, |slot| {
                let pnl = current_day(slot, date, equity);
                pnl.realized_pnl += realized;
                pnl.clone()
            })
    }

    // --- data health --------------------------------------------------------

    pub fn data_health(&self) -> Result<Option<DataHealthStatus>, StoreError> {
        self.read_or_default(records::DATA_HEALTH)
    }

    /// Persist the latest verdict and append it to the bounded history.
    pub fn record_health(&self, status: &DataHealthStatus) -> Result<(), StoreError> {
        self.files.write(records::DATA_HEALTH, &Some(status))?;
        self.files
            .update::<Vec<DataHealthStatus>, _, _>(records::HEALTH_HISTORY, |list| {
                append_bounded(list, status.clone(), MAX_HEALTH_HISTORY)
            })
    }

    pub fn health_history(&self) -> Result<Vec<DataHealthStatus>, StoreError> {
        self.read_or_default(records::HEALTH_HISTORY)
    }

    // --- market snapshot ----------------------------------------------------

    pub fn last_snapshot(&self) -> Result<Option<MarketSnapshot>, StoreError> {
        self.read_or_default(records::MARKET_SNAPSHOT)
    }

    pub fn save_snapshot(&self, snapshot: &MarketSnapshot) -> Result<(), StoreError> {
        self.files
            .write(records::MARKET_SNAPSHOT, &Some(snapshot))
            .map(|_| ())
    }

    // --- ooda log -----------------------------------------------------------

    pub fn append_ooda(&self, entry: OodaLogEntry) -> Result<(), StoreError> {
        self.files
            .update::<Vec<OodaLogEntry>, _, _>(records::OODA_LOG, |list| {
                append_bounded(list, entry, MAX_OODA_LOG)
            })
    }

    /// The last `n` entries, oldest first.
    pub fn recent_ooda(&self, n: usize) -> Result<Vec<OodaLogEntry>, StoreError> {
        let list: Vec<OodaLogEntry> = self.read_or_default(records::OODA_LOG)?;
        Ok(tail(list, n))
    }

    // --- improvement queue --------------------------------------------------

    pub fn improvement_queue(&self) -> Result<Vec<ImprovementItem>, StoreError> {
        self.read_or_default(records::IMPROVEMENT_QUEUE)
    }

    /// Enqueue `item`. Returns false when a pending item with the same task
    /// text already exists.
    pub fn enqueue_improvement(&self, item: ImprovementItem) -> Result<bool, StoreError> {
        self.files
            .update::<Vec<ImprovementItem>, _, _>(records::IMPROVEMENT_QUEUE, |list| {
                let duplicate = list.iter().any(|i| {
                    i.status == ImprovementStatus::Pending && i.task.trim() == item.task.trim()
                });
                if duplicate {
                    return false;
                }
                list.push(item);
                evict_terminal(list, MAX_IMPROVEMENT_QUEUE);
                true
            })
    }

    /// Oldest pending item.
    pub fn next_pending_improvement(&self) -> Result<Option<ImprovementItem>, StoreError> {
        let list = self.improvement_queue()?;
        Ok(list
            .into_iter()
            .filter(|i| i.status == ImprovementStatus::Pending)
            .min_by_key(|i| i.created_at))
    }

    /// Apply a forward status transition to the item with `id`.
    pub fn transition_improvement(
        &self,
        id: Uuid,
        to: ImprovementStatus,
        outcome: Option<String>,
    ) -> Result<ImprovementItem, QueueError> {
        let now = Utc::now();
        self.files
            .update::<Vec<ImprovementItem>, _, _>(records::IMPROVEMENT_QUEUE, |list| {
                let item = list
                    .iter_mut()
                    .find(|i| i.id == id)
                    .ok_or(QueueError::NotFound(id))?;
                item.transition(to, now)?;
                if outcome.is_some() {
                    item.outcome = outcome;
                }
                Ok(item.clone())
            })?
    }

    // --- research queue -----------------------------------------------------

    pub fn research_queue(&self) -> Result<Vec<ResearchItem>, StoreError> {
        self.read_or_default(records::RESEARCH_QUEUE)
    }

    pub fn enqueue_research(&self, item: ResearchItem) -> Result<(), StoreError> {
        self.files
            .update::<Vec<ResearchItem>, _, _>(records::RESEARCH_QUEUE, |list| {
                append_bounded(list, item, MAX_RESEARCH_QUEUE)
            })
    }

    // --- alert cooldowns ----------------------------------------------------

    /// Atomically check the cooldown for `kind` and stamp it when the alert
    /// may be sent.
    pub fn claim_alert_slot(
        &self,
        kind: &str,
        cooldown: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.files
            .update::<AlertState, _, _>(records::ALERT_STATE, |state| {
                let allowed = state
                    .last_sent
                    .get(kind)
                    .is_none_or(|last| now - *last >= cooldown);
                if allowed {
                    state.last_sent.insert(kind.to_string(), now);
                }
                allowed
            })
    }

    // --- agent session ------------------------------------------------------

    pub fn agent_session(&self) -> Result<AgentSession, StoreError> {
        self.read_or_default(records::AGENT_SESSION)
    }

    pub fn set_agent_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        self.files.write(records::AGENT_SESSION, session).map(|_| ())
    }

    // --- daemon state -------------------------------------------------------

    pub fn daemon_state(&self) -> Result<DaemonState, StoreError> {
        self.read_or_default(records::DAEMON_STATE)
    }

    pub fn update_daemon_state<R>(
        &self,
        f: impl FnOnce(&mut DaemonState) -> R,
    ) -> Result<R, StoreError> {
        self.files.update(records::DAEMON_STATE, f)
    }
}

fn current_day(slot: &mut Option<DailyPnl>, date: NaiveDate, equity: Decimal) -> &mut DailyPnl {
    if slot.as_ref().is_none_or(|p| p.date != date) {
        *slot = Some(DailyPnl::new_day(date, equity));
    }
    slot.get_or_insert_with(|| DailyPnl::new_day(date, equity))
}

fn tail<T>(mut list: Vec<T>, n: usize) -> Vec<T> {
    if list.len() > n {
        list.drain(..list.len() - n);
    }
    list
}

fn evict_terminal(list: &mut Vec<ImprovementItem>, cap: usize) {
    while list.len() > cap {
        match list.iter().position(|i| i.status.is_terminal()) {
            Some(idx) => {
                list.remove(idx);
            }
            None => break,
        }
    }
}
