//! Market data boundary.
//!
//! The collector that fetches candles and order books runs outside this
//! crate. It produces a `MarketSnapshot` as JSON; `FileMarketSource` reads
//! that file (optionally running the collector command first).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from market data collection.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Failed to read snapshot {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Collector command failed: {0}")]
    Collector(String),

    #[error("Collector timed out after {0:?}")]
    Timeout(Duration),
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book depth for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Empty when either side has no levels.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() || self.asks.is_empty()
    }
}

/// Per-symbol market state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolData {
    pub mid_price: Decimal,
    /// When this symbol's data was last refreshed by the collector.
    pub updated_at: DateTime<Utc>,
    /// Candles keyed by timeframe (`15m`, `1h`, `4h`, ...).
    #[serde(default)]
    pub candles: BTreeMap<String, Vec<Candle>>,
    #[serde(default)]
    pub order_book: OrderBook,
    #[serde(default)]
    pub funding_rate: Option<Decimal>,
}

/// Everything the collector produced for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub symbols: BTreeMap<String, SymbolData>,
}

impl MarketSnapshot {
    pub fn mid_price(&self, symbol: &str) -> Option<Decimal> {
        self.symbols.get(symbol).map(|s| s.mid_price)
    }
}

/// Source of market snapshots.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Collect a fresh snapshot.
    async fn collect(&self) -> Result<MarketSnapshot, MarketDataError>;
}

/// Reads the collector's JSON output from disk.
#[derive(Debug, Clone)]
pub struct FileMarketSource {
    path: PathBuf,
    /// Collector command run before each read, if any.
    refresh: Option<Vec<String>>,
    timeout: Duration,
}

impl FileMarketSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            refresh: None,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_refresh(mut self, command: Vec<String>, timeout: Duration) -> Self {
        if !command.is_empty() {
            self.refresh = Some(command);
        }
        self.timeout = timeout;
        self
    }

    async fn run_collector(&self, command: &[String]) -> Result<(), MarketDataError> {
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| MarketDataError::Timeout(self.timeout))?
            .map_err(|e| MarketDataError::Collector(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MarketDataError::Collector(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataSource for FileMarketSource {
    async fn collect(&self) -> Result<MarketSnapshot, MarketDataError> {
        if let Some(command) = &self.refresh {
            self.run_collector(command).await?;
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| MarketDataError::Read {
                path: self.path.clone(),
                source,
            })?;
        let snapshot: MarketSnapshot = serde_json::from_str(&content)?;
        debug!(symbols = snapshot.symbols.len(), "Market snapshot loaded");
        Ok(snapshot)
    }
}
