//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

use claw_bot::agent::{AgentError, DecisionRequest, ReasoningAgent, SessionMode};
use claw_bot::alert::{Alert, Alerter};
use claw_bot::cycle::{CycleConfig, CycleOrchestrator, CycleServices};
use claw_bot::exchange::{Exchange, ExchangeError, Fill, OpenRequest, PaperExchange};
use claw_bot::health::{HealthConfig, HealthMonitor};
use claw_bot::market::{BookLevel, MarketDataError, MarketDataSource, MarketSnapshot, OrderBook, SymbolData};
use claw_bot::retry::RetryPolicy;
use claw_bot::risk::{KillSwitch, RiskEvaluator, RiskLimits};
use claw_bot::store::StateStore;
use claw_common::Position;

// ============================================================================
// Alerts
// ============================================================================

#[derive(Default)]
pub struct RecordingAlerter(Mutex<Vec<Alert>>);

impl RecordingAlerter {
    pub fn kinds(&self) -> Vec<String> {
        self.0.lock().iter().map(|a| a.kind.clone()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.0.lock().iter().filter(|a| a.kind == kind).count()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn send(&self, alert: &Alert) {
        self.0.lock().push(alert.clone());
    }
}

// ============================================================================
// Market data
// ============================================================================

/// Serves a fixed snapshot, or fails when none is set.
#[derive(Default)]
pub struct StaticMarket(Mutex<Option<MarketSnapshot>>);

impl StaticMarket {
    pub fn new(snapshot: Option<MarketSnapshot>) -> Self {
        Self(Mutex::new(snapshot))
    }

    pub fn set(&self, snapshot: Option<MarketSnapshot>) {
        *self.0.lock() = snapshot;
    }
}

#[async_trait]
impl MarketDataSource for StaticMarket {
    async fn collect(&self) -> Result<MarketSnapshot, MarketDataError> {
        self.0
            .lock()
            .clone()
            .ok_or_else(|| MarketDataError::Collector("collector down".to_string()))
    }
}

/// Fresh snapshot with a one-level book per symbol and no candles.
pub fn snapshot(prices: &[(&str, Decimal)]) -> MarketSnapshot {
    let now = Utc::now();
    let symbols = prices
        .iter()
        .map(|(symbol, price)| {
            let data = SymbolData {
                mid_price: *price,
                updated_at: now,
                candles: BTreeMap::new(),
                order_book: OrderBook {
                    bids: vec![BookLevel {
                        price: *price - dec!(1),
                        size: dec!(5),
                    }],
                    asks: vec![BookLevel {
                        price: *price + dec!(1),
                        size: dec!(5),
                    }],
                },
                funding_rate: None,
            };
            (symbol.to_string(), data)
        })
        .collect();
    MarketSnapshot {
        fetched_at: now,
        symbols,
    }
}

pub fn default_snapshot() -> MarketSnapshot {
    snapshot(&[("BTC", dec!(50000)), ("ETH", dec!(3000)), ("SOL", dec!(150))])
}

/// Default health rules without candle minimums.
pub fn health_config() -> HealthConfig {
    HealthConfig {
        min_candles: BTreeMap::new(),
        ..HealthConfig::default()
    }
}

// ============================================================================
// Reasoning agent
// ============================================================================

/// Replays queued responses; errors once the script runs out.
#[derive(Default)]
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<Result<String, AgentError>>>,
    pub calls: Mutex<Vec<SessionMode>>,
}

impl ScriptedAgent {
    pub fn replying(responses: Vec<Result<String, AgentError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    async fn decide(
        &self,
        _request: &DecisionRequest,
        session: SessionMode,
    ) -> Result<String, AgentError> {
        self.calls.lock().push(session);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(AgentError::EmptyOutput))
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// Every account call fails.
pub struct DownExchange;

#[async_trait]
impl Exchange for DownExchange {
    async fn collateral(&self) -> Result<Decimal, ExchangeError> {
        Err(ExchangeError::Unavailable("maintenance".to_string()))
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Err(ExchangeError::Unavailable("maintenance".to_string()))
    }

    async fn open_position(&self, _request: &OpenRequest) -> Result<Fill, ExchangeError> {
        Err(ExchangeError::Unavailable("maintenance".to_string()))
    }

    async fn close_position(&self, _symbol: &str) -> Result<Fill, ExchangeError> {
        Err(ExchangeError::Unavailable("maintenance".to_string()))
    }
}

// ============================================================================
// Orchestrator harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub store: StateStore,
    pub kill_switch: KillSwitch,
    pub market: Arc<StaticMarket>,
    pub agent: Arc<ScriptedAgent>,
    pub alerter: Arc<RecordingAlerter>,
}

impl Harness {
    /// Fresh state directory with the kill switch deactivated.
    pub fn new(snapshot: Option<MarketSnapshot>, responses: Vec<Result<String, AgentError>>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        let kill_switch = KillSwitch::new(store.clone());
        kill_switch.deactivate().unwrap();
        Self {
            dir,
            store,
            kill_switch,
            market: Arc::new(StaticMarket::new(snapshot)),
            agent: Arc::new(ScriptedAgent::replying(responses)),
            alerter: Arc::new(RecordingAlerter::default()),
        }
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            retry: RetryPolicy::none(),
            journal_dir: self.dir.path().join("journal"),
            ..CycleConfig::default()
        }
    }

    pub fn orchestrator(&self, exchange: Arc<dyn Exchange>) -> CycleOrchestrator {
        CycleOrchestrator::new(
            self.cycle_config(),
            self.store.clone(),
            RiskEvaluator::new(RiskLimits::default()),
            HealthMonitor::new(health_config()),
            CycleServices {
                exchange,
                market: self.market.clone(),
                agent: self.agent.clone(),
                alerter: self.alerter.clone(),
            },
        )
    }

    pub fn paper(&self, collateral: Decimal) -> Arc<PaperExchange> {
        Arc::new(PaperExchange::new(collateral, Decimal::ZERO))
    }
}

/// A decision document as the agent would print it.
pub fn decision_json(value: serde_json::Value) -> Result<String, AgentError> {
    Ok(format!("Here is my decision:\n```json\n{}\n```\n", value))
}
