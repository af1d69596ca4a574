//! OODA cycle orchestrator.
//!
//! One cycle walks a fixed phase graph:
//!
//! ```text
//! Idle → CheckingKillSwitch → Observing → ValidatingHealth → Deciding → Acting → Monitoring → Idle
//!                 │               │                │
//!                 └──→ Aborted ←──┘                └──→ SafeClose → Acting
//! ```
//!
//! - `CheckingKillSwitch` aborts when the switch is active
//! - `Observing` aborts when account state cannot be fetched after retries
//! - `ValidatingHealth` routes close_only cycles through `SafeClose`, which
//!   closes every open position without consulting the reasoning agent
//! - `Deciding` retries once with a fresh session, then falls back to hold
//! - `Acting` always logs the cycle and dispatches on the action type
//! - `Monitoring` resyncs positions, updates daily P&L and re-checks limits.
//!   A breach found here or during evaluation flattens every open position

pub mod dispatch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use claw_common::{
    ActionType, DailyPnl, DataHealthStatus, ExecutionMode, OodaLogEntry, Position, Signal,
};

use crate::agent::{parse_decision, Decision, DecisionRequest, ReasoningAgent, SessionMode};
use crate::alert::{Alert, AlertLevel, Alerter};
use crate::exchange::{Exchange, ExchangeError};
use crate::executor::{ExecutionReport, TradeExecutor};
use crate::health::{HealthInput, HealthMonitor};
use crate::market::{MarketDataSource, MarketSnapshot};
use crate::performance::PerformanceStats;
use crate::retry::RetryPolicy;
use crate::risk::equity::total_unrealized;
use crate::risk::{check_limits, compute_equity, Breach, KillSwitch, RiskEvaluator, RiskInputs};
use crate::store::{StateStore, StoreError};

// ============================================================================
// Phases
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    CheckingKillSwitch,
    Observing,
    ValidatingHealth,
    Deciding,
    SafeClose,
    Acting,
    Monitoring,
    Aborted,
}

impl CyclePhase {
    /// Edges of the phase graph.
    pub fn can_transition_to(&self, next: CyclePhase) -> bool {
        use CyclePhase::*;
        matches!(
            (self, next),
            (Idle, CheckingKillSwitch)
                | (CheckingKillSwitch, Observing)
                | (CheckingKillSwitch, Aborted)
                | (Observing, ValidatingHealth)
                | (Observing, Aborted)
                | (ValidatingHealth, Deciding)
                | (ValidatingHealth, SafeClose)
                | (Deciding, Acting)
                | (SafeClose, Acting)
                | (Acting, Monitoring)
                | (Monitoring, Idle)
                | (Aborted, Idle)
        )
    }
}

/// Ordered record of the phases one cycle visited.
#[derive(Debug, Clone)]
struct PhaseTrace {
    phases: Vec<CyclePhase>,
}

impl PhaseTrace {
    fn new() -> Self {
        Self {
            phases: vec![CyclePhase::Idle],
        }
    }

    fn current(&self) -> CyclePhase {
        self.phases.last().copied().unwrap_or(CyclePhase::Idle)
    }

    fn advance(&mut self, next: CyclePhase) {
        let current = self.current();
        if !current.can_transition_to(next) {
            error!(?current, ?next, "Invalid cycle phase transition");
        }
        debug_assert!(current.can_transition_to(next), "{current:?} -> {next:?}");
        debug!(phase = ?next, "Cycle phase");
        self.phases.push(next);
    }
}

// ============================================================================
// Report
// ============================================================================

/// Final status of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    KillSwitchActive,
    ObservationFailed(String),
    DecisionFailed(String),
}

impl CycleStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CycleStatus::Completed)
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Completed => write!(f, "completed"),
            CycleStatus::KillSwitchActive => write!(f, "kill switch active"),
            CycleStatus::ObservationFailed(e) => write!(f, "observation failed: {}", e),
            CycleStatus::DecisionFailed(e) => write!(f, "decision failed: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<CyclePhase>,
    pub status: CycleStatus,
    pub mode: Option<ExecutionMode>,
    pub action_type: Option<ActionType>,
    pub equity: Option<Decimal>,
    pub approved: usize,
    pub rejected: usize,
    pub executions: Vec<ExecutionReport>,
    pub breach: Option<Breach>,
    /// Emergency closes sent after a breach.
    pub flattened: Vec<ExecutionReport>,
    /// Closed-trade statistics after monitoring.
    pub performance: Option<PerformanceStats>,
    /// An improvement item was queued and a Coder pass should follow.
    pub coder_requested: bool,
}

impl CycleReport {
    fn new(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            phases: Vec::new(),
            status: CycleStatus::Completed,
            mode: None,
            action_type: None,
            equity: None,
            approved: 0,
            rejected: 0,
            executions: Vec::new(),
            breach: None,
            flattened: Vec::new(),
            performance: None,
            coder_requested: false,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Errors that abort observation.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub agent_timeout: Duration,
    pub exchange_timeout: Duration,
    pub retry: RetryPolicy,
    pub journal_dir: PathBuf,
    /// OODA log entries and trades passed to the agent.
    pub context_window: usize,
    /// Cooldown for repeated cycle alerts of the same kind.
    pub alert_cooldown: chrono::Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(600),
            exchange_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            journal_dir: PathBuf::from("journal"),
            context_window: 10,
            alert_cooldown: chrono::Duration::seconds(1800),
        }
    }
}

/// External collaborators of a cycle.
#[derive(Clone)]
pub struct CycleServices {
    pub exchange: Arc<dyn Exchange>,
    pub market: Arc<dyn MarketDataSource>,
    pub agent: Arc<dyn ReasoningAgent>,
    pub alerter: Arc<dyn Alerter>,
}

/// Something that runs one cycle. The daemon drives this.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self) -> CycleReport;
}

/// Inputs gathered during observation.
struct Observation {
    collateral: Decimal,
    positions: Vec<Position>,
    equity: Decimal,
    daily_pnl: DailyPnl,
    previous_pnl: Option<DailyPnl>,
    snapshot: Option<MarketSnapshot>,
    previous_snapshot: Option<MarketSnapshot>,
}

pub struct CycleOrchestrator {
    config: CycleConfig,
    store: StateStore,
    kill_switch: KillSwitch,
    evaluator: RiskEvaluator,
    health: HealthMonitor,
    services: CycleServices,
    executor: TradeExecutor,
}

impl CycleOrchestrator {
    pub fn new(
        config: CycleConfig,
        store: StateStore,
        evaluator: RiskEvaluator,
        health: HealthMonitor,
        services: CycleServices,
    ) -> Self {
        let kill_switch = KillSwitch::new(store.clone());
        let executor = TradeExecutor::new(
            services.exchange.clone(),
            store.clone(),
            kill_switch.clone(),
        );
        Self {
            config,
            store,
            kill_switch,
            evaluator,
            health,
            services,
            executor,
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Run one full cycle. Never panics or errors; the outcome is in the report.
    pub async fn run(&self) -> CycleReport {
        let mut trace = PhaseTrace::new();
        let mut report = CycleReport::new(Uuid::new_v4(), Utc::now());
        info!(cycle_id = %report.cycle_id, "Cycle started");

        self.run_phases(&mut trace, &mut report).await;

        if trace.current() == CyclePhase::Aborted || trace.current() == CyclePhase::Monitoring {
            trace.advance(CyclePhase::Idle);
        }
        report.phases = trace.phases;
        report.finished_at = Utc::now();
        info!(
            cycle_id = %report.cycle_id,
            status = %report.status,
            mode = ?report.mode,
            approved = report.approved,
            rejected = report.rejected,
            executions = report.executions.len(),
            "Cycle finished"
        );
        report
    }

    async fn run_phases(&self, trace: &mut PhaseTrace, report: &mut CycleReport) {
        trace.advance(CyclePhase::CheckingKillSwitch);
        if self.kill_switch.is_active() {
            warn!("Kill switch active, cycle aborted");
            trace.advance(CyclePhase::Aborted);
            report.status = CycleStatus::KillSwitchActive;
            return;
        }

        trace.advance(CyclePhase::Observing);
        let obs = match self.observe().await {
            Ok(obs) => obs,
            Err(e) => {
                error!(error = %e, "Observation failed");
                self.alert_once(
                    AlertLevel::Critical,
                    "observation_failed",
                    format!("Account state unavailable: {e}"),
                )
                .await;
                trace.advance(CyclePhase::Aborted);
                report.status = CycleStatus::ObservationFailed(e.to_string());
                return;
            }
        };
        report.equity = Some(obs.equity);

        trace.advance(CyclePhase::ValidatingHealth);
        let health = self.validate_health(&obs).await;
        let mode = health.execution_mode;
        report.mode = Some(mode);

        let (decision, synthesized) = if mode == ExecutionMode::CloseOnly {
            trace.advance(CyclePhase::SafeClose);
            (safe_close_decision(&obs.positions), true)
        } else {
            trace.advance(CyclePhase::Deciding);
            match self.decide(report.cycle_id, &obs, &health).await {
                Ok(d) => (d, false),
                Err(reason) => {
                    report.status = CycleStatus::DecisionFailed(reason.clone());
                    (Decision::hold(format!("decision failed: {reason}")), true)
                }
            }
        };
        report.action_type = Some(decision.action_type);

        trace.advance(CyclePhase::Acting);
        self.act(report, &obs, mode, &decision, synthesized).await;

        trace.advance(CyclePhase::Monitoring);
        self.monitor(report, &obs).await;
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ExchangeError>
    where
        F: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        tokio::time::timeout(self.config.exchange_timeout, fut)
            .await
            .unwrap_or(Err(ExchangeError::Timeout))
    }

    async fn observe(&self) -> Result<Observation, CycleError> {
        let retry = &self.config.retry;
        let exchange = &self.services.exchange;

        let snapshot = match retry
            .run("market_snapshot", || self.services.market.collect())
            .await
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "Market snapshot unavailable");
                None
            }
        };
        if let Some(s) = &snapshot {
            exchange.update_marks(s).await;
        }

        let collateral = retry
            .run("collateral", || self.bounded(exchange.collateral()))
            .await?;
        let positions = retry
            .run("positions", || self.bounded(exchange.positions()))
            .await?;
        self.store.set_positions(&positions)?;

        let equity = compute_equity(collateral, &positions);
        let previous_pnl = self.store.daily_pnl().unwrap_or_else(|e| {
            warn!(error = %e, "Persisted daily P&L unreadable");
            None
        });
        let daily_pnl = self.store.record_equity(
            Utc::now().date_naive(),
            equity,
            total_unrealized(&positions),
        )?;

        let previous_snapshot = self.store.last_snapshot().unwrap_or_else(|e| {
            warn!(error = %e, "Previous snapshot unreadable");
            None
        });
        if let Some(s) = &snapshot
            && let Err(e) = self.store.save_snapshot(s)
        {
            warn!(error = %e, "Failed to persist snapshot");
        }

        debug!(%collateral, %equity, positions = positions.len(), "Observation complete");
        Ok(Observation {
            collateral,
            positions,
            equity,
            daily_pnl,
            previous_pnl,
            snapshot,
            previous_snapshot,
        })
    }

    async fn validate_health(&self, obs: &Observation) -> DataHealthStatus {
        let now = Utc::now();
        let status = self.health.check(
            &HealthInput {
                snapshot: obs.snapshot.as_ref(),
                previous: obs.previous_snapshot.as_ref(),
                persisted_pnl: obs.previous_pnl.as_ref(),
                live_equity: Some(obs.equity),
            },
            now,
        );
        if let Err(e) = self.store.record_health(&status) {
            warn!(error = %e, "Failed to persist data health");
        }

        if !status.is_healthy() {
            let level = if status.execution_mode == ExecutionMode::CloseOnly {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            let issues: Vec<&str> = status.issues.iter().map(|i| i.message.as_str()).collect();
            let kind = format!("data_health_{}", status.execution_mode);
            let message = format!(
                "Execution mode {} (score {}): {}",
                status.execution_mode,
                status.score,
                issues.join("; ")
            );
            if self.claim_slot(&kind, self.health.config().alert_cooldown) {
                self.services.alerter.send(&Alert::new(level, kind, message)).await;
            }
        }
        status
    }

    async fn decide(
        &self,
        cycle_id: Uuid,
        obs: &Observation,
        health: &DataHealthStatus,
    ) -> Result<Decision, String> {
        let window = self.config.context_window;
        let request = DecisionRequest {
            cycle_id,
            execution_mode: health.execution_mode,
            equity: obs.equity,
            positions: obs.positions.clone(),
            daily_pnl: Some(obs.daily_pnl.clone()),
            health: health.clone(),
            snapshot: obs.snapshot.clone(),
            recent_cycles: self.store.recent_ooda(window).unwrap_or_default(),
            recent_trades: self
                .store
                .trade_history()
                .map(|t| tail(t, window))
                .unwrap_or_default(),
        };

        let mut errors = Vec::new();
        for (attempt, session) in [SessionMode::Resume, SessionMode::Fresh].into_iter().enumerate() {
            let outcome = tokio::time::timeout(
                self.config.agent_timeout,
                self.services.agent.decide(&request, session),
            )
            .await;
            let error = match outcome {
                Ok(Ok(raw)) => match parse_decision(&raw) {
                    Ok(decision) => {
                        info!(action_type = %decision.action_type, signals = decision.signals.len(), "Decision received");
                        return Ok(decision);
                    }
                    Err(e) => format!("invalid decision: {e}"),
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("agent timed out after {:?}", self.config.agent_timeout),
            };
            warn!(attempt = attempt + 1, %error, "Decision attempt failed");
            errors.push(error);
        }
        let last_error = errors.pop().unwrap_or_default();

        self.services
            .alerter
            .send(&Alert::warning(
                "decision_failed",
                format!("Reasoning agent failed twice, holding: {last_error}"),
            ))
            .await;
        Err(last_error)
    }

    async fn act(
        &self,
        report: &mut CycleReport,
        obs: &Observation,
        mode: ExecutionMode,
        decision: &Decision,
        synthesized: bool,
    ) {
        let now = Utc::now();
        if let Err(e) = self.store.append_ooda(OodaLogEntry {
            cycle_id: report.cycle_id,
            timestamp: now,
            action_type: decision.action_type,
            execution_mode: mode,
            market_summary: decision.market_summary.clone(),
            self_assessment: decision.self_assessment.clone(),
            synthesized,
        }) {
            warn!(error = %e, "Failed to append OODA log");
        }

        match decision.action_type {
            ActionType::Trade => self.act_trade(report, obs, mode, decision).await,
            ActionType::SelfImprove => {
                if let Some(request) = &decision.improvement {
                    match dispatch::enqueue_improvement(&self.store, request) {
                        Ok(Some(_)) => report.coder_requested = true,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Failed to queue improvement"),
                    }
                }
            }
            ActionType::Journal => {
                if let Err(e) =
                    dispatch::write_journal(&self.config.journal_dir, report.cycle_id, now, decision)
                        .await
                {
                    warn!(error = %e, "Failed to write journal");
                }
            }
            ActionType::Research => {
                if let Some(topic) = &decision.research_topic
                    && let Err(e) = dispatch::enqueue_research(
                        &self.store,
                        topic,
                        decision.market_summary.clone(),
                        now,
                    )
                {
                    warn!(error = %e, "Failed to queue research");
                }
            }
            ActionType::Hold => debug!("Hold"),
        }
    }

    async fn act_trade(
        &self,
        report: &mut CycleReport,
        obs: &Observation,
        mode: ExecutionMode,
        decision: &Decision,
    ) {
        let inputs = RiskInputs {
            equity: obs.equity,
            positions: &obs.positions,
            daily_pnl: Some(&obs.daily_pnl),
            mode,
        };
        let assessment =
            match self
                .evaluator
                .evaluate(&self.kill_switch, inputs, decision.signals.clone())
            {
                Ok(a) => a,
                Err(e) => {
                    // Breach detected but the switch could not be written.
                    error!(error = %e, "Kill switch write failed, nothing executed");
                    self.services
                        .alerter
                        .send(&Alert::critical(
                            "kill_switch",
                            format!("Risk breach but kill switch write failed: {e}"),
                        ))
                        .await;
                    return;
                }
            };

        report.approved = assessment.approved.len();
        report.rejected = assessment.rejected.len();
        for r in &assessment.rejected {
            info!(symbol = %r.signal.symbol, code = r.reason.code(), reason = %r.reason, "Signal rejected");
        }

        if let Some(breach) = &assessment.breach {
            report.breach = Some(breach.clone());
            self.alert_once(
                AlertLevel::Critical,
                "risk_breach",
                format!("Kill switch activated: {breach}"),
            )
            .await;
            return;
        }

        report.executions = self
            .executor
            .execute(&assessment.approved, obs.equity, obs.snapshot.as_ref())
            .await;
    }

    async fn monitor(&self, report: &mut CycleReport, obs: &Observation) {
        let exchange = &self.services.exchange;
        let positions = match self.bounded(exchange.positions()).await {
            Ok(p) => {
                if let Err(e) = self.store.set_positions(&p) {
                    warn!(error = %e, "Failed to resync positions");
                }
                p
            }
            Err(e) => {
                warn!(error = %e, "Position resync failed, using stored positions");
                self.store
                    .positions()
                    .unwrap_or_else(|_| obs.positions.clone())
            }
        };
        let collateral = self
            .bounded(exchange.collateral())
            .await
            .unwrap_or(obs.collateral);
        let equity = compute_equity(collateral, &positions);

        let daily = self
            .store
            .record_equity(Utc::now().date_naive(), equity, total_unrealized(&positions))
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to update daily P&L");
                obs.daily_pnl.clone()
            });

        let breach = check_limits(Some(&daily), equity, self.evaluator.limits());
        if let Some(breach) = &breach {
            if !self.kill_switch.is_active()
                && let Err(e) = self.kill_switch.activate(&breach.to_string())
            {
                error!(error = %e, "Failed to activate kill switch");
            }
            self.alert_once(
                AlertLevel::Critical,
                "risk_breach",
                format!("Kill switch activated: {breach}"),
            )
            .await;
            report.breach.get_or_insert_with(|| breach.clone());
        }

        let mut positions = positions;
        if let Some(breach) = report.breach.clone()
            && !positions.is_empty()
        {
            let reason = format!("emergency close: {breach}");
            let flattened = self.executor.flatten(&positions, &reason).await;
            let failed: Vec<&str> = flattened
                .iter()
                .filter(|r| !r.is_filled())
                .map(|r| r.symbol.as_str())
                .collect();
            if failed.is_empty() {
                info!(closed = flattened.len(), "Positions flattened after breach");
            } else {
                self.services
                    .alerter
                    .send(&Alert::critical(
                        "emergency_close_failed",
                        format!("Emergency close failed for {}", failed.join(", ")),
                    ))
                    .await;
            }
            report.flattened = flattened;
            if let Ok(p) = self.bounded(exchange.positions()).await {
                if let Err(e) = self.store.set_positions(&p) {
                    warn!(error = %e, "Failed to resync positions");
                }
                positions = p;
            }
        }

        if self.kill_switch.is_active() {
            let reason = self
                .kill_switch
                .status()
                .ok()
                .flatten()
                .and_then(|s| s.reason)
                .unwrap_or_else(|| "unknown".to_string());
            self.alert_once(
                AlertLevel::Critical,
                "kill_switch_active",
                format!("Kill switch is active: {reason}"),
            )
            .await;
        }

        match self.store.trade_history() {
            Ok(trades) => {
                let stats = PerformanceStats::from_trades(&trades);
                debug!(performance = %stats, "Trade performance");
                report.performance = Some(stats);
            }
            Err(e) => warn!(error = %e, "Trade history unreadable, performance skipped"),
        }

        debug!(%equity, positions = positions.len(), "Monitoring complete");
    }

    fn claim_slot(&self, kind: &str, cooldown: chrono::Duration) -> bool {
        self.store
            .claim_alert_slot(kind, cooldown, Utc::now())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Alert state unavailable, sending anyway");
                true
            })
    }

    /// Send an alert at most once per cooldown for `kind`.
    async fn alert_once(&self, level: AlertLevel, kind: &str, message: String) {
        if self.claim_slot(kind, self.config.alert_cooldown) {
            self.services
                .alerter
                .send(&Alert::new(level, kind, message))
                .await;
        }
    }
}

#[async_trait]
impl CycleRunner for CycleOrchestrator {
    async fn run_cycle(&self) -> CycleReport {
        self.run().await
    }
}

/// One close per open position, confidence 1.
pub fn safe_close_decision(positions: &[Position]) -> Decision {
    let mut decision = Decision::hold("close_only: flattening open positions");
    decision.action_type = ActionType::Trade;
    decision.signals = positions
        .iter()
        .map(|p| Signal::close(p.symbol.clone(), "close_only fail-safe"))
        .collect();
    decision
}

fn tail<T>(mut list: Vec<T>, n: usize) -> Vec<T> {
    if list.len() > n {
        list.drain(..list.len() - n);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_common::{Action, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn test_phase_graph() {
        use CyclePhase::*;
        assert!(Idle.can_transition_to(CheckingKillSwitch));
        assert!(CheckingKillSwitch.can_transition_to(Aborted));
        assert!(Observing.can_transition_to(Aborted));
        assert!(ValidatingHealth.can_transition_to(SafeClose));
        assert!(SafeClose.can_transition_to(Acting));
        assert!(!SafeClose.can_transition_to(Deciding));
        assert!(!ValidatingHealth.can_transition_to(Aborted));
        assert!(!Deciding.can_transition_to(Aborted));
        assert!(!Idle.can_transition_to(Acting));
        assert!(Monitoring.can_transition_to(Idle));
    }

    #[test]
    fn test_safe_close_decision() {
        let positions = vec![
            Position {
                symbol: "BTC".to_string(),
                side: Side::Long,
                size: dec!(0.1),
                entry_price: dec!(90000),
                leverage: dec!(3),
                opened_at: None,
                unrealized_pnl: Decimal::ZERO,
            },
            Position {
                symbol: "ETH".to_string(),
                side: Side::Short,
                size: dec!(1),
                entry_price: dec!(3000),
                leverage: dec!(2),
                opened_at: None,
                unrealized_pnl: Decimal::ZERO,
            },
        ];
        let d = safe_close_decision(&positions);
        assert_eq!(d.action_type, ActionType::Trade);
        assert_eq!(d.signals.len(), 2);
        assert!(d
            .signals
            .iter()
            .all(|s| s.action == Action::Close && s.confidence == Decimal::ONE));
    }

    #[test]
    fn test_status_failure() {
        assert!(!CycleStatus::Completed.is_failure());
        assert!(CycleStatus::KillSwitchActive.is_failure());
        assert!(CycleStatus::DecisionFailed("x".into()).is_failure());
    }
}
