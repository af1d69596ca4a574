//! Shared types for the claw trading loop.
//!
//! CRITICAL: All prices, sizes and equity fractions use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Side / Action / ActionType
// ============================================================================

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-signal action proposed by the reasoning stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Long,
    Short,
    Close,
    Hold,
}

impl Action {
    /// True for actions that open or add to a position.
    #[inline]
    pub fn is_entry(&self) -> bool {
        matches!(self, Action::Long | Action::Short)
    }

    /// Position side an entry action would open.
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Long => Some(Side::Long),
            Action::Short => Some(Side::Short),
            Action::Close | Action::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Long => "long",
            Action::Short => "short",
            Action::Close => "close",
            Action::Hold => "hold",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cycle-level action declared by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Trade,
    #[default]
    Hold,
    SelfImprove,
    Journal,
    Research,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Trade => "trade",
            ActionType::Hold => "hold",
            ActionType::SelfImprove => "self_improve",
            ActionType::Journal => "journal",
            ActionType::Research => "research",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Signal
// ============================================================================

fn default_leverage() -> Decimal {
    Decimal::ONE
}

/// A trading signal produced by the reasoning stage.
///
/// Consumed once by the executor; only persisted as a `TradeRecord` once
/// acted upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: Action,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default)]
    pub reasoning: String,
    /// Requested margin as a fraction of equity. `None` means "use the
    /// configured per-position maximum".
    #[serde(default)]
    pub allocation: Option<Decimal>,
}

/// Reasons a signal fails structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("symbol is empty")]
    EmptySymbol,

    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(Decimal),

    #[error("leverage {0} below 1")]
    LeverageTooLow(Decimal),

    #[error("{field} must be positive, got {value}")]
    NonPositivePrice { field: &'static str, value: Decimal },

    #[error("allocation {0} outside (0, 1]")]
    AllocationOutOfRange(Decimal),
}

impl Signal {
    /// A synthesized close for an open position (close-only fail-safe).
    pub fn close(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: Action::Close,
            confidence: Decimal::ONE,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            leverage: Decimal::ONE,
            reasoning: reasoning.into(),
            allocation: None,
        }
    }

    /// A hold signal for a symbol.
    pub fn hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            confidence: Decimal::ZERO,
            ..Self::close(symbol, reasoning)
        }
    }

    /// Check structural constraints of the schema.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.symbol.trim().is_empty() {
            return Err(SignalError::EmptySymbol);
        }
        if self.confidence < Decimal::ZERO || self.confidence > Decimal::ONE {
            return Err(SignalError::ConfidenceOutOfRange(self.confidence));
        }
        if self.leverage < Decimal::ONE {
            return Err(SignalError::LeverageTooLow(self.leverage));
        }
        for (field, value) in [
            ("entry_price", self.entry_price),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ] {
            if let Some(v) = value
                && v <= Decimal::ZERO
            {
                return Err(SignalError::NonPositivePrice { field, value: v });
            }
        }
        if let Some(a) = self.allocation
            && (a <= Decimal::ZERO || a > Decimal::ONE)
        {
            return Err(SignalError::AllocationOutOfRange(a));
        }
        Ok(())
    }
}

// ============================================================================
// Position
// ============================================================================

/// An open position as recorded by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Size in coin units, always positive while present.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Notional value at entry.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.size.abs() * self.entry_price
    }

    /// Margin committed to the position (notional / leverage).
    pub fn margin(&self) -> Decimal {
        self.notional() / self.leverage.max(Decimal::ONE)
    }
}

// ============================================================================
// Kill switch / Daily P&L
// ============================================================================

/// Persisted kill-switch record. The sole authority for the trading gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KillSwitchState {
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
}

impl KillSwitchState {
    pub fn active(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            reason: Some(reason.into()),
            triggered_at: Some(at),
        }
    }

    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Date-scoped P&L aggregate, reset at the UTC day boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub start_of_day_equity: Decimal,
    pub peak_equity: Decimal,
}

impl DailyPnl {
    /// Fresh record for a new trading day.
    pub fn new_day(date: NaiveDate, equity: Decimal) -> Self {
        Self {
            date,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            equity,
            start_of_day_equity: equity,
            peak_equity: equity,
        }
    }

    /// Realized + unrealized.
    #[inline]
    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }
}

// ============================================================================
// Data health
// ============================================================================

/// Execution mode for one cycle, ordered from least to most restrictive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    All,
    Reduced,
    CloseOnly,
}

impl ExecutionMode {
    /// Whether new entries can be evaluated at all.
    #[inline]
    pub fn allows_entries(&self) -> bool {
        !matches!(self, ExecutionMode::CloseOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::All => "all",
            ExecutionMode::Reduced => "reduced",
            ExecutionMode::CloseOnly => "close_only",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single finding from the data health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Mode this issue demotes the cycle to.
    pub demotes_to: ExecutionMode,
    pub message: String,
}

impl HealthIssue {
    pub fn new(demotes_to: ExecutionMode, message: impl Into<String>) -> Self {
        Self {
            demotes_to,
            message: message.into(),
        }
    }
}

/// Per-cycle data health verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHealthStatus {
    pub execution_mode: ExecutionMode,
    pub issues: Vec<HealthIssue>,
    /// 0-100 quality score.
    pub score: u8,
    pub checked_at: DateTime<Utc>,
}

impl DataHealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.execution_mode == ExecutionMode::All
    }
}

// ============================================================================
// Improvement queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ImprovementStatus {
    /// Forward-only transitions: pending → in_progress → {done | failed}.
    pub fn can_transition_to(&self, next: ImprovementStatus) -> bool {
        use ImprovementStatus::*;
        matches!((self, next), (Pending, InProgress) | (InProgress, Done) | (InProgress, Failed))
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImprovementStatus::Done | ImprovementStatus::Failed)
    }
}

impl std::fmt::Display for ImprovementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImprovementStatus::Pending => "pending",
            ImprovementStatus::InProgress => "in_progress",
            ImprovementStatus::Done => "done",
            ImprovementStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid improvement transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ImprovementStatus,
    pub to: ImprovementStatus,
}

/// A self-improvement task created by the audit pass (or a decision) and
/// consumed by the guardrail one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementItem {
    pub id: Uuid,
    pub task: String,
    pub priority: Priority,
    #[serde(default)]
    pub target_file: Option<String>,
    pub status: ImprovementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Short description of how the item ended.
    #[serde(default)]
    pub outcome: Option<String>,
}

impl ImprovementItem {
    pub fn new(task: impl Into<String>, priority: Priority, target_file: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            priority,
            target_file,
            status: ImprovementStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    /// Apply a forward transition, stamping `completed_at` on terminal states.
    pub fn transition(
        &mut self,
        to: ImprovementStatus,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }
}

// ============================================================================
// History records
// ============================================================================

/// An executed action in the bounded trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub pnl: Option<Decimal>,
    pub leverage: Decimal,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// One cycle's reasoning summary in the OODA log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OodaLogEntry {
    pub cycle_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub market_summary: Option<String>,
    #[serde(default)]
    pub self_assessment: Option<String>,
    /// True when the decision was synthesized rather than produced by the agent.
    #[serde(default)]
    pub synthesized: bool,
}

/// A research topic queued by a `research` decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchItem {
    pub topic: String,
    #[serde(default)]
    pub context: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_signal() -> Signal {
        Signal {
            symbol: "BTC".to_string(),
            action: Action::Long,
            confidence: dec!(0.9),
            entry_price: Some(dec!(95000)),
            stop_loss: Some(dec!(93000)),
            take_profit: Some(dec!(99000)),
            leverage: dec!(3),
            reasoning: "breakout".to_string(),
            allocation: Some(dec!(0.05)),
        }
    }

    #[test]
    fn test_signal_validate_ok() {
        assert_eq!(sample_signal().validate(), Ok(()));
    }

    #[test]
    fn test_signal_validate_confidence_out_of_range() {
        let mut s = sample_signal();
        s.confidence = dec!(1.2);
        assert_eq!(
            s.validate(),
            Err(SignalError::ConfidenceOutOfRange(dec!(1.2)))
        );
    }

    #[test]
    fn test_signal_validate_non_positive_price() {
        let mut s = sample_signal();
        s.stop_loss = Some(dec!(0));
        assert!(matches!(
            s.validate(),
            Err(SignalError::NonPositivePrice { field: "stop_loss", .. })
        ));
    }

    #[test]
    fn test_signal_deserialize_defaults() {
        let json = r#"{"symbol":"ETH","action":"short","confidence":0.75}"#;
        let s: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(s.action, Action::Short);
        assert_eq!(s.leverage, Decimal::ONE);
        assert_eq!(s.allocation, None);
        assert!(s.reasoning.is_empty());
    }

    #[test]
    fn test_signal_rejects_unknown_action() {
        let json = r#"{"symbol":"ETH","action":"buy","confidence":0.75}"#;
        assert!(serde_json::from_str::<Signal>(json).is_err());
    }

    #[test]
    fn test_position_margin() {
        let p = Position {
            symbol: "BTC".to_string(),
            side: Side::Long,
            size: dec!(0.01),
            entry_price: dec!(100000),
            leverage: dec!(4),
            opened_at: None,
            unrealized_pnl: Decimal::ZERO,
        };
        assert_eq!(p.notional(), dec!(1000));
        assert_eq!(p.margin(), dec!(250));
    }

    #[test]
    fn test_execution_mode_ordering() {
        assert!(ExecutionMode::CloseOnly > ExecutionMode::Reduced);
        assert!(ExecutionMode::Reduced > ExecutionMode::All);
        assert!(!ExecutionMode::CloseOnly.allows_entries());
    }

    #[test]
    fn test_improvement_transitions_forward_only() {
        let mut item = ImprovementItem::new("tidy docs", Priority::Low, None);
        let now = Utc::now();

        assert!(item.transition(ImprovementStatus::Done, now).is_err());
        item.transition(ImprovementStatus::InProgress, now).unwrap();
        assert!(item.completed_at.is_none());
        item.transition(ImprovementStatus::Failed, now).unwrap();
        assert_eq!(item.completed_at, Some(now));

        let err = item
            .transition(ImprovementStatus::Pending, now)
            .unwrap_err();
        assert_eq!(err.from, ImprovementStatus::Failed);
        assert_eq!(item.status, ImprovementStatus::Failed);
    }

    #[test]
    fn test_action_type_serde_names() {
        let t: ActionType = serde_json::from_str("\"self_improve\"").unwrap();
        assert_eq!(t, ActionType::SelfImprove);
        assert_eq!(ActionType::Research.to_string(), "research");
    }
}
