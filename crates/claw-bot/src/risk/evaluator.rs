//! Batch risk evaluation of agent signals.
//!
//! Signals are evaluated in the order received. Budgets are cumulative: each
//! approved entry consumes per-symbol margin, aggregate margin and a
//! concurrency slot before the next signal is considered.
//!
//! ## Order of checks
//!
//! 1. Account limits (daily loss, drawdown). A breach rejects every signal
//!    and, through [`RiskEvaluator::evaluate`], activates the kill switch
//! 2. Per signal: schema, hold, confidence, close, mode, direction,
//!    leverage, per-symbol margin, aggregate margin, concurrency
//!
//! ## Exposure basis
//!
//! Margin = `size × entry_price / leverage` for open positions and
//! `allocation × equity` for signals. All fractions are over equity.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use claw_common::{Action, DailyPnl, ExecutionMode, Position, Side, Signal, SignalError};

use super::equity::{fraction_of, symbol_margin, total_margin};
use super::kill_switch::{KillSwitch, KillSwitchError};

/// What to do with a signal whose leverage exceeds the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeveragePolicy {
    #[default]
    Reject,
    Clamp,
}

impl LeveragePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reject" => Some(LeveragePolicy::Reject),
            "clamp" => Some(LeveragePolicy::Clamp),
            _ => None,
        }
    }
}

/// Static risk limits. All fractions are of equity.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    /// Maximum margin per symbol.
    pub max_position_fraction: Decimal,
    /// Maximum margin across all symbols.
    pub max_total_exposure_fraction: Decimal,
    pub max_concurrent_positions: usize,
    pub max_leverage: Decimal,
    pub leverage_policy: LeveragePolicy,
    /// Daily loss at which the kill switch trips.
    pub daily_loss_fraction: Decimal,
    /// Drawdown from peak at which the kill switch trips.
    pub max_drawdown_fraction: Decimal,
    pub min_confidence: Decimal,
    /// Allocation multiplier in reduced mode.
    pub reduced_allocation_factor: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_fraction: Decimal::new(10, 2),       // 10%
            max_total_exposure_fraction: Decimal::new(30, 2), // 30%
            max_concurrent_positions: 3,
            max_leverage: Decimal::new(10, 0),
            leverage_policy: LeveragePolicy::Reject,
            daily_loss_fraction: Decimal::new(5, 2),    // 5%
            max_drawdown_fraction: Decimal::new(15, 2), // 15%
            min_confidence: Decimal::new(7, 1),         // 0.7
            reduced_allocation_factor: Decimal::new(5, 1), // 0.5
        }
    }
}

/// An account-level limit breach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Breach {
    DailyLoss { loss: Decimal, limit: Decimal },
    Drawdown { drawdown: Decimal, limit: Decimal },
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breach::DailyLoss { loss, limit } => write!(
                f,
                "Daily loss {}% >= limit {}%",
                pct(*loss),
                pct(*limit)
            ),
            Breach::Drawdown { drawdown, limit } => write!(
                f,
                "Drawdown {}% >= limit {}%",
                pct(*drawdown),
                pct(*limit)
            ),
        }
    }
}

fn pct(fraction: Decimal) -> Decimal {
    (fraction * Decimal::ONE_HUNDRED).round_dp(2)
}

/// Why a signal was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Account limits breached; every signal in the batch is rejected.
    LimitBreach(Breach),
    Invalid(String),
    LowConfidence { confidence: Decimal, min: Decimal },
    NoPositionToClose,
    CloseOnlyMode,
    NonPositiveEquity,
    OpposesOpenPosition { open_side: Side },
    LeverageExceeded { requested: Decimal, max: Decimal },
    PositionLimit { fraction: Decimal, max: Decimal },
    ExposureLimit { fraction: Decimal, max: Decimal },
    MaxConcurrent { max: usize },
}

impl RejectReason {
    /// Short code for logs and reports.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::LimitBreach(_) => "BREACH",
            RejectReason::Invalid(_) => "INVALID",
            RejectReason::LowConfidence { .. } => "CONFIDENCE",
            RejectReason::NoPositionToClose => "NO_POSITION",
            RejectReason::CloseOnlyMode => "CLOSE_ONLY",
            RejectReason::NonPositiveEquity => "EQUITY",
            RejectReason::OpposesOpenPosition { .. } => "OPPOSES",
            RejectReason::LeverageExceeded { .. } => "LEVERAGE",
            RejectReason::PositionLimit { .. } => "POS_LIMIT",
            RejectReason::ExposureLimit { .. } => "EXP_LIMIT",
            RejectReason::MaxConcurrent { .. } => "CONCURRENT",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::LimitBreach(b) => write!(f, "Limit breach: {}", b),
            RejectReason::Invalid(e) => write!(f, "Invalid signal: {}", e),
            RejectReason::LowConfidence { confidence, min } => {
                write!(f, "Confidence {} below minimum {}", confidence, min)
            }
            RejectReason::NoPositionToClose => write!(f, "No open position to close"),
            RejectReason::CloseOnlyMode => write!(f, "Entries blocked in close_only mode"),
            RejectReason::NonPositiveEquity => write!(f, "Equity is not positive"),
            RejectReason::OpposesOpenPosition { open_side } => {
                write!(f, "Opposes open {} position", open_side)
            }
            RejectReason::LeverageExceeded { requested, max } => {
                write!(f, "Leverage {}x exceeds max {}x", requested, max)
            }
            RejectReason::PositionLimit { fraction, max } => write!(
                f,
                "Position margin {}% > max {}%",
                pct(*fraction),
                pct(*max)
            ),
            RejectReason::ExposureLimit { fraction, max } => write!(
                f,
                "Total margin {}% > max {}%",
                pct(*fraction),
                pct(*max)
            ),
            RejectReason::MaxConcurrent { max } => {
                write!(f, "Already at {} concurrent positions", max)
            }
        }
    }
}

impl From<SignalError> for RejectReason {
    fn from(e: SignalError) -> Self {
        RejectReason::Invalid(e.to_string())
    }
}

/// A signal cleared for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedSignal {
    /// The signal as it should be executed (leverage may be clamped).
    pub signal: Signal,
    /// Margin fraction of equity to commit. Zero for closes.
    pub allocation: Decimal,
    /// Adjustments applied on the way through.
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedSignal {
    pub signal: Signal,
    pub reason: RejectReason,
}

/// Result of one batch evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskAssessment {
    pub approved: Vec<ApprovedSignal>,
    pub rejected: Vec<RejectedSignal>,
    /// Hold signals dropped without evaluation.
    pub dropped_holds: usize,
    pub breach: Option<Breach>,
}

/// Account inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    pub equity: Decimal,
    pub positions: &'a [Position],
    pub daily_pnl: Option<&'a DailyPnl>,
    pub mode: ExecutionMode,
}

/// Equity below this fraction of the start-of-day equity is treated as a bad
/// read rather than a loss.
pub const EQUITY_SANITY_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 10%

/// `false` when `equity` is under [`EQUITY_SANITY_FRACTION`] of the day's start.
pub fn equity_is_plausible(daily_pnl: &DailyPnl, equity: Decimal) -> bool {
    daily_pnl.start_of_day_equity <= Decimal::ZERO
        || equity >= daily_pnl.start_of_day_equity * EQUITY_SANITY_FRACTION
}

/// Check daily loss and drawdown. `None` when within limits.
///
/// Daily loss = −(realized + unrealized) / equity.
/// Drawdown = (peak − equity) / peak.
///
/// Skipped when equity fails [`equity_is_plausible`].
pub fn check_limits(
    daily_pnl: Option<&DailyPnl>,
    equity: Decimal,
    limits: &RiskLimits,
) -> Option<Breach> {
    let pnl = daily_pnl?;

    if !equity_is_plausible(pnl, equity) {
        warn!(
            %equity,
            start = %pnl.start_of_day_equity,
            "Equity below sanity floor, likely stale data, skipping limit checks"
        );
        return None;
    }

    if let Some(loss) = fraction_of(-pnl.total_pnl(), equity)
        && loss >= limits.daily_loss_fraction
    {
        return Some(Breach::DailyLoss {
            loss,
            limit: limits.daily_loss_fraction,
        });
    }

    if pnl.peak_equity > Decimal::ZERO {
        let drawdown = (pnl.peak_equity - equity) / pnl.peak_equity;
        if drawdown >= limits.max_drawdown_fraction {
            return Some(Breach::Drawdown {
                drawdown,
                limit: limits.max_drawdown_fraction,
            });
        }
    }

    None
}

/// Running budgets for one batch.
#[derive(Default)]
struct BatchBudget {
    symbol_margin: BTreeMap<String, Decimal>,
    symbol_side: BTreeMap<String, Side>,
    total_margin: Decimal,
    closed: BTreeSet<String>,
}

/// Pure evaluator over static limits.
#[derive(Debug, Clone, Default)]
pub struct RiskEvaluator {
    limits: RiskLimits,
}

impl RiskEvaluator {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Evaluate `signals` and activate the kill switch on a limit breach.
    pub fn evaluate(
        &self,
        kill_switch: &KillSwitch,
        inputs: RiskInputs<'_>,
        signals: Vec<Signal>,
    ) -> Result<RiskAssessment, KillSwitchError> {
        let assessment = self.assess(inputs, signals);
        if let Some(breach) = &assessment.breach {
            kill_switch.activate(&breach.to_string())?;
        }
        Ok(assessment)
    }

    /// Evaluate without side effects.
    pub fn assess(&self, inputs: RiskInputs<'_>, signals: Vec<Signal>) -> RiskAssessment {
        let mut out = RiskAssessment::default();

        if let Some(breach) = check_limits(inputs.daily_pnl, inputs.equity, &self.limits) {
            info!(%breach, signals = signals.len(), "Risk limit breached, rejecting batch");
            out.rejected = signals
                .into_iter()
                .map(|signal| RejectedSignal {
                    signal,
                    reason: RejectReason::LimitBreach(breach.clone()),
                })
                .collect();
            out.breach = Some(breach);
            return out;
        }

        let mut budget = BatchBudget::default();
        for signal in signals {
            if signal.action == Action::Hold {
                out.dropped_holds += 1;
                continue;
            }
            match self.check_signal(&inputs, &mut budget, signal.clone()) {
                Ok(approved) => {
                    debug!(
                        symbol = %approved.signal.symbol,
                        action = %approved.signal.action,
                        allocation = %approved.allocation,
                        "Signal approved"
                    );
                    out.approved.push(approved);
                }
                Err(reason) => {
                    debug!(
                        symbol = %signal.symbol,
                        code = reason.code(),
                        %reason,
                        "Signal rejected"
                    );
                    out.rejected.push(RejectedSignal { signal, reason });
                }
            }
        }
        out
    }

    fn check_signal(
        &self,
        inputs: &RiskInputs<'_>,
        budget: &mut BatchBudget,
        mut signal: Signal,
    ) -> Result<ApprovedSignal, RejectReason> {
        let limits = &self.limits;
        signal.validate()?;

        if signal.confidence < limits.min_confidence {
            return Err(RejectReason::LowConfidence {
                confidence: signal.confidence,
                min: limits.min_confidence,
            });
        }

        let open = inputs.positions.iter().find(|p| p.symbol == signal.symbol);

        let Some(side) = signal.action.side() else {
            // Close: reduces risk, skips exposure checks.
            if open.is_none() || budget.closed.contains(&signal.symbol) {
                return Err(RejectReason::NoPositionToClose);
            }
            budget.closed.insert(signal.symbol.clone());
            return Ok(ApprovedSignal {
                signal,
                allocation: Decimal::ZERO,
                notes: Vec::new(),
            });
        };

        if !inputs.mode.allows_entries() {
            return Err(RejectReason::CloseOnlyMode);
        }
        if inputs.equity <= Decimal::ZERO {
            return Err(RejectReason::NonPositiveEquity);
        }

        let existing_side = open
            .map(|p| p.side)
            .or_else(|| budget.symbol_side.get(&signal.symbol).copied());
        if let Some(open_side) = existing_side
            && open_side != side
        {
            return Err(RejectReason::OpposesOpenPosition { open_side });
        }

        let mut notes = Vec::new();
        if signal.leverage > limits.max_leverage {
            match limits.leverage_policy {
                LeveragePolicy::Reject => {
                    return Err(RejectReason::LeverageExceeded {
                        requested: signal.leverage,
                        max: limits.max_leverage,
                    });
                }
                LeveragePolicy::Clamp => {
                    notes.push(format!(
                        "leverage clamped {}x -> {}x",
                        signal.leverage, limits.max_leverage
                    ));
                    signal.leverage = limits.max_leverage;
                }
            }
        }

        let mut allocation = signal.allocation.unwrap_or(limits.max_position_fraction);
        if inputs.mode == ExecutionMode::Reduced {
            let reduced = allocation * limits.reduced_allocation_factor;
            notes.push(format!("allocation reduced {} -> {}", allocation, reduced));
            allocation = reduced;
        }
        let margin = allocation * inputs.equity;

        let batch_symbol = budget
            .symbol_margin
            .get(&signal.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let symbol_total = symbol_margin(inputs.positions, &signal.symbol) + batch_symbol + margin;
        let symbol_fraction = symbol_total / inputs.equity;
        if symbol_fraction > limits.max_position_fraction {
            return Err(RejectReason::PositionLimit {
                fraction: symbol_fraction,
                max: limits.max_position_fraction,
            });
        }

        let aggregate = total_margin(inputs.positions) + budget.total_margin + margin;
        let aggregate_fraction = aggregate / inputs.equity;
        if aggregate_fraction > limits.max_total_exposure_fraction {
            return Err(RejectReason::ExposureLimit {
                fraction: aggregate_fraction,
                max: limits.max_total_exposure_fraction,
            });
        }

        let is_new_symbol =
            open.is_none() && !budget.symbol_margin.contains_key(&signal.symbol);
        if is_new_symbol {
            let distinct: BTreeSet<&str> = inputs
                .positions
                .iter()
                .map(|p| p.symbol.as_str())
                .chain(budget.symbol_margin.keys().map(String::as_str))
                .collect();
            if distinct.len() >= limits.max_concurrent_positions {
                return Err(RejectReason::MaxConcurrent {
                    max: limits.max_concurrent_positions,
                });
            }
        }

        *budget
            .symbol_margin
            .entry(signal.symbol.clone())
            .or_insert(Decimal::ZERO) += margin;
        budget.symbol_side.insert(signal.symbol.clone(), side);
        budget.total_margin += margin;

        Ok(ApprovedSignal {
            signal,
            allocation,
            notes,
        })
    }
}
