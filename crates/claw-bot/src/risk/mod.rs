//! Risk core: kill switch, equity derivation and signal evaluation.
//!
//! - `kill_switch`: persisted trading gate, fails closed
//! - `equity`: the single equity and margin computation
//! - `evaluator`: batch evaluation of signals against static limits

pub mod equity;
pub mod evaluator;
pub mod kill_switch;

pub use equity::compute_equity;
pub use evaluator::{
    check_limits, equity_is_plausible, ApprovedSignal, Breach, LeveragePolicy, RejectReason, RejectedSignal,
    RiskAssessment, RiskEvaluator, RiskInputs, RiskLimits,
};
pub use kill_switch::{KillSwitch, KillSwitchError};
