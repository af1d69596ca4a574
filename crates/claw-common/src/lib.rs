//! Shared data model for the claw trading loop.
//!
//! This crate contains the record types exchanged between the reasoning
//! boundary, the risk core, the state store and the guardrail:
//! - Signals and decision action types
//! - Positions, daily P&L and the kill-switch record
//! - Data health verdicts
//! - Improvement queue items and history records

pub mod types;

pub use types::*;
