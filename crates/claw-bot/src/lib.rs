//! Safety and orchestration core for an agent-driven trading loop.
//!
//! An external reasoning agent proposes trades; this crate decides whether
//! any of them may reach the exchange, and keeps the loop alive and honest
//! while it runs unattended.
//!
//! ## Modules
//!
//! - `store`: atomic, file-locked JSON state shared across processes
//! - `risk`: kill switch, equity derivation and signal evaluation
//! - `health`: data health verdict that demotes the execution mode
//! - `cycle`: the OODA cycle orchestrator
//! - `executor`: order execution for approved signals
//! - `performance`: win rate and profit factor over closed trades
//! - `guardrail`: sandboxed self-modification by a code agent
//! - `audit`: periodic reviewer pass that queues improvements
//! - `daemon`: fixed-interval loop with failure tracking
//! - `agent`, `exchange`, `market`, `alert`: external boundaries
//! - `config`, `app`: configuration and component wiring

pub mod agent;
pub mod alert;
pub mod app;
pub mod audit;
pub mod config;
pub mod cycle;
pub mod daemon;
pub mod exchange;
pub mod executor;
pub mod guardrail;
pub mod health;
pub mod market;
pub mod performance;
pub mod retry;
pub mod risk;
pub mod store;

pub use config::BotConfig;
pub use cycle::{CycleOrchestrator, CycleReport, CycleRunner, CycleStatus};
pub use daemon::{Daemon, DaemonConfig};
pub use guardrail::{Guardrail, GuardrailOutcome};
pub use risk::{KillSwitch, RiskEvaluator, RiskLimits};
pub use store::{StateStore, StoreError};
