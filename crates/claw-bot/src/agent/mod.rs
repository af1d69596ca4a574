//! External agent boundary.
//!
//! Three roles sit behind async traits:
//! - `ReasoningAgent`: produces the cycle decision
//! - `CodeAgent`: edits the repository for one improvement item
//! - `AuditAgent`: reviews recent history and proposes improvement items
//!
//! The `cli` module implements all three by spawning the configured agent
//! command. Agents return raw text; `parse` turns it into typed values.

pub mod cli;
pub mod parse;

pub use cli::{AgentCli, CliAuditAgent, CliCodeAgent, CliReasoningAgent};
pub use parse::{extract_json, parse_decision, Decision, DecisionParseError, ImprovementRequest};

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use claw_common::{
    DailyPnl, DataHealthStatus, ExecutionMode, ImprovementItem, OodaLogEntry, Position,
    TradeRecord,
};

use crate::market::MarketSnapshot;
use crate::performance::PerformanceStats;
use crate::store::StoreError;

/// Errors from an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Agent produced no output")]
    EmptyOutput,

    #[error("Agent session state unavailable: {0}")]
    Session(#[from] StoreError),
}

/// Whether a reasoning call continues the persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Resume,
    Fresh,
}

/// Everything the reasoning agent sees for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub cycle_id: Uuid,
    pub execution_mode: ExecutionMode,
    pub equity: Decimal,
    pub positions: Vec<Position>,
    pub daily_pnl: Option<DailyPnl>,
    pub health: DataHealthStatus,
    pub snapshot: Option<MarketSnapshot>,
    pub recent_cycles: Vec<OodaLogEntry>,
    pub recent_trades: Vec<TradeRecord>,
}

impl DecisionRequest {
    /// Prompt text handed to the agent.
    pub fn to_prompt(&self) -> String {
        let context = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        format!(
            "Trading cycle {id}. Execution mode: {mode}.\n\
             Respond with one JSON object: {{\"action_type\": \"trade|hold|self_improve|journal|research\", \
             \"signals\": [...], \"market_summary\": \"...\", \"self_assessment\": \"...\", \
             \"journal_entry\": \"...\", \"research_topic\": \"...\", \
             \"improvement\": {{\"task\": \"...\", \"priority\": \"low|medium|high|critical\", \"target_file\": \"...\"}}}}\n\n\
             Context:\n{context}\n",
            id = self.cycle_id,
            mode = self.execution_mode,
        )
    }
}

/// Path rules a code agent is told about.
#[derive(Debug, Clone, Serialize)]
pub struct CodeTask {
    pub item: ImprovementItem,
    pub allowed_paths: Vec<String>,
    pub forbidden_paths: Vec<String>,
}

impl CodeTask {
    pub fn to_prompt(&self) -> String {
        format!(
            "Improvement task {id} (priority {priority:?}):\n{task}\n\n\
             Target file: {target}\n\
             You may only modify paths matching: {allowed}\n\
             Never touch paths matching: {forbidden}\n\
             Commit your change with a descriptive message when done.\n",
            id = self.item.id,
            priority = self.item.priority,
            task = self.item.task,
            target = self.item.target_file.as_deref().unwrap_or("(any allowed)"),
            allowed = self.allowed_paths.join(", "),
            forbidden = self.forbidden_paths.join(", "),
        )
    }
}

/// Input to an audit pass.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRequest {
    pub recent_cycles: Vec<OodaLogEntry>,
    pub recent_trades: Vec<TradeRecord>,
    pub recent_health: Vec<DataHealthStatus>,
    /// Over the whole trade history.
    pub performance: PerformanceStats,
    pub pending_tasks: Vec<String>,
}

impl AuditRequest {
    pub fn to_prompt(&self) -> String {
        let context = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        format!(
            "Review the recent behaviour of the trading loop.\n\
             Respond with one JSON object: {{\"findings\": [{{\"task\": \"...\", \
             \"priority\": \"low|medium|high|critical\", \"target_file\": \"...\", \"critical\": false}}]}}\n\n\
             Context:\n{context}\n"
        )
    }
}

#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Produce raw decision text for one cycle.
    async fn decide(
        &self,
        request: &DecisionRequest,
        session: SessionMode,
    ) -> Result<String, AgentError>;
}

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Work on one improvement item inside the repository.
    async fn apply(&self, task: &CodeTask) -> Result<String, AgentError>;
}

#[async_trait]
pub trait AuditAgent: Send + Sync {
    async fn audit(&self, request: &AuditRequest) -> Result<String, AgentError>;
}
