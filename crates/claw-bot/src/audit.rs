//! Reviewer pass.
//!
//! Periodically hands recent cycle, trade and health history, plus trade
//! performance, to the audit agent and turns its findings into pending
//! improvement items.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use claw_common::{ImprovementItem, ImprovementStatus, Priority};

use crate::agent::{extract_json, AgentError, AuditAgent, AuditRequest, DecisionParseError};
use crate::alert::{Alert, Alerter};
use crate::performance::PerformanceStats;
use crate::store::{StateStore, StoreError};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Audit agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid audit output: {0}")]
    Parse(#[from] DecisionParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Finding {
    pub task: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub target_file: Option<String>,
    #[serde(default)]
    pub critical: bool,
}

fn default_priority() -> Priority {
    Priority::Medium
}

#[derive(Debug, Deserialize)]
struct AuditResponse {
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Parse audit agent output; blank tasks are dropped.
pub fn parse_findings(raw: &str) -> Result<Vec<Finding>, DecisionParseError> {
    let json = extract_json(raw)?;
    let response: AuditResponse = serde_json::from_str(json)?;
    Ok(response
        .findings
        .into_iter()
        .filter(|f| !f.task.trim().is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub findings: usize,
    pub enqueued: Vec<ImprovementItem>,
    pub critical: usize,
}

pub struct AuditPass {
    store: StateStore,
    agent: Arc<dyn AuditAgent>,
    alerter: Arc<dyn Alerter>,
    timeout: Duration,
    window: usize,
}

impl AuditPass {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AuditAgent>,
        alerter: Arc<dyn Alerter>,
        timeout: Duration,
        window: usize,
    ) -> Self {
        Self {
            store,
            agent,
            alerter,
            timeout,
            window,
        }
    }

    pub async fn run(&self) -> Result<AuditReport, AuditError> {
        let window = self.window;
        let trades = self.store.trade_history()?;
        let health = self.store.health_history()?;
        let request = AuditRequest {
            recent_cycles: self.store.recent_ooda(window)?,
            recent_trades: trades[trades.len().saturating_sub(window)..].to_vec(),
            recent_health: health[health.len().saturating_sub(window)..].to_vec(),
            performance: PerformanceStats::from_trades(&trades),
            pending_tasks: self
                .store
                .improvement_queue()?
                .into_iter()
                .filter(|i| i.status == ImprovementStatus::Pending)
                .map(|i| i.task)
                .collect(),
        };

        let raw = tokio::time::timeout(self.timeout, self.agent.audit(&request))
            .await
            .map_err(|_| AuditError::Timeout(self.timeout))??;
        let findings = parse_findings(&raw)?;

        let mut report = AuditReport {
            findings: findings.len(),
            ..AuditReport::default()
        };
        for finding in findings {
            if finding.critical {
                report.critical += 1;
                self.alerter
                    .send(&Alert::critical(
                        "audit_finding",
                        format!("Audit: {}", finding.task.trim()),
                    ))
                    .await;
            }
            let item = ImprovementItem::new(finding.task.trim(), finding.priority, finding.target_file);
            if self.store.enqueue_improvement(item.clone())? {
                report.enqueued.push(item);
            }
        }

        if report.findings == 0 {
            info!("Audit found nothing");
        } else {
            info!(
                findings = report.findings,
                enqueued = report.enqueued.len(),
                critical = report.critical,
                "Audit complete"
            );
        }
        if report.critical > 0 {
            warn!(critical = report.critical, "Audit raised critical findings");
        }
        Ok(report)
    }
}
