//! Daemon loop.
//!
//! Runs one cycle per interval until shutdown. A cycle in flight when the
//! shutdown arrives is allowed to finish. Cycle failures never stop the loop:
//! once the consecutive failure count reaches the threshold every further
//! failing cycle alerts, until one succeeds.
//!
//! The Coder pass runs after a cycle that asks for it or an audit that
//! queued new items.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::alert::{Alert, Alerter};
use crate::audit::{AuditPass, AuditReport};
use crate::cycle::{CycleReport, CycleRunner};
use crate::guardrail::{Guardrail, GuardrailOutcome};
use crate::risk::KillSwitch;
use crate::store::{DaemonState, StateStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub interval: Duration,
    /// Consecutive failures before the standing alert starts.
    pub failure_alert_threshold: u32,
    /// Also activate the kill switch at the threshold.
    pub trip_kill_switch_on_failures: bool,
    /// Run the audit pass every N cycles; 0 disables it.
    pub audit_every_cycles: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            failure_alert_threshold: 3,
            trip_kill_switch_on_failures: false,
            audit_every_cycles: 12,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub report: CycleReport,
    pub state: DaemonState,
    pub alerted: bool,
    pub guardrail: Option<GuardrailOutcome>,
    pub audit: Option<AuditReport>,
}

pub struct Daemon {
    config: DaemonConfig,
    runner: Arc<dyn CycleRunner>,
    store: StateStore,
    kill_switch: KillSwitch,
    alerter: Arc<dyn Alerter>,
    guardrail: Option<Arc<Guardrail>>,
    audit: Option<AuditPass>,
    /// Last known state, used when the store cannot be written.
    fallback: Mutex<DaemonState>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        runner: Arc<dyn CycleRunner>,
        store: StateStore,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let fallback = store.daemon_state().unwrap_or_else(|e| {
            warn!(error = %e, "Daemon state unreadable, starting fresh");
            DaemonState::default()
        });
        Self {
            config,
            runner,
            kill_switch: KillSwitch::new(store.clone()),
            store,
            alerter,
            guardrail: None,
            audit: None,
            fallback: Mutex::new(fallback),
        }
    }

    pub fn with_guardrail(mut self, guardrail: Arc<Guardrail>) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    pub fn with_audit(mut self, audit: AuditPass) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run until `shutdown` fires or its sender is dropped.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            failure_alert_threshold = self.config.failure_alert_threshold,
            trip_kill_switch = self.config.trip_kill_switch_on_failures,
            "Daemon started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutdown requested, daemon stopping");
                    break;
                }
            }
        }
    }

    /// One cycle plus its follow-up passes.
    pub async fn tick(&self) -> TickOutcome {
        let report = self.runner.run_cycle().await;
        let state = self.record(&report);

        let mut alerted = false;
        if report.status.is_failure() && state.consecutive_failures >= self.config.failure_alert_threshold {
            alerted = true;
            error!(
                consecutive_failures = state.consecutive_failures,
                status = %report.status,
                "Repeated cycle failures"
            );
            self.alerter
                .send(&Alert::critical(
                    "cycle_failures",
                    format!(
                        "{} consecutive cycle failures, last: {}",
                        state.consecutive_failures, report.status
                    ),
                ))
                .await;

            if self.config.trip_kill_switch_on_failures
                && !self.kill_switch.is_active()
                && let Err(e) = self.kill_switch.activate(&format!(
                    "{} consecutive cycle failures",
                    state.consecutive_failures
                ))
            {
                error!(error = %e, "Failed to activate kill switch");
            }
        }

        let audit = match &self.audit {
            Some(pass)
                if self.config.audit_every_cycles > 0
                    && state.cycles_run % self.config.audit_every_cycles == 0 =>
            {
                match pass.run().await {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!(error = %e, "Audit pass failed");
                        None
                    }
                }
            }
            _ => None,
        };

        let queued = audit.as_ref().is_some_and(|a| !a.enqueued.is_empty());
        let guardrail = match &self.guardrail {
            Some(g) if report.coder_requested || queued => match g.run_next().await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Coder pass failed");
                    None
                }
            },
            _ => None,
        };

        TickOutcome {
            report,
            state,
            alerted,
            guardrail,
            audit,
        }
    }

    fn record(&self, report: &CycleReport) -> DaemonState {
        let failed = report.status.is_failure();
        let now = Utc::now();
        let apply = |s: &mut DaemonState| {
            s.cycles_run += 1;
            if failed {
                s.consecutive_failures += 1;
                s.last_failure = Some(report.status.to_string());
                s.last_failure_at = Some(now);
            } else {
                s.consecutive_failures = 0;
                s.last_success_at = Some(now);
            }
            s.clone()
        };

        let state = match self.store.update_daemon_state(apply) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to persist daemon state");
                let mut local = self.fallback.lock();
                apply(&mut *local)
            }
        };
        *self.fallback.lock() = state.clone();
        state
    }
}
