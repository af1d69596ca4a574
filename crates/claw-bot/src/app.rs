//! Component wiring from a [`BotConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::agent::{AgentCli, CliAuditAgent, CliCodeAgent, CliReasoningAgent};
use crate::alert::{Alerter, FanoutAlerter, LogAlerter, TelegramAlerter, WebhookAlerter};
use crate::audit::AuditPass;
use crate::config::{AlertsConfig, BotConfig};
use crate::cycle::{CycleOrchestrator, CycleServices};
use crate::daemon::Daemon;
use crate::exchange::PaperExchange;
use crate::guardrail::{GitVcs, Guardrail};
use crate::health::HealthMonitor;
use crate::market::FileMarketSource;
use crate::risk::{KillSwitch, RiskEvaluator};
use crate::store::StateStore;

/// Log plus every configured remote transport.
pub fn build_alerter(config: &AlertsConfig) -> Arc<dyn Alerter> {
    let mut fanout = FanoutAlerter::new(vec![Arc::new(LogAlerter)]);
    if let Some(url) = &config.webhook_url {
        fanout.push(Arc::new(WebhookAlerter::new(url.clone())));
    }
    if let Some((token, chat)) = config.telegram() {
        fanout.push(Arc::new(TelegramAlerter::new(token, chat)));
    }
    info!(transports = fanout.len(), "Alerting configured");
    Arc::new(fanout)
}

pub struct App {
    pub config: BotConfig,
    pub store: StateStore,
    pub kill_switch: KillSwitch,
    pub alerter: Arc<dyn Alerter>,
}

impl App {
    pub fn new(config: BotConfig) -> Result<Self> {
        let store = StateStore::open(&config.paths.state_dir).with_context(|| {
            format!("Failed to open state directory {:?}", config.paths.state_dir)
        })?;
        let alerter = build_alerter(&config.alerts);
        Ok(Self {
            kill_switch: KillSwitch::new(store.clone()),
            config,
            store,
            alerter,
        })
    }

    fn agent_cli(&self) -> AgentCli {
        let agent = &self.config.agent;
        AgentCli::new(&agent.command, agent.args.clone(), self.config.cycle.agent_timeout)
            .with_model(agent.model.clone())
            .with_session_flags(&agent.session_flag, &agent.resume_flag)
    }

    pub fn orchestrator(&self) -> Result<CycleOrchestrator> {
        let config = &self.config;
        let exchange = PaperExchange::persistent(
            self.store.clone(),
            config.paper.initial_collateral,
            config.paper.fee_rate,
        )
        .context("Failed to load paper account")?;
        let market = FileMarketSource::new(&config.paths.market_data).with_refresh(
            config.cycle.collector_command.clone(),
            config.cycle.collector_timeout,
        );
        let agent = CliReasoningAgent::new(self.agent_cli(), self.store.clone(), config.agent.session_ttl);

        let services = CycleServices {
            exchange: Arc::new(exchange),
            market: Arc::new(market),
            agent: Arc::new(agent),
            alerter: self.alerter.clone(),
        };
        Ok(CycleOrchestrator::new(
            config.cycle.cycle_config(&config.paths.journal_dir),
            self.store.clone(),
            RiskEvaluator::new(config.risk.clone()),
            HealthMonitor::new(config.health.clone()),
            services,
        ))
    }

    pub fn guardrail(&self) -> Result<Guardrail> {
        let g = &self.config.guardrail;
        let coder = CliCodeAgent::new(
            self.agent_cli()
                .with_workdir(&g.repo_dir)
                .with_timeout(g.agent_timeout),
        );
        Guardrail::new(
            g.clone(),
            self.store.clone(),
            Arc::new(coder),
            Arc::new(GitVcs::new(&g.repo_dir)),
            self.alerter.clone(),
        )
        .context("Invalid guardrail configuration")
    }

    pub fn audit(&self) -> AuditPass {
        let agent = &self.config.agent;
        AuditPass::new(
            self.store.clone(),
            Arc::new(CliAuditAgent::new(self.agent_cli().with_timeout(agent.audit_timeout))),
            self.alerter.clone(),
            agent.audit_timeout,
            agent.audit_window,
        )
    }

    pub fn daemon(&self) -> Result<Daemon> {
        let mut daemon = Daemon::new(
            self.config.daemon.clone(),
            Arc::new(self.orchestrator()?),
            self.store.clone(),
            self.alerter.clone(),
        )
        .with_audit(self.audit());
        if self.config.guardrail_enabled {
            daemon = daemon.with_guardrail(Arc::new(self.guardrail()?));
        }
        Ok(daemon)
    }
}
