//! Configuration for claw-bot.
//!
//! Loaded from TOML with environment variable overrides for secrets and
//! deployment paths. Percentages in the file become `Decimal` fractions.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::cycle::CycleConfig;
use crate::daemon::DaemonConfig;
use crate::guardrail::{GuardrailConfig, PathPolicy, TaskScreen};
use crate::health::HealthConfig;
use crate::retry::RetryPolicy;
use crate::risk::{LeveragePolicy, RiskLimits};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub log_level: String,
    pub paths: PathsConfig,
    pub risk: RiskLimits,
    pub cycle: CycleSettings,
    pub health: HealthConfig,
    pub agent: AgentConfig,
    /// Run the Coder pass when a cycle requests it.
    pub guardrail_enabled: bool,
    pub guardrail: GuardrailConfig,
    pub alerts: AlertsConfig,
    pub daemon: DaemonConfig,
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub journal_dir: PathBuf,
    /// JSON written by the market data collector.
    pub market_data: PathBuf,
    /// Working tree the code agent edits.
    pub repo_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("../claw-state"),
            journal_dir: PathBuf::from("journal"),
            market_data: PathBuf::from("data/market.json"),
            repo_dir: PathBuf::from("."),
        }
    }
}

/// Cycle timing and retry parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSettings {
    pub exchange_timeout: Duration,
    pub agent_timeout: Duration,
    pub retry: RetryPolicy,
    pub context_window: usize,
    pub alert_cooldown: chrono::Duration,
    /// Command that refreshes the market data file; empty reads it as is.
    pub collector_command: Vec<String>,
    pub collector_timeout: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        let base = CycleConfig::default();
        Self {
            exchange_timeout: base.exchange_timeout,
            agent_timeout: base.agent_timeout,
            retry: base.retry,
            context_window: base.context_window,
            alert_cooldown: base.alert_cooldown,
            collector_command: Vec::new(),
            collector_timeout: Duration::from_secs(120),
        }
    }
}

impl CycleSettings {
    pub fn cycle_config(&self, journal_dir: &Path) -> CycleConfig {
        CycleConfig {
            agent_timeout: self.agent_timeout,
            exchange_timeout: self.exchange_timeout,
            retry: self.retry.clone(),
            journal_dir: journal_dir.to_path_buf(),
            context_window: self.context_window,
            alert_cooldown: self.alert_cooldown,
        }
    }
}

/// External agent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub session_flag: String,
    pub resume_flag: String,
    /// Reasoning sessions older than this start fresh.
    pub session_ttl: chrono::Duration,
    pub audit_timeout: Duration,
    /// History entries handed to the audit agent.
    pub audit_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: None,
            session_flag: "--session-id".to_string(),
            resume_flag: "--resume".to_string(),
            session_ttl: chrono::Duration::hours(24),
            audit_timeout: Duration::from_secs(600),
            audit_window: 50,
        }
    }
}

/// Alert transports. Secrets come from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertsConfig {
    pub webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl AlertsConfig {
    pub fn telegram(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token, chat)),
            _ => None,
        }
    }
}

/// In-process paper exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperConfig {
    pub initial_collateral: Decimal,
    pub fee_rate: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_collateral: Decimal::new(10_000, 0),
            fee_rate: Decimal::new(5, 4), // 0.05%
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            paths: PathsConfig::default(),
            risk: RiskLimits::default(),
            cycle: CycleSettings::default(),
            health: HealthConfig::default(),
            agent: AgentConfig::default(),
            guardrail_enabled: true,
            guardrail: GuardrailConfig::default(),
            alerts: AlertsConfig::default(),
            daemon: DaemonConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Self::try_from(file)
    }

    /// Apply environment overrides for secrets and deployment paths.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("ALERT_WEBHOOK_URL") {
            self.alerts.webhook_url = Some(url);
        }
        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.alerts.telegram_bot_token = Some(token);
        }
        if let Some(chat) = non_empty("TELEGRAM_CHAT_ID") {
            self.alerts.telegram_chat_id = Some(chat);
        }
        if let Some(dir) = non_empty("CLAW_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = non_empty("CLAW_AGENT_COMMAND") {
            self.agent.command = cmd;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        state_dir: Option<PathBuf>,
        log_level: Option<String>,
        interval_secs: Option<u64>,
    ) {
        if let Some(dir) = state_dir {
            self.paths.state_dir = dir;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if let Some(secs) = interval_secs {
            self.daemon.interval = Duration::from_secs(secs);
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        let risk = &self.risk;
        let fraction = |name: &str, v: Decimal| -> Result<()> {
            if v <= Decimal::ZERO || v > Decimal::ONE {
                bail!("{} must be between 0 and 100%", name);
            }
            Ok(())
        };
        fraction("max_position_pct", risk.max_position_fraction)?;
        fraction("max_total_exposure_pct", risk.max_total_exposure_fraction)?;
        fraction("daily_loss_pct", risk.daily_loss_fraction)?;
        fraction("max_drawdown_pct", risk.max_drawdown_fraction)?;
        fraction("reduced_allocation_factor", risk.reduced_allocation_factor)?;

        if risk.max_position_fraction > risk.max_total_exposure_fraction {
            bail!("max_position_pct cannot exceed max_total_exposure_pct");
        }
        if risk.max_concurrent_positions == 0 {
            bail!("max_concurrent_positions must be at least 1");
        }
        if risk.max_leverage < Decimal::ONE {
            bail!("max_leverage must be at least 1");
        }
        if risk.min_confidence < Decimal::ZERO || risk.min_confidence > Decimal::ONE {
            bail!("min_confidence must be between 0 and 1");
        }

        if self.health.required_symbols.is_empty() {
            bail!("At least one required symbol must be configured");
        }
        if self.health.max_staleness <= chrono::Duration::zero() {
            bail!("max_staleness_secs must be positive");
        }

        if self.daemon.interval.is_zero() {
            bail!("daemon interval_secs must be positive");
        }
        if self.daemon.failure_alert_threshold == 0 {
            bail!("failure_alert_threshold must be at least 1");
        }

        if self.agent.command.trim().is_empty() {
            bail!("agent command must not be empty");
        }
        if self.cycle.agent_timeout.is_zero() || self.cycle.exchange_timeout.is_zero() {
            bail!("cycle timeouts must be positive");
        }

        if self.paper.initial_collateral <= Decimal::ZERO {
            bail!("paper initial_collateral must be positive");
        }
        if self.paper.fee_rate < Decimal::ZERO {
            bail!("paper fee_pct must not be negative");
        }

        if self.guardrail_enabled {
            let repo = resolve(&self.paths.repo_dir)?;
            let state = resolve(&self.paths.state_dir)?;
            if state.starts_with(&repo) {
                bail!(
                    "state_dir {} must be outside repo_dir {} while the guardrail is enabled",
                    state.display(),
                    repo.display()
                );
            }
            if self.guardrail.allowed_paths.is_empty() {
                bail!("guardrail allowed_paths must not be empty");
            }
            PathPolicy::new(&self.guardrail.allowed_paths, &self.guardrail.forbidden_paths)
                .context("Invalid guardrail path glob")?;
            TaskScreen::new(
                self.guardrail.max_task_age,
                self.guardrail.max_task_chars,
                &self.guardrail.denylist,
            )
            .context("Invalid guardrail denylist pattern")?;
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    paths: PathsToml,
    #[serde(default)]
    risk: RiskToml,
    #[serde(default)]
    cycle: CycleToml,
    #[serde(default)]
    health: HealthToml,
    #[serde(default)]
    agent: AgentToml,
    #[serde(default)]
    guardrail: GuardrailToml,
    #[serde(default)]
    alerts: AlertsToml,
    #[serde(default)]
    daemon: DaemonToml,
    #[serde(default)]
    paper: PaperToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PathsToml {
    state_dir: PathBuf,
    journal_dir: PathBuf,
    market_data: PathBuf,
    repo_dir: PathBuf,
}

impl Default for PathsToml {
    fn default() -> Self {
        let d = PathsConfig::default();
        Self {
            state_dir: d.state_dir,
            journal_dir: d.journal_dir,
            market_data: d.market_data,
            repo_dir: d.repo_dir,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RiskToml {
    max_position_pct: f64,
    max_total_exposure_pct: f64,
    max_concurrent_positions: usize,
    max_leverage: f64,
    leverage_policy: String,
    daily_loss_pct: f64,
    max_drawdown_pct: f64,
    min_confidence: f64,
    reduced_allocation_factor: f64,
}

impl Default for RiskToml {
    fn default() -> Self {
        Self {
            max_position_pct: 10.0,
            max_total_exposure_pct: 30.0,
            max_concurrent_positions: 3,
            max_leverage: 10.0,
            leverage_policy: "reject".to_string(),
            daily_loss_pct: 5.0,
            max_drawdown_pct: 15.0,
            min_confidence: 0.7,
            reduced_allocation_factor: 0.5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CycleToml {
    exchange_timeout_secs: u64,
    agent_timeout_secs: u64,
    max_retries: u32,
    retry_base_delay_ms: u64,
    retry_factor: u32,
    retry_max_delay_ms: u64,
    context_window: usize,
    alert_cooldown_secs: i64,
    collector_command: Vec<String>,
    collector_timeout_secs: u64,
}

impl Default for CycleToml {
    fn default() -> Self {
        Self {
            exchange_timeout_secs: 30,
            agent_timeout_secs: 600,
            max_retries: 3,
            retry_base_delay_ms: 2_000,
            retry_factor: 2,
            retry_max_delay_ms: 30_000,
            context_window: 10,
            alert_cooldown_secs: 1800,
            collector_command: Vec::new(),
            collector_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HealthToml {
    required_symbols: Vec<String>,
    max_staleness_secs: i64,
    min_candles: BTreeMap<String, usize>,
    max_price_jump_pct: f64,
    max_equity_drift_pct: f64,
    alert_cooldown_secs: i64,
}

impl Default for HealthToml {
    fn default() -> Self {
        let d = HealthConfig::default();
        Self {
            required_symbols: d.required_symbols,
            max_staleness_secs: d.max_staleness.num_seconds(),
            min_candles: d.min_candles,
            max_price_jump_pct: 10.0,
            max_equity_drift_pct: 20.0,
            alert_cooldown_secs: d.alert_cooldown.num_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AgentToml {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    session_flag: String,
    resume_flag: String,
    session_ttl_hours: i64,
    audit_timeout_secs: u64,
    audit_window: usize,
}

impl Default for AgentToml {
    fn default() -> Self {
        let d = AgentConfig::default();
        Self {
            command: d.command,
            args: d.args,
            model: d.model,
            session_flag: d.session_flag,
            resume_flag: d.resume_flag,
            session_ttl_hours: d.session_ttl.num_hours(),
            audit_timeout_secs: d.audit_timeout.as_secs(),
            audit_window: d.audit_window,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GuardrailToml {
    enabled: bool,
    allowed_paths: Vec<String>,
    forbidden_paths: Vec<String>,
    /// Added to the built-in denylist.
    extra_denylist: Vec<String>,
    max_task_age_hours: i64,
    max_task_chars: usize,
    agent_timeout_secs: u64,
    check_command: Vec<String>,
    check_timeout_secs: u64,
}

impl Default for GuardrailToml {
    fn default() -> Self {
        let d = GuardrailConfig::default();
        Self {
            enabled: true,
            allowed_paths: d.allowed_paths,
            forbidden_paths: d.forbidden_paths,
            extra_denylist: Vec::new(),
            max_task_age_hours: d.max_task_age.num_hours(),
            max_task_chars: d.max_task_chars,
            agent_timeout_secs: d.agent_timeout.as_secs(),
            check_command: d.check_command,
            check_timeout_secs: d.check_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlertsToml {
    webhook_url: Option<String>,
    telegram_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DaemonToml {
    interval_secs: u64,
    failure_alert_threshold: u32,
    trip_kill_switch_on_failures: bool,
    audit_every_cycles: u64,
}

impl Default for DaemonToml {
    fn default() -> Self {
        let d = DaemonConfig::default();
        Self {
            interval_secs: d.interval.as_secs(),
            failure_alert_threshold: d.failure_alert_threshold,
            trip_kill_switch_on_failures: d.trip_kill_switch_on_failures,
            audit_every_cycles: d.audit_every_cycles,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PaperToml {
    initial_collateral: f64,
    fee_pct: f64,
}

impl Default for PaperToml {
    fn default() -> Self {
        Self {
            initial_collateral: 10_000.0,
            fee_pct: 0.05,
        }
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically.
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Cannot resolve path {}", path.display()))?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            c => out.push(c.as_os_str()),
        }
    }
    Ok(out)
}

/// Convert f64 percentage to Decimal ratio (e.g., 2.5 -> 0.025).
fn pct_to_decimal(pct: f64) -> Decimal {
    Decimal::try_from(pct / 100.0).unwrap_or(Decimal::ZERO)
}

/// Convert f64 to Decimal.
fn f64_to_decimal(val: f64) -> Decimal {
    Decimal::try_from(val).unwrap_or(Decimal::ZERO)
}

impl TryFrom<TomlConfig> for BotConfig {
    type Error = anyhow::Error;

    fn try_from(toml: TomlConfig) -> Result<Self> {
        let Some(leverage_policy) = LeveragePolicy::parse(&toml.risk.leverage_policy) else {
            bail!(
                "Unknown leverage_policy '{}' (expected reject or clamp)",
                toml.risk.leverage_policy
            );
        };

        let mut denylist = TaskScreen::default_patterns();
        denylist.extend(toml.guardrail.extra_denylist);

        Ok(Self {
            log_level: toml.general.log_level,
            risk: RiskLimits {
                max_position_fraction: pct_to_decimal(toml.risk.max_position_pct),
                max_total_exposure_fraction: pct_to_decimal(toml.risk.max_total_exposure_pct),
                max_concurrent_positions: toml.risk.max_concurrent_positions,
                max_leverage: f64_to_decimal(toml.risk.max_leverage),
                leverage_policy,
                daily_loss_fraction: pct_to_decimal(toml.risk.daily_loss_pct),
                max_drawdown_fraction: pct_to_decimal(toml.risk.max_drawdown_pct),
                min_confidence: f64_to_decimal(toml.risk.min_confidence),
                reduced_allocation_factor: f64_to_decimal(toml.risk.reduced_allocation_factor),
            },
            cycle: CycleSettings {
                exchange_timeout: Duration::from_secs(toml.cycle.exchange_timeout_secs),
                agent_timeout: Duration::from_secs(toml.cycle.agent_timeout_secs),
                retry: RetryPolicy {
                    max_retries: toml.cycle.max_retries,
                    base_delay: Duration::from_millis(toml.cycle.retry_base_delay_ms),
                    factor: toml.cycle.retry_factor,
                    max_delay: Duration::from_millis(toml.cycle.retry_max_delay_ms),
                },
                context_window: toml.cycle.context_window,
                alert_cooldown: chrono::Duration::seconds(toml.cycle.alert_cooldown_secs),
                collector_command: toml.cycle.collector_command,
                collector_timeout: Duration::from_secs(toml.cycle.collector_timeout_secs),
            },
            health: HealthConfig {
                required_symbols: toml.health.required_symbols,
                max_staleness: chrono::Duration::seconds(toml.health.max_staleness_secs),
                min_candles: toml.health.min_candles,
                max_price_jump_fraction: pct_to_decimal(toml.health.max_price_jump_pct),
                max_equity_drift_fraction: pct_to_decimal(toml.health.max_equity_drift_pct),
                alert_cooldown: chrono::Duration::seconds(toml.health.alert_cooldown_secs),
            },
            agent: AgentConfig {
                command: toml.agent.command,
                args: toml.agent.args,
                model: toml.agent.model.filter(|m| !m.is_empty()),
                session_flag: toml.agent.session_flag,
                resume_flag: toml.agent.resume_flag,
                session_ttl: chrono::Duration::hours(toml.agent.session_ttl_hours),
                audit_timeout: Duration::from_secs(toml.agent.audit_timeout_secs),
                audit_window: toml.agent.audit_window,
            },
            guardrail_enabled: toml.guardrail.enabled,
            guardrail: GuardrailConfig {
                repo_dir: toml.paths.repo_dir.clone(),
                allowed_paths: toml.guardrail.allowed_paths,
                forbidden_paths: toml.guardrail.forbidden_paths,
                denylist,
                max_task_age: chrono::Duration::hours(toml.guardrail.max_task_age_hours),
                max_task_chars: toml.guardrail.max_task_chars,
                agent_timeout: Duration::from_secs(toml.guardrail.agent_timeout_secs),
                check_command: toml.guardrail.check_command,
                check_timeout: Duration::from_secs(toml.guardrail.check_timeout_secs),
            },
            alerts: AlertsConfig {
                webhook_url: toml.alerts.webhook_url.filter(|u| !u.is_empty()),
                telegram_bot_token: None, // Set via env var
                telegram_chat_id: toml.alerts.telegram_chat_id.filter(|c| !c.is_empty()),
            },
            daemon: DaemonConfig {
                interval: Duration::from_secs(toml.daemon.interval_secs),
                failure_alert_threshold: toml.daemon.failure_alert_threshold,
                trip_kill_switch_on_failures: toml.daemon.trip_kill_switch_on_failures,
                audit_every_cycles: toml.daemon.audit_every_cycles,
            },
            paper: PaperConfig {
                initial_collateral: f64_to_decimal(toml.paper.initial_collateral),
                fee_rate: pct_to_decimal(toml.paper.fee_pct),
            },
            paths: PathsConfig {
                state_dir: toml.paths.state_dir,
                journal_dir: toml.paths.journal_dir,
                market_data: toml.paths.market_data,
                repo_dir: toml.paths.repo_dir,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk.max_position_fraction, dec!(0.10));
        assert!(!config.daemon.trip_kill_switch_on_failures);
        assert_eq!(config.risk.leverage_policy, LeveragePolicy::Reject);
    }

    #[test]
    fn test_empty_toml_matches_defaults() {
        let parsed = BotConfig::from_toml_str("").unwrap();
        let defaults = BotConfig::default();
        assert_eq!(parsed.risk, defaults.risk);
        assert_eq!(parsed.paths, defaults.paths);
        assert_eq!(parsed.cycle, defaults.cycle);
        assert_eq!(parsed.agent, defaults.agent);
        assert_eq!(parsed.daemon, defaults.daemon);
        assert_eq!(parsed.paper.initial_collateral, defaults.paper.initial_collateral);
        assert_eq!(parsed.health.min_candles, defaults.health.min_candles);
        assert_eq!(parsed.guardrail.denylist, defaults.guardrail.denylist);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            log_level = "debug"

            [paths]
            state_dir = "/var/lib/claw"

            [risk]
            max_position_pct = 8.0
            max_leverage = 5
            leverage_policy = "clamp"
            min_confidence = 0.75

            [health]
            required_symbols = ["BTC"]
            max_staleness_secs = 120

            [health.min_candles]
            "1h" = 12

            [guardrail]
            allowed_paths = ["scripts/**"]
            extra_denylist = ["\\bsudo\\b"]

            [daemon]
            interval_secs = 60
            trip_kill_switch_on_failures = true

            [paper]
            initial_collateral = 500.0
            fee_pct = 1.0
        "#;

        let config = BotConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.paths.state_dir, PathBuf::from("/var/lib/claw"));
        assert_eq!(config.risk.max_position_fraction, dec!(0.08));
        assert_eq!(config.risk.max_leverage, dec!(5));
        assert_eq!(config.risk.leverage_policy, LeveragePolicy::Clamp);
        assert_eq!(config.risk.min_confidence, dec!(0.75));
        assert_eq!(config.health.required_symbols, vec!["BTC".to_string()]);
        assert_eq!(config.health.max_staleness, chrono::Duration::seconds(120));
        assert_eq!(config.health.min_candles.get("1h"), Some(&12));
        assert_eq!(config.guardrail.allowed_paths, vec!["scripts/**".to_string()]);
        assert_eq!(
            config.guardrail.denylist.len(),
            TaskScreen::default_patterns().len() + 1
        );
        assert_eq!(config.daemon.interval, Duration::from_secs(60));
        assert!(config.daemon.trip_kill_switch_on_failures);
        assert_eq!(config.paper.initial_collateral, dec!(500));
        assert_eq!(config.paper.fee_rate, dec!(0.01));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shipped_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/claw.toml");
        let config = BotConfig::from_file(path).unwrap();
        let defaults = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk, defaults.risk);
        assert_eq!(config.health.min_candles, defaults.health.min_candles);
        assert_eq!(config.guardrail.forbidden_paths, defaults.guardrail.forbidden_paths);
        assert_eq!(config.guardrail.denylist, defaults.guardrail.denylist);
        assert_eq!(config.daemon, defaults.daemon);
        assert!(config.guardrail_enabled);
        assert!(config.cycle.collector_command.is_empty());
    }

    #[test]
    fn test_unknown_leverage_policy() {
        let toml = "[risk]\nleverage_policy = \"yolo\"\n";
        assert!(BotConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BotConfig::default();
        config.apply_overrides_from(|key| match key {
            "ALERT_WEBHOOK_URL" => Some("https://hooks.example/abc".to_string()),
            "TELEGRAM_BOT_TOKEN" => Some("123:token".to_string()),
            "TELEGRAM_CHAT_ID" => Some("42".to_string()),
            "CLAW_STATE_DIR" => Some("/tmp/claw".to_string()),
            "CLAW_AGENT_COMMAND" => Some(" ".to_string()),
            _ => None,
        });
        assert_eq!(config.alerts.webhook_url.as_deref(), Some("https://hooks.example/abc"));
        assert_eq!(config.alerts.telegram(), Some(("123:token", "42")));
        assert_eq!(config.paths.state_dir, PathBuf::from("/tmp/claw"));
        // blank values are ignored
        assert_eq!(config.agent.command, "claude");
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = BotConfig::default();
        config.apply_cli_overrides(Some(PathBuf::from("alt")), Some("trace".to_string()), Some(30));
        assert_eq!(config.paths.state_dir, PathBuf::from("alt"));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.daemon.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_state_dir_outside_repo() {
        let mut config = BotConfig::default();
        assert!(config.validate().is_ok());

        for inside in ["state", "./state", "scripts/../state", "."] {
            config.paths.state_dir = PathBuf::from(inside);
            assert!(config.validate().is_err(), "{inside}");
        }

        // Only enforced while the code agent can run.
        config.guardrail_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_position_exceeds_exposure() {
        let mut config = BotConfig::default();
        config.risk.max_position_fraction = dec!(0.5);
        config.risk.max_total_exposure_fraction = dec!(0.3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BotConfig::default();
        config.risk.max_concurrent_positions = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.risk.min_confidence = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.daemon.failure_alert_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.guardrail.denylist.push("(unclosed".to_string());
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.health.required_symbols.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pct_to_decimal() {
        assert_eq!(pct_to_decimal(10.0), dec!(0.1));
        assert_eq!(pct_to_decimal(2.5), dec!(0.025));
        assert_eq!(pct_to_decimal(0.0), Decimal::ZERO);
    }
}
