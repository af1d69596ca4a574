//! claw-bot: unattended trading loop driven by an external reasoning agent.
//!
//! Usage:
//!   claw-bot [OPTIONS] <COMMAND>
//!
//! Commands:
//!   run                      Run the daemon loop until Ctrl-C / SIGTERM
//!   cycle                    Run one cycle; non-zero exit when it fails
//!   kill-switch <ACTION>     status | activate <REASON> | deactivate
//!   improve                  Run the guardrailed Coder pass on the oldest pending item
//!   audit                    Run the Reviewer pass once
//!   queue                    List improvement and research queues
//!
//! Options:
//!   -c, --config <FILE>      Config file path (default: config/claw.toml)
//!   --state-dir <DIR>        State directory (overrides config)
//!   --log-level <LEVEL>      Log level (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use claw_bot::app::App;
use claw_bot::config::BotConfig;
use claw_bot::guardrail::GuardrailOutcome;
use claw_common::ImprovementStatus;

/// CLI arguments for claw-bot.
#[derive(Parser, Debug)]
#[command(name = "claw-bot")]
#[command(about = "Safety and orchestration core for an agent-driven trading loop")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/claw.toml")]
    config: PathBuf,

    /// State directory (overrides config file)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon loop
    Run {
        /// Seconds between cycles (overrides config file)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run a single cycle
    Cycle,
    /// Inspect or change the kill switch
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },
    /// Run the Coder pass on the oldest pending improvement
    Improve,
    /// Run the Reviewer pass
    Audit,
    /// List queued improvements and research topics
    Queue {
        /// Include finished items
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KillSwitchAction {
    Status,
    Activate {
        /// Reason recorded with the activation
        reason: Vec<String>,
    },
    Deactivate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        BotConfig::default()
    };
    config.apply_env_overrides();
    let interval = match &args.command {
        Command::Run { interval } => *interval,
        _ => None,
    };
    config.apply_cli_overrides(args.state_dir.clone(), args.log_level.clone(), interval);

    init_logging(&config.log_level)?;
    if !config_found {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }

    config.validate().context("Configuration validation failed")?;

    let app = App::new(config)?;
    match args.command {
        Command::Run { .. } => run_daemon(&app).await,
        Command::Cycle => run_cycle(&app).await,
        Command::KillSwitch { action } => kill_switch(&app, action),
        Command::Improve => improve(&app).await,
        Command::Audit => audit(&app).await,
        Command::Queue { all } => queue(&app, all),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let builder = FmtSubscriber::builder();
    let result = if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )
    } else {
        let level = match level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())
    };
    result.context("Failed to set global tracing subscriber")
}

async fn run_daemon(app: &App) -> Result<ExitCode> {
    info!("Starting claw-bot daemon");
    info!(state_dir = ?app.config.paths.state_dir, "State directory");
    if app.kill_switch.is_active() {
        warn!("Kill switch is active; cycles will abort until `claw-bot kill-switch deactivate`");
    }

    let daemon = app.daemon()?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Shutdown signal handler error: {}", e);
        }
        info!("Requesting shutdown...");
        let _ = shutdown_tx.send(());
    });

    daemon.run(shutdown_rx).await;
    info!("claw-bot stopped");
    Ok(ExitCode::SUCCESS)
}

async fn run_cycle(app: &App) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let report = orchestrator.run().await;

    println!("cycle {}: {}", report.cycle_id, report.status);
    if let Some(mode) = report.mode {
        println!("  mode:      {}", mode);
    }
    if let Some(equity) = report.equity {
        println!("  equity:    {}", equity);
    }
    if let Some(action) = report.action_type {
        println!("  action:    {}", action);
    }
    println!("  approved:  {}  rejected: {}", report.approved, report.rejected);
    for exec in &report.executions {
        println!("  {} {}: {:?}", exec.action, exec.symbol, exec.status);
    }
    if let Some(breach) = &report.breach {
        println!("  BREACH:    {}", breach);
    }

    if report.coder_requested && app.config.guardrail_enabled {
        match app.guardrail()?.run_next().await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => warn!(error = %e, "Coder pass failed"),
        }
    }

    Ok(if report.status.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn kill_switch(app: &App, action: KillSwitchAction) -> Result<ExitCode> {
    match action {
        KillSwitchAction::Status => match app.kill_switch.status() {
            Ok(Some(state)) if state.enabled => {
                println!("ACTIVE");
                println!("  reason: {}", state.reason.as_deref().unwrap_or("-"));
                if let Some(at) = state.triggered_at {
                    println!("  since:  {}", at);
                }
            }
            Ok(Some(_)) => println!("inactive"),
            Ok(None) => println!("ACTIVE (no kill switch record; deactivate to start trading)"),
            Err(e) => println!("ACTIVE (kill switch record unreadable: {})", e),
        },
        KillSwitchAction::Activate { reason } => {
            let reason = reason.join(" ");
            if reason.trim().is_empty() {
                bail!("A reason is required to activate the kill switch");
            }
            app.kill_switch.activate(&reason)?;
            println!("Kill switch activated: {}", reason);
        }
        KillSwitchAction::Deactivate => {
            app.kill_switch.deactivate()?;
            println!("Kill switch deactivated");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn improve(app: &App) -> Result<ExitCode> {
    let outcome = app.guardrail()?.run_next().await?;
    print_outcome(&outcome);
    Ok(match outcome {
        GuardrailOutcome::Idle | GuardrailOutcome::Done(_) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn print_outcome(outcome: &GuardrailOutcome) {
    match outcome {
        GuardrailOutcome::Idle => println!("No pending improvements"),
        GuardrailOutcome::Done(item) => println!("done {}: {}", item.id, item.task),
        GuardrailOutcome::Rejected { item, reason } => {
            println!("refused {}: {}", item.id, reason)
        }
        GuardrailOutcome::Reverted { item, violations } => {
            println!("REVERTED {}:", item.id);
            for v in violations {
                println!("  {}", v);
            }
        }
        GuardrailOutcome::CheckFailed { item, output } => {
            println!("check failed {}, reverted:\n{}", item.id, output)
        }
        GuardrailOutcome::AgentFailed { item, error } => {
            println!("agent failed {}: {}", item.id, error)
        }
    }
}

async fn audit(app: &App) -> Result<ExitCode> {
    let report = app.audit().run().await?;
    println!(
        "{} findings, {} queued, {} critical",
        report.findings,
        report.enqueued.len(),
        report.critical
    );
    for item in &report.enqueued {
        println!("  [{:?}] {}", item.priority, item.task);
    }
    Ok(ExitCode::SUCCESS)
}

fn queue(app: &App, all: bool) -> Result<ExitCode> {
    let items = app.store.improvement_queue()?;
    println!("Improvements:");
    for item in items
        .iter()
        .filter(|i| all || !i.status.is_terminal() || i.status == ImprovementStatus::Failed)
    {
        println!(
            "  {} {:<11} {:<8} {}{}",
            item.id,
            item.status.to_string(),
            format!("{:?}", item.priority).to_lowercase(),
            item.task,
            item.outcome
                .as_deref()
                .map(|o| format!("  ({})", o))
                .unwrap_or_default()
        );
    }

    println!("Research:");
    for topic in app.store.research_queue()?.iter().filter(|r| all || !r.done) {
        println!("  {}  {}", topic.queued_at.format("%Y-%m-%d %H:%M"), topic.topic);
    }
    Ok(ExitCode::SUCCESS)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from(["claw-bot", "cycle"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/claw.toml");
        assert!(matches!(args.command, Command::Cycle));
    }

    #[test]
    fn test_cli_run_interval() {
        let args = Args::try_parse_from(["claw-bot", "--state-dir", "/tmp/s", "run", "--interval", "60"]).unwrap();
        assert_eq!(args.state_dir, Some(PathBuf::from("/tmp/s")));
        assert!(matches!(args.command, Command::Run { interval: Some(60) }));
    }

    #[test]
    fn test_cli_kill_switch_reason() {
        let args =
            Args::try_parse_from(["claw-bot", "kill-switch", "activate", "manual", "halt"]).unwrap();
        match args.command {
            Command::KillSwitch {
                action: KillSwitchAction::Activate { reason },
            } => assert_eq!(reason.join(" "), "manual halt"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Args::try_parse_from(["claw-bot"]).is_err());
    }
}
