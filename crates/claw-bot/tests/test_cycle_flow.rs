//! End-to-end cycles against the paper exchange and a scripted agent.
//!
//! Tests:
//! - Active kill switch aborts before observing
//! - Trade decision is evaluated, executed and logged
//! - Agent failing twice yields a hold and a failed status
//! - Missing market data forces close_only and flattens positions
//! - Drawdown breach trips the kill switch with nothing executed
//! - Breach found while monitoring flattens open positions
//! - Implausibly low equity skips the limit checks
//! - Journal, research and self_improve decisions are dispatched
//! - Unavailable account aborts the cycle

mod common;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;

use claw_bot::agent::{AgentError, SessionMode};
use claw_bot::cycle::{CyclePhase, CycleStatus};
use claw_bot::exchange::{Exchange, OpenRequest};
use claw_bot::executor::ExecutionStatus;
use claw_bot::risk::Breach;
use claw_common::{Action, ActionType, ExecutionMode, ImprovementStatus, Side};

use common::{decision_json, default_snapshot, DownExchange, Harness};

// ============================================================================
// Gate and observation
// ============================================================================

#[tokio::test]
async fn test_kill_switch_aborts_cycle() {
    let h = Harness::new(Some(default_snapshot()), vec![]);
    h.kill_switch.activate("manual").unwrap();
    let orchestrator = h.orchestrator(h.paper(dec!(10000)));

    let report = orchestrator.run().await;

    assert_eq!(report.status, CycleStatus::KillSwitchActive);
    assert_eq!(
        report.phases,
        vec![
            CyclePhase::Idle,
            CyclePhase::CheckingKillSwitch,
            CyclePhase::Aborted,
            CyclePhase::Idle
        ]
    );
    assert_eq!(h.agent.call_count(), 0);
    assert!(h.store.recent_ooda(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_unavailable_account_aborts_cycle() {
    let h = Harness::new(Some(default_snapshot()), vec![]);
    let orchestrator = h.orchestrator(Arc::new(DownExchange));

    let report = orchestrator.run().await;

    assert!(matches!(report.status, CycleStatus::ObservationFailed(_)));
    assert!(report.phases.contains(&CyclePhase::Aborted));
    assert!(!report.phases.contains(&CyclePhase::ValidatingHealth));
    assert_eq!(h.agent.call_count(), 0);
    assert_eq!(h.alerter.count("observation_failed"), 1);
    // Nothing trips the switch on an observation failure.
    assert!(!h.kill_switch.is_active());
}

// ============================================================================
// Trading
// ============================================================================

#[tokio::test]
async fn test_trade_decision_executes() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![decision_json(json!({
            "action_type": "trade",
            "market_summary": "BTC reclaiming range high",
            "signals": [
                {"symbol": "BTC", "action": "long", "confidence": 0.8, "leverage": 2, "allocation": 0.05},
                {"symbol": "ETH", "action": "long", "confidence": 0.5, "leverage": 2, "allocation": 0.05},
                {"symbol": "SOL", "action": "hold", "confidence": 0.9}
            ]
        }))],
    );
    let paper = h.paper(dec!(10000));
    let orchestrator = h.orchestrator(paper.clone());

    let report = orchestrator.run().await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.mode, Some(ExecutionMode::All));
    assert_eq!(report.action_type, Some(ActionType::Trade));
    assert_eq!(report.equity, Some(dec!(10000)));
    assert_eq!(report.approved, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.executions.len(), 1);
    assert!(report.executions[0].is_filled());
    assert_eq!(report.phases.last(), Some(&CyclePhase::Idle));
    assert!(report.phases.contains(&CyclePhase::Monitoring));
    assert_eq!(*h.agent.calls.lock(), vec![SessionMode::Resume]);

    // 5% of 10000 at 2x = 1000 notional at 50000
    let positions = paper.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "BTC");
    assert_eq!(positions[0].side, Side::Long);
    assert_eq!(positions[0].size, dec!(0.02));
    assert_eq!(h.store.positions().unwrap(), positions);

    let trades = h.store.trade_history().unwrap();
    assert_eq!(trades.len(), 1);
    assert!(trades[0].exit_price.is_none());

    let log = h.store.recent_ooda(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].cycle_id, report.cycle_id);
    assert_eq!(log[0].action_type, ActionType::Trade);
    assert!(!log[0].synthesized);
    assert_eq!(log[0].market_summary.as_deref(), Some("BTC reclaiming range high"));

    assert!(h.store.data_health().unwrap().unwrap().is_healthy());
    assert!(h.alerter.kinds().is_empty());
    // The open has no realized P&L yet.
    assert_eq!(report.performance.unwrap().trades, 0);
}

#[tokio::test]
async fn test_decision_failure_holds() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![
            Err(AgentError::Timeout(std::time::Duration::from_secs(600))),
            Ok("I think we should probably buy".to_string()),
        ],
    );
    let orchestrator = h.orchestrator(h.paper(dec!(10000)));

    let report = orchestrator.run().await;

    match &report.status {
        CycleStatus::DecisionFailed(reason) => assert!(reason.contains("invalid decision")),
        other => panic!("expected decision failure, got {other:?}"),
    }
    assert!(report.status.is_failure());
    assert_eq!(report.action_type, Some(ActionType::Hold));
    assert!(report.executions.is_empty());
    assert_eq!(
        *h.agent.calls.lock(),
        vec![SessionMode::Resume, SessionMode::Fresh]
    );
    assert_eq!(h.alerter.count("decision_failed"), 1);

    let log = h.store.recent_ooda(10).unwrap();
    assert_eq!(log[0].action_type, ActionType::Hold);
    assert!(log[0].synthesized);
}

#[tokio::test]
async fn test_missing_market_data_flattens() {
    let h = Harness::new(None, vec![]);
    let paper = h.paper(dec!(10000));
    paper
        .open_position(&OpenRequest {
            symbol: "ETH".to_string(),
            side: Side::Short,
            size: dec!(1),
            leverage: dec!(3),
            reference_price: dec!(3000),
            stop_loss: None,
            take_profit: None,
        })
        .await
        .unwrap();
    let orchestrator = h.orchestrator(paper.clone());

    let report = orchestrator.run().await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.mode, Some(ExecutionMode::CloseOnly));
    assert!(report.phases.contains(&CyclePhase::SafeClose));
    assert!(!report.phases.contains(&CyclePhase::Deciding));
    assert_eq!(h.agent.call_count(), 0);

    assert_eq!(report.executions.len(), 1);
    assert_eq!(report.executions[0].symbol, "ETH");
    assert_eq!(report.executions[0].action, Action::Close);
    assert!(matches!(report.executions[0].status, ExecutionStatus::Filled(_)));
    assert!(paper.positions().await.unwrap().is_empty());
    assert!(h.store.positions().unwrap().is_empty());

    let log = h.store.recent_ooda(10).unwrap();
    assert!(log[0].synthesized);
    assert_eq!(log[0].execution_mode, ExecutionMode::CloseOnly);
    assert_eq!(h.alerter.count("data_health_close_only"), 1);
}

#[tokio::test]
async fn test_drawdown_breach_trips_kill_switch() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![decision_json(json!({
            "action_type": "trade",
            "signals": [
                {"symbol": "BTC", "action": "long", "confidence": 0.9, "leverage": 2, "allocation": 0.05}
            ]
        }))],
    );
    // Earlier today the account peaked at 12000; 10000 is a 16.7% drawdown.
    h.store
        .record_equity(Utc::now().date_naive(), dec!(12000), dec!(0))
        .unwrap();
    let paper = h.paper(dec!(10000));
    let orchestrator = h.orchestrator(paper.clone());

    let report = orchestrator.run().await;

    assert!(report.breach.is_some());
    assert_eq!(report.approved, 0);
    assert_eq!(report.rejected, 1);
    assert!(report.executions.is_empty());
    assert!(paper.positions().await.unwrap().is_empty());
    assert!(h.kill_switch.is_active());
    assert_eq!(h.alerter.count("risk_breach"), 1);
    assert_eq!(h.alerter.count("kill_switch_active"), 1);

    // The next cycle stops at the gate.
    let next = orchestrator.run().await;
    assert_eq!(next.status, CycleStatus::KillSwitchActive);
}

async fn open_eth_short(paper: &claw_bot::exchange::PaperExchange) {
    paper
        .open_position(&OpenRequest {
            symbol: "ETH".to_string(),
            side: Side::Short,
            size: dec!(1),
            leverage: dec!(3),
            reference_price: dec!(3000),
            stop_loss: None,
            take_profit: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_breach_in_monitoring_flattens_positions() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![decision_json(json!({"action_type": "hold", "market_summary": "chop"}))],
    );
    h.store
        .record_equity(Utc::now().date_naive(), dec!(12000), dec!(0))
        .unwrap();
    let paper = h.paper(dec!(10000));
    open_eth_short(&paper).await;
    let orchestrator = h.orchestrator(paper.clone());

    let report = orchestrator.run().await;

    assert_eq!(report.action_type, Some(ActionType::Hold));
    assert!(report.executions.is_empty());
    assert!(matches!(report.breach, Some(Breach::Drawdown { .. })));
    assert!(h.kill_switch.is_active());

    // Closed despite the active switch.
    assert_eq!(report.flattened.len(), 1);
    assert_eq!(report.flattened[0].symbol, "ETH");
    assert_eq!(report.flattened[0].action, Action::Close);
    assert!(report.flattened[0].is_filled());
    assert!(paper.positions().await.unwrap().is_empty());
    assert!(h.store.positions().unwrap().is_empty());

    let trades = h.store.trade_history().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_price, Some(dec!(3000)));
    assert_eq!(report.performance.unwrap().trades, 1);

    assert_eq!(h.alerter.count("risk_breach"), 1);
    assert_eq!(h.alerter.count("emergency_close_failed"), 0);
}

#[tokio::test]
async fn test_implausible_equity_skips_limits() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![decision_json(json!({"action_type": "hold"}))],
    );
    // Started the day at 12000; a 1000 read is under the 10% sanity floor.
    h.store
        .record_equity(Utc::now().date_naive(), dec!(12000), dec!(0))
        .unwrap();
    let paper = h.paper(dec!(1000));
    open_eth_short(&paper).await;
    let orchestrator = h.orchestrator(paper.clone());

    let report = orchestrator.run().await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert!(report.breach.is_none());
    assert!(report.flattened.is_empty());
    assert!(!h.kill_switch.is_active());
    assert_eq!(paper.positions().await.unwrap().len(), 1);
    assert_eq!(h.alerter.count("risk_breach"), 0);
}

// ============================================================================
// Non-trade dispatch
// ============================================================================

#[tokio::test]
async fn test_journal_research_and_improvement_dispatch() {
    let h = Harness::new(
        Some(default_snapshot()),
        vec![
            decision_json(json!({
                "action_type": "journal",
                "market_summary": "quiet Asia session",
                "journal_entry": "Stood aside; funding flat across majors."
            })),
            decision_json(json!({
                "action_type": "research",
                "research_topic": "SOL funding skew vs spot premium"
            })),
            decision_json(json!({
                "action_type": "self_improve",
                "improvement": {"task": "collect 1m candles for BTC", "priority": "high", "target_file": "scripts/collect.py"}
            })),
        ],
    );
    let orchestrator = h.orchestrator(h.paper(dec!(10000)));

    let journal = orchestrator.run().await;
    assert_eq!(journal.action_type, Some(ActionType::Journal));
    let path = h
        .dir
        .path()
        .join("journal")
        .join(format!("{}.md", Utc::now().format("%Y-%m-%d")));
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("Stood aside; funding flat across majors."));
    assert!(text.contains(&journal.cycle_id.to_string()));

    let research = orchestrator.run().await;
    assert_eq!(research.action_type, Some(ActionType::Research));
    let topics = h.store.research_queue().unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic, "SOL funding skew vs spot premium");

    let improve = orchestrator.run().await;
    assert!(improve.coder_requested);
    let queue = h.store.improvement_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, ImprovementStatus::Pending);
    assert_eq!(queue[0].target_file.as_deref(), Some("scripts/collect.py"));

    assert_eq!(h.store.recent_ooda(10).unwrap().len(), 3);
    assert!(h.store.trade_history().unwrap().is_empty());
}
