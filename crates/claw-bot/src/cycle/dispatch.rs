//! Side effects of non-trade decisions: journal, research, self-improve.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use claw_common::{ImprovementItem, ResearchItem};

use crate::agent::{Decision, ImprovementRequest};
use crate::store::{StateStore, StoreError};

/// Append a journal entry to `<dir>/<YYYY-MM-DD>.md`.
pub async fn write_journal(
    dir: &Path,
    cycle_id: Uuid,
    at: DateTime<Utc>,
    decision: &Decision,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.md", at.format("%Y-%m-%d")));
    let is_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);

    let mut text = String::new();
    if is_new {
        text.push_str(&format!("# Journal {}\n\n", at.format("%Y-%m-%d")));
    }
    text.push_str(&format!(
        "## {} UTC (cycle {})\n\n",
        at.format("%H:%M:%S"),
        cycle_id
    ));
    if let Some(summary) = &decision.market_summary {
        text.push_str(&format!("**Market:** {}\n\n", summary.trim()));
    }
    if let Some(entry) = &decision.journal_entry {
        text.push_str(entry.trim());
        text.push_str("\n\n");
    }
    if let Some(assessment) = &decision.self_assessment {
        text.push_str(&format!("**Self-assessment:** {}\n\n", assessment.trim()));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;

    debug!(path = %path.display(), "Journal entry written");
    Ok(path)
}

/// Queue a research topic.
pub fn enqueue_research(
    store: &StateStore,
    topic: &str,
    context: Option<String>,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    store.enqueue_research(ResearchItem {
        topic: topic.trim().to_string(),
        context,
        queued_at: at,
        done: false,
    })?;
    info!(topic, "Research topic queued");
    Ok(())
}

/// Queue an improvement item. `None` when an identical task is already pending.
pub fn enqueue_improvement(
    store: &StateStore,
    request: &ImprovementRequest,
) -> Result<Option<ImprovementItem>, StoreError> {
    let item = ImprovementItem::new(
        request.task.trim(),
        request.priority,
        request.target_file.clone(),
    );
    if store.enqueue_improvement(item.clone())? {
        info!(id = %item.id, task = %item.task, "Improvement queued");
        Ok(Some(item))
    } else {
        debug!(task = %item.task, "Improvement already pending, skipped");
        Ok(None)
    }
}
