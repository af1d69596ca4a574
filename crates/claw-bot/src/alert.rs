//! Outbound alerts.
//!
//! Alerting is fire-and-forget from the caller's point of view: `send` never
//! returns an error. Transport failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A single alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    /// Stable identifier used for cooldowns (`kill_switch`, `data_health`, ...).
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn critical(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, kind, message)
    }

    pub fn warning(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, kind, message)
    }

    /// One-line rendering for chat transports.
    pub fn text(&self) -> String {
        format!("[{}] {}: {}", self.level, self.kind, self.message)
    }
}

/// Alert transport.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, alert: &Alert);
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, alert: &Alert) {
        match alert.level {
            AlertLevel::Critical => error!(kind = %alert.kind, "ALERT: {}", alert.message),
            AlertLevel::Warning => warn!(kind = %alert.kind, "ALERT: {}", alert.message),
            AlertLevel::Info => info!(kind = %alert.kind, "ALERT: {}", alert.message),
        }
    }
}

fn http_client() -> Option<reqwest::Client> {
    match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP client for alerts");
            None
        }
    }
}

/// Posts alerts as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    url: String,
    client: Option<reqwest::Client>,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send(&self, alert: &Alert) {
        let Some(client) = &self.client else { return };
        let payload = serde_json::json!({
            "text": alert.text(),
            "level": alert.level,
            "kind": alert.kind,
            "message": alert.message,
            "timestamp": alert.timestamp.to_rfc3339(),
        });
        let result = async {
            client
                .post(&self.url)
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            Ok::<(), reqwest::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %transport_error(e), kind = %alert.kind, "Failed to send alert webhook");
        }
    }
}

/// Sends alerts through the Telegram Bot API.
#[derive(Debug, Clone)]
pub struct TelegramAlerter {
    token: String,
    chat_id: String,
    client: Option<reqwest::Client>,
}

impl TelegramAlerter {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            chat_id: chat_id.into(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Alerter for TelegramAlerter {
    async fn send(&self, alert: &Alert) {
        let Some(client) = &self.client else { return };
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let text = alert.text();
        let params = [("chat_id", self.chat_id.as_str()), ("text", text.as_str())];
        match client.post(&url).form(&params).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "Telegram alert rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %transport_error(e), "Failed to send Telegram alert"),
        }
    }
}

/// Error text without the request URL. Webhook URLs and the Telegram bot
/// token path are credentials.
fn transport_error(e: reqwest::Error) -> String {
    e.without_url().to_string()
}

/// Sends every alert to each inner alerter in turn.
#[derive(Clone, Default)]
pub struct FanoutAlerter {
    inner: Vec<Arc<dyn Alerter>>,
}

impl FanoutAlerter {
    pub fn new(inner: Vec<Arc<dyn Alerter>>) -> Self {
        Self { inner }
    }

    pub fn push(&mut self, alerter: Arc<dyn Alerter>) {
        self.inner.push(alerter);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl Alerter for FanoutAlerter {
    async fn send(&self, alert: &Alert) {
        for alerter in &self.inner {
            alerter.send(alert).await;
        }
    }
}
