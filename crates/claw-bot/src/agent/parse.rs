//! Parsing of agent output into typed decisions.
//!
//! Agents answer in free text that contains one JSON object, either bare or
//! inside a fenced ```json block. Nothing past this module sees raw text.

use serde::Deserialize;
use thiserror::Error;

use claw_common::{ActionType, Priority, Signal, SignalError};

#[derive(Debug, Error)]
pub enum DecisionParseError {
    #[error("Agent output is empty")]
    Empty,

    #[error("No JSON object found in agent output")]
    NoJson,

    #[error("Malformed decision JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal {index} invalid: {source}")]
    InvalidSignal {
        index: usize,
        #[source]
        source: SignalError,
    },

    #[error("action_type {action} requires field '{field}'")]
    MissingField {
        action: ActionType,
        field: &'static str,
    },
}

/// Improvement requested by a `self_improve` decision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImprovementRequest {
    pub task: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub target_file: Option<String>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// A validated cycle decision.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Decision {
    pub action_type: ActionType,
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default)]
    pub market_summary: Option<String>,
    #[serde(default)]
    pub self_assessment: Option<String>,
    #[serde(default)]
    pub journal_entry: Option<String>,
    #[serde(default)]
    pub research_topic: Option<String>,
    #[serde(default)]
    pub improvement: Option<ImprovementRequest>,
}

impl Decision {
    /// The decision used when no valid one could be obtained.
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Hold,
            signals: Vec::new(),
            market_summary: None,
            self_assessment: Some(reason.into()),
            journal_entry: None,
            research_topic: None,
            improvement: None,
        }
    }

    fn validate(&self) -> Result<(), DecisionParseError> {
        for (index, signal) in self.signals.iter().enumerate() {
            signal
                .validate()
                .map_err(|source| DecisionParseError::InvalidSignal { index, source })?;
        }

        let blank = |s: &Option<String>| s.as_deref().is_none_or(|v| v.trim().is_empty());
        let missing = match self.action_type {
            ActionType::Journal if blank(&self.journal_entry) => Some("journal_entry"),
            ActionType::Research if blank(&self.research_topic) => Some("research_topic"),
            ActionType::SelfImprove
                if self
                    .improvement
                    .as_ref()
                    .is_none_or(|i| i.task.trim().is_empty()) =>
            {
                Some("improvement")
            }
            _ => None,
        };
        match missing {
            Some(field) => Err(DecisionParseError::MissingField {
                action: self.action_type,
                field,
            }),
            None => Ok(()),
        }
    }
}

/// Locate the JSON object in agent output.
///
/// Tries, in order: the whole trimmed text, the first ```json fence (or bare
/// ``` fence), and the span from the first `{` to the last `}`.
pub fn extract_json(raw: &str) -> Result<&str, DecisionParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(DecisionParseError::Empty);
    }
    if text.starts_with('{') && text.ends_with('}') {
        return Ok(text);
    }

    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            if let Some(end) = body.find("```") {
                let candidate = body[..end].trim();
                if candidate.starts_with('{') {
                    return Ok(candidate);
                }
            }
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(&text[start..=end]),
        _ => Err(DecisionParseError::NoJson),
    }
}

/// Parse and validate a decision.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionParseError> {
    let json = extract_json(raw)?;
    let decision: Decision = serde_json::from_str(json)?;
    decision.validate()?;
    Ok(decision)
}
