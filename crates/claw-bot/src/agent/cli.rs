//! Agents backed by an external command-line tool.
//!
//! The prompt is written to the child's stdin and its stdout is the answer.
//! Each call is bounded by a timeout; a timed-out child is killed when its
//! handle is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AgentError, AuditAgent, AuditRequest, CodeAgent, CodeTask, DecisionRequest, ReasoningAgent,
    SessionMode,
};
use crate::store::{AgentSession, StateStore};

/// Session argument for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionArg<'a> {
    /// Start a session with this id.
    New(&'a str),
    /// Continue the session with this id.
    Resume(&'a str),
}

/// How to run the agent command.
#[derive(Debug, Clone)]
pub struct AgentCli {
    program: String,
    args: Vec<String>,
    model: Option<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
    model_flag: String,
    session_flag: String,
    resume_flag: String,
}

impl AgentCli {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            model: None,
            timeout,
            workdir: None,
            model_flag: "--model".to_string(),
            session_flag: "--session-id".to_string(),
            resume_flag: "--resume".to_string(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_session_flags(mut self, session: impl Into<String>, resume: impl Into<String>) -> Self {
        self.session_flag = session.into();
        self.resume_flag = resume.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the command once and return its trimmed stdout.
    pub async fn invoke(
        &self,
        prompt: &str,
        session: Option<SessionArg<'_>>,
    ) -> Result<String, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(model) = &self.model {
            cmd.arg(&self.model_flag).arg(model);
        }
        match session {
            Some(SessionArg::New(id)) => {
                cmd.arg(&self.session_flag).arg(id);
            }
            Some(SessionArg::Resume(id)) => {
                cmd.arg(&self.resume_flag).arg(id);
            }
            None => {}
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;
        debug!(program = %self.program, prompt_len = prompt.len(), "Agent spawned");

        let stdin = child.stdin.take();
        let interaction = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    return Err(AgentError::Spawn(e));
                }
                drop(stdin);
            }
            child.wait_with_output().await.map_err(AgentError::Spawn)
        };

        let output = tokio::time::timeout(self.timeout, interaction)
            .await
            .map_err(|_| {
                warn!(program = %self.program, timeout = ?self.timeout, "Agent timed out");
                AgentError::Timeout(self.timeout)
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Exited {
                status: output.status.to_string(),
                stderr: truncate(stderr.trim(), 500),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(AgentError::EmptyOutput);
        }
        Ok(stdout)
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ============================================================================
// Role implementations
// ============================================================================

/// Reasoning agent with a persisted session that is reset after `session_ttl`.
pub struct CliReasoningAgent {
    cli: AgentCli,
    store: StateStore,
    session_ttl: chrono::Duration,
}

impl CliReasoningAgent {
    pub fn new(cli: AgentCli, store: StateStore, session_ttl: chrono::Duration) -> Self {
        Self {
            cli,
            store,
            session_ttl,
        }
    }
}

#[async_trait]
impl ReasoningAgent for CliReasoningAgent {
    async fn decide(
        &self,
        request: &DecisionRequest,
        session: SessionMode,
    ) -> Result<String, AgentError> {
        let now = Utc::now();
        let stored = self.store.agent_session()?;

        let resumable = match (&stored.session_id, stored.started_at) {
            (Some(id), Some(started)) if session == SessionMode::Resume => {
                (now - started < self.session_ttl).then(|| id.clone())
            }
            _ => None,
        };

        let prompt = request.to_prompt();
        match resumable {
            Some(id) => {
                debug!(session = %id, "Resuming agent session");
                self.cli.invoke(&prompt, Some(SessionArg::Resume(&id))).await
            }
            None => {
                let id = Uuid::new_v4().to_string();
                self.store.set_agent_session(&AgentSession {
                    session_id: Some(id.clone()),
                    started_at: Some(now),
                })?;
                info!(session = %id, "Starting new agent session");
                self.cli.invoke(&prompt, Some(SessionArg::New(&id))).await
            }
        }
    }
}

/// Code-editing agent run from the repository root.
pub struct CliCodeAgent {
    cli: AgentCli,
}

impl CliCodeAgent {
    pub fn new(cli: AgentCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl CodeAgent for CliCodeAgent {
    async fn apply(&self, task: &CodeTask) -> Result<String, AgentError> {
        self.cli.invoke(&task.to_prompt(), None).await
    }
}

/// Reviewer agent.
pub struct CliAuditAgent {
    cli: AgentCli,
}

impl CliAuditAgent {
    pub fn new(cli: AgentCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl AuditAgent for CliAuditAgent {
    async fn audit(&self, request: &AuditRequest) -> Result<String, AgentError> {
        self.cli.invoke(&request.to_prompt(), None).await
    }
}
