//! Version control boundary for the guardrail.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Current revision id.
    async fn head(&self) -> Result<String, VcsError>;

    /// Paths touched by commits in `since..HEAD`.
    async fn changed_since(&self, since: &str) -> Result<Vec<String>, VcsError>;

    /// Uncommitted paths, tracked or not.
    async fn dirty_paths(&self) -> Result<Vec<String>, VcsError>;

    /// Commit the given paths.
    async fn commit(&self, paths: &[String], message: &str) -> Result<(), VcsError>;

    /// Discard tracked edits and untracked `dirty` paths, then undo every
    /// commit after `to`.
    async fn revert(&self, to: &str, dirty: &[String]) -> Result<(), VcsError>;
}

/// Every path changed since `pre`, committed or not.
pub async fn collect_changes(vcs: &dyn Vcs, pre: &str) -> Result<Vec<String>, VcsError> {
    let mut paths: BTreeSet<String> = vcs.changed_since(pre).await?.into_iter().collect();
    paths.extend(vcs.dirty_paths().await?);
    Ok(paths.into_iter().collect())
}

/// `git` CLI in a working tree.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo: PathBuf,
}

impl GitVcs {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(VcsError::Spawn)?;
        if !output.status.success() {
            return Err(VcsError::Failed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Paths from `git status --porcelain` output. Renames report both sides.
pub fn parse_porcelain(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.get(3..) else { continue };
        for part in rest.split(" -> ") {
            let path = part.trim().trim_matches('"');
            if !path.is_empty() {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

#[async_trait]
impl Vcs for GitVcs {
    async fn head(&self) -> Result<String, VcsError> {
        Ok(self.git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn changed_since(&self, since: &str) -> Result<Vec<String>, VcsError> {
        let range = format!("{since}..HEAD");
        let out = self
            .git(&["diff", "--name-only", "--no-renames", &range])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn dirty_paths(&self) -> Result<Vec<String>, VcsError> {
        let out = self
            .git(&["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&out))
    }

    async fn commit(&self, paths: &[String], message: &str) -> Result<(), VcsError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut add = vec!["add", "-A", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add).await?;
        self.git(&["commit", "-q", "-m", message]).await?;
        Ok(())
    }

    async fn revert(&self, to: &str, dirty: &[String]) -> Result<(), VcsError> {
        self.git(&["reset", "-q", "--hard", "HEAD"]).await?;
        if !dirty.is_empty() {
            let mut clean = vec!["clean", "-fdq", "--"];
            clean.extend(dirty.iter().map(String::as_str));
            self.git(&clean).await?;
        }

        let head = self.head().await?;
        if head == to {
            return Ok(());
        }
        let range = format!("{to}..HEAD");
        match self.git(&["revert", "--no-edit", &range]).await {
            Ok(_) => {
                debug!(to, "Commits reverted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "git revert failed, resetting to pre-task revision");
                let _ = self.git(&["revert", "--abort"]).await;
                self.git(&["reset", "-q", "--hard", to]).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_porcelain() {
        let out = " M src/lib.rs\n?? scripts/new.py\nR  old.txt -> new.txt\n\"\" \n";
        assert_eq!(
            parse_porcelain(out),
            vec!["src/lib.rs", "scripts/new.py", "old.txt", "new.txt"]
        );
    }

    async fn init_repo(dir: &Path) -> GitVcs {
        let vcs = GitVcs::new(dir);
        vcs.git(&["init", "-q"]).await.unwrap();
        vcs.git(&["config", "user.email", "bot@example.com"]).await.unwrap();
        vcs.git(&["config", "user.name", "bot"]).await.unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        vcs.commit(&["README.md".to_string()], "init").await.unwrap();
        vcs
    }

    #[tokio::test]
    async fn test_git_revert_restores_tree() {
        let dir = TempDir::new().unwrap();
        let vcs = init_repo(dir.path()).await;
        let pre = vcs.head().await.unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/risk.rs"), "loosen\n").unwrap();
        vcs.commit(&["src/risk.rs".to_string()], "agent change").await.unwrap();
        std::fs::write(dir.path().join("README.md"), "edited\n").unwrap();
        std::fs::write(dir.path().join("stray.txt"), "x\n").unwrap();

        let changed = collect_changes(&vcs, &pre).await.unwrap();
        assert_eq!(changed, vec!["README.md", "src/risk.rs", "stray.txt"]);

        let dirty = vcs.dirty_paths().await.unwrap();
        vcs.revert(&pre, &dirty).await.unwrap();

        assert!(!dir.path().join("src/risk.rs").exists());
        assert!(!dir.path().join("stray.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "hello\n"
        );
        assert!(vcs.dirty_paths().await.unwrap().is_empty());
    }
}
