//! Worktree manager: isolated git worktrees for agents that mutate a
//! working copy.
//!
//! All git invocations use explicit argument arrays, never a shell string,
//! and every identifier that reaches a branch or path is sanitized first.
//! Any failure comes back as a structured error so the supervisor can
//! degrade to a non-isolated spawn instead of aborting the task.

use crate::{persistence::DataPaths, CosError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Placement of one agent's isolated checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
}

/// Seam the supervisor spawns through; tests substitute a stub.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(
        &self,
        agent_id: &str,
        source_repo: &Path,
        task_id: &str,
        base_branch: Option<&str>,
    ) -> Result<WorktreeInfo>;

    async fn remove(
        &self,
        agent_id: &str,
        source_repo: &Path,
        branch_name: &str,
        merge: bool,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct WorktreeManager {
    paths: DataPaths,
}

impl WorktreeManager {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }

    fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.paths.worktrees_dir().join(agent_id)
    }

    /// Branch names and paths are derived from these ids; restrict them to
    /// characters that cannot smuggle git syntax.
    fn sanitize_id(value: &str, what: &str) -> Result<String> {
        if value.is_empty() || value.len() > 128 {
            return Err(CosError::Validation(format!("{what} has invalid length")));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CosError::Validation(format!(
                "{what} may only contain alphanumerics, hyphens and underscores"
            )));
        }
        Ok(value.to_string())
    }

    async fn run_git(repo: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .await
            .map_err(|e| CosError::Git {
                message: format!("git not runnable: {e}"),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(CosError::Git {
                message: format!(
                    "git {} failed: {}",
                    args.first().copied().unwrap_or(""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    async fn ref_exists(repo: &Path, reference: &str) -> bool {
        Self::run_git(repo, &["rev-parse", "--verify", "--quiet", reference])
            .await
            .is_ok()
    }

    /// Resolve the base: explicit request, else detected `main`/`master`,
    /// else whatever HEAD points at. Remote-tracking refs are preferred so
    /// fresh worktrees start from origin's state.
    async fn resolve_base(repo: &Path, requested: Option<&str>) -> Result<(String, String)> {
        let base = if let Some(explicit) = requested {
            explicit.to_string()
        } else if Self::ref_exists(repo, "refs/heads/main").await
            || Self::ref_exists(repo, "refs/remotes/origin/main").await
        {
            "main".to_string()
        } else if Self::ref_exists(repo, "refs/heads/master").await
            || Self::ref_exists(repo, "refs/remotes/origin/master").await
        {
            "master".to_string()
        } else {
            Self::run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?
        };

        let origin_ref = format!("origin/{base}");
        let start_point = if Self::ref_exists(repo, &format!("refs/remotes/{origin_ref}")).await {
            origin_ref
        } else {
            base.clone()
        };
        Ok((base, start_point))
    }

    /// Enumerate managed worktree directories (one per agent id).
    async fn managed_dirs(&self) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.paths.worktrees_dir()).await else {
            return found;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                found.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        found
    }

    /// Remove every managed worktree whose agent id is not active. Run at
    /// boot to reclaim checkouts left behind by a crash.
    pub async fn cleanup_orphans(
        &self,
        source_repo: &Path,
        active_agent_ids: &HashSet<String>,
    ) -> Result<usize> {
        let mut removed = 0;
        for (agent_id, path) in self.managed_dirs().await {
            if active_agent_ids.contains(&agent_id) {
                continue;
            }
            warn!(agent_id = %agent_id, "removing orphaned worktree");
            if let Err(e) = Self::run_git(
                source_repo,
                &["worktree", "remove", "--force", &path.display().to_string()],
            )
            .await
            {
                debug!(error = %e, "git worktree remove failed, deleting directory");
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
            removed += 1;
        }
        if removed > 0 {
            let _ = Self::run_git(source_repo, &["worktree", "prune"]).await;
            // Branches of orphaned agents match cos/*/<agentId>.
            if let Ok(listing) = Self::run_git(source_repo, &["branch", "--list", "cos/*"]).await {
                for line in listing.lines() {
                    let branch = line.trim_start_matches('*').trim();
                    let orphaned = branch
                        .rsplit('/')
                        .next()
                        .map(|id| !active_agent_ids.contains(id))
                        .unwrap_or(false);
                    if orphaned {
                        let _ = Self::run_git(source_repo, &["branch", "-D", branch]).await;
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl WorkspaceProvider for WorktreeManager {
    async fn create(
        &self,
        agent_id: &str,
        source_repo: &Path,
        task_id: &str,
        base_branch: Option<&str>,
    ) -> Result<WorktreeInfo> {
        let agent_id = Self::sanitize_id(agent_id, "agent id")?;
        let task_id = Self::sanitize_id(task_id, "task id")?;

        if !source_repo.is_dir() {
            return Err(CosError::External(format!(
                "source repo does not exist: {}",
                source_repo.display()
            )));
        }

        crate::persistence::ensure_dir(&self.paths.worktrees_dir()).await?;

        // Stale remote refs would base the worktree on old history; a
        // fetch failure (offline) only costs freshness.
        if let Err(e) = Self::run_git(source_repo, &["fetch", "--prune"]).await {
            warn!(error = %e, "git fetch failed, using local refs");
        }

        let (base_branch, start_point) = Self::resolve_base(source_repo, base_branch).await?;
        let branch_name = format!("cos/{task_id}/{agent_id}");
        let worktree_path = self.worktree_path(&agent_id);

        Self::run_git(
            source_repo,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &worktree_path.display().to_string(),
                &start_point,
            ],
        )
        .await?;

        info!(agent_id = %agent_id, branch = %branch_name, base = %base_branch,
              "created isolated worktree");
        Ok(WorktreeInfo {
            worktree_path,
            branch_name,
            base_branch,
        })
    }

    async fn remove(
        &self,
        agent_id: &str,
        source_repo: &Path,
        branch_name: &str,
        merge: bool,
    ) -> Result<()> {
        let agent_id = Self::sanitize_id(agent_id, "agent id")?;
        let worktree_path = self.worktree_path(&agent_id);

        if merge {
            // Only a fast-forward is safe unattended; anything needing a
            // merge commit is left on the branch for a human.
            match Self::run_git(source_repo, &["merge", "--ff-only", branch_name]).await {
                Ok(_) => info!(branch = %branch_name, "fast-forwarded agent commits"),
                Err(e) => warn!(branch = %branch_name, error = %e,
                               "fast-forward failed, leaving branch unmerged"),
            }
        }

        Self::run_git(
            source_repo,
            &["worktree", "remove", "--force", &worktree_path.display().to_string()],
        )
        .await?;
        if let Err(e) = Self::run_git(source_repo, &["branch", "-D", branch_name]).await {
            debug!(branch = %branch_name, error = %e, "branch delete failed");
        }

        info!(agent_id = %agent_id, "removed worktree");
        Ok(())
    }
}
