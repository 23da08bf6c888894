//! Per-task worktrees and the merge gate's git side.
//!
//! Each task gets `<base_dir>/<task_slug>` on branch `<prefix><task_slug>`. Creation and
//! removal for different tasks run concurrently; merges are serialized per target
//! branch. All git work runs on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use familiar_core::prompt::{sanitize_branch_name, task_slug};
use familiar_core::WorktreeInfo;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::{self, MergeResult};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("no worktree for task {0}")]
    WorktreeNotFound(String),
    #[error("worktree path {path} is occupied by branch {found}")]
    PathConflict { path: String, found: String },
    #[error("worktree task panicked: {0}")]
    Join(String),
}

impl WorktreeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::WorktreeNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Outcome of `merge_to_feature`. A conflict is an expected result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged { commit: String },
    Conflict { files: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub worktree_removed: bool,
    pub branch_deleted: bool,
}

/// A worktree no live workflow accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanWorktree {
    pub path: String,
    pub branch: Option<String>,
    pub head: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeSettings {
    pub repo: PathBuf,
    pub base_dir: PathBuf,
    pub branch_prefix: String,
    /// Branch new task branches start from.
    pub base_branch: String,
    /// Branch merges integrate into.
    pub target_branch: String,
}

impl WorktreeSettings {
    /// Derive settings from project config, detecting the base branch when unset.
    pub fn from_config(repo: &Path, config: &familiar_core::Config) -> Self {
        let base_branch = config.base_branch.clone().unwrap_or_else(|| {
            git::detect_default_branch(repo).unwrap_or_else(|_| "main".to_string())
        });
        let target_branch = config
            .feature_branch
            .clone()
            .unwrap_or_else(|| base_branch.clone());
        Self {
            repo: repo.to_path_buf(),
            base_dir: git::resolve_worktree_dir(&config.worktree_dir, repo),
            branch_prefix: config.branch_prefix.clone(),
            base_branch,
            target_branch,
        }
    }
}

#[derive(Debug)]
pub struct WorktreeManager {
    settings: Arc<WorktreeSettings>,
    merge_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WorktreeError::Join(e.to_string()))?
}

impl WorktreeManager {
    pub fn new(settings: WorktreeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            merge_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &WorktreeSettings {
        &self.settings
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.settings.base_dir.join(task_slug(task_id))
    }

    pub fn branch_for(&self, task_id: &str) -> String {
        format!("{}{}", self.settings.branch_prefix, task_slug(task_id))
    }

    /// Create the task's worktree, or return it if it already exists.
    pub async fn create_for_task(&self, task_id: &str) -> Result<WorktreeInfo> {
        let settings = Arc::clone(&self.settings);
        let path = self.path_for(task_id);
        let branch = self.branch_for(task_id);
        let task = task_id.to_string();

        blocking(move || {
            let path_str = path.to_string_lossy().to_string();
            if let Some(existing) = find_at(&settings.repo, &path)? {
                if existing.branch.as_deref() == Some(branch.as_str()) {
                    debug!(task_id = %task, path = %path_str, "reusing existing worktree");
                    return Ok(existing);
                }
                return Err(WorktreeError::PathConflict {
                    path: path_str,
                    found: existing.branch.unwrap_or_else(|| "(detached)".to_string()),
                });
            }

            // A directory deleted by hand leaves a stale registration behind.
            git::prune_worktrees(&settings.repo)?;
            git::add_worktree(&settings.repo, &path, &branch, &settings.base_branch)?;
            info!(task_id = %task, path = %path_str, branch = %branch, "worktree created");

            find_at(&settings.repo, &path)?.ok_or(WorktreeError::WorktreeNotFound(task))
        })
        .await
    }

    fn merge_lock(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .merge_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(target.to_string()).or_default())
    }

    /// Merge the task branch into the target branch.
    ///
    /// Uncommitted work in the task worktree is committed first. The merge runs in
    /// whichever worktree has the target checked out, or in a temporary integration
    /// worktree when none does.
    pub async fn merge_to_feature(&self, task_id: &str) -> Result<MergeOutcome> {
        let target = self.settings.target_branch.clone();
        let lock = self.merge_lock(&target);
        let _guard = lock.lock().await;

        let settings = Arc::clone(&self.settings);
        let path = self.path_for(task_id);
        let branch = self.branch_for(task_id);
        let task = task_id.to_string();

        blocking(move || {
            let repo = &settings.repo;
            if find_at(repo, &path)?.is_none() {
                if !git::branch_exists(repo, &branch)? {
                    return Err(WorktreeError::WorktreeNotFound(task));
                }
            } else if git::commit_all(&path, &format!("familiar: work for {task}"))? {
                debug!(task_id = %task, "committed pending worktree changes before merge");
            }

            if !git::branch_exists(repo, &target)? {
                git::create_branch(repo, &target, &settings.base_branch)?;
            }

            let message = format!("Merge {branch} into {target} (task {task})");
            let checked_out = git::list_worktrees(repo)?
                .into_iter()
                .find(|w| w.branch.as_deref() == Some(target.as_str()));

            let result = match checked_out {
                Some(wt) => git::merge_no_ff(Path::new(&wt.path), &branch, &message)?,
                None => {
                    let scratch = settings
                        .base_dir
                        .join(format!(".integrate-{}", sanitize_branch_name(&target)));
                    git::prune_worktrees(repo)?;
                    git::add_worktree(repo, &scratch, &target, &settings.base_branch)?;
                    let merged = git::merge_no_ff(&scratch, &branch, &message);
                    if let Err(e) = git::remove_worktree(repo, &scratch, true) {
                        warn!(path = %scratch.display(), error = %e, "failed to remove integration worktree");
                    }
                    merged?
                }
            };

            Ok(match result {
                MergeResult::Merged { commit } => {
                    info!(task_id = %task, branch = %branch, target = %target, commit = %commit, "merged task branch");
                    MergeOutcome::Merged { commit }
                }
                MergeResult::Conflict { files } => {
                    warn!(task_id = %task, branch = %branch, target = %target, files = ?files, "merge conflict");
                    MergeOutcome::Conflict { files }
                }
            })
        })
        .await
    }

    /// Remove the task worktree. The branch is deleted once it is merged into the
    /// target, or unconditionally when `discard` is set.
    pub async fn cleanup_for_task(&self, task_id: &str, discard: bool) -> Result<CleanupReport> {
        let settings = Arc::clone(&self.settings);
        let path = self.path_for(task_id);
        let branch = self.branch_for(task_id);
        let task = task_id.to_string();

        blocking(move || {
            let repo = &settings.repo;
            let mut report = CleanupReport {
                worktree_removed: false,
                branch_deleted: false,
            };

            if find_at(repo, &path)?.is_some() {
                git::remove_worktree(repo, &path, true)?;
                report.worktree_removed = true;
            }

            if git::branch_exists(repo, &branch)? {
                let merged = git::branch_exists(repo, &settings.target_branch)?
                    && git::is_merged(repo, &branch, &settings.target_branch)?;
                if merged || discard {
                    git::delete_branch(repo, &branch, true)?;
                    report.branch_deleted = true;
                } else {
                    debug!(task_id = %task, branch = %branch, "keeping unmerged task branch");
                }
            }

            info!(
                task_id = %task,
                worktree_removed = report.worktree_removed,
                branch_deleted = report.branch_deleted,
                "worktree cleanup"
            );
            Ok(report)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let repo = self.settings.repo.clone();
        blocking(move || Ok(git::list_worktrees(&repo)?)).await
    }

    /// Task worktrees that no live task accounts for. Nothing is removed.
    pub async fn detect_orphans(&self, live_tasks: &HashSet<String>) -> Result<Vec<OrphanWorktree>> {
        let live_paths: HashSet<PathBuf> = live_tasks.iter().map(|t| self.path_for(t)).collect();
        let base_dir = self.settings.base_dir.clone();
        let prefix = self.settings.branch_prefix.clone();

        let orphans = self
            .list()
            .await?
            .into_iter()
            .filter(|w| !w.is_main && !w.is_bare)
            .filter_map(|w| {
                let path = PathBuf::from(&w.path);
                let ours = path.starts_with(&base_dir)
                    || w.branch.as_deref().is_some_and(|b| b.starts_with(&prefix));
                if !ours || live_paths.contains(&path) {
                    return None;
                }
                let reason = if path.exists() {
                    "no live workflow for this worktree"
                } else {
                    "worktree directory is missing"
                };
                Some(OrphanWorktree {
                    path: w.path,
                    branch: w.branch,
                    head: w.head,
                    reason: reason.to_string(),
                })
            })
            .collect();
        Ok(orphans)
    }
}

/// The registered worktree at `path`, if any.
fn find_at(repo: &Path, path: &Path) -> Result<Option<WorktreeInfo>> {
    let wanted = git::normalize_path(path);
    Ok(git::list_worktrees(repo)?
        .into_iter()
        .find(|w| git::normalize_path(Path::new(&w.path)) == wanted))
}
