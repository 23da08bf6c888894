//! Git plumbing for task worktrees and merges.
//!
//! Every function shells out to `git` synchronously; async callers run them on the
//! blocking pool.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};

use familiar_core::WorktreeInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Outcome of merging one branch into the checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged { commit: String },
    Conflict { files: Vec<String> },
}

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

/// Run git and return trimmed stdout, failing on a non-zero exit.
fn git_stdout(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Detect the default branch for a repository.
///
/// Tries `origin/HEAD` first, then `main`, then `master`; falls back to `main`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = git_stdout(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

/// Repository directory name.
pub fn repo_name(repo: &Path) -> String {
    repo.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Expand `{{ repo }}` in the worktree base directory and resolve it against the
/// repository root.
pub fn resolve_worktree_dir(template: &str, repo: &Path) -> PathBuf {
    let name = repo_name(repo);
    let expanded = template
        .replace("{{ repo }}", &name)
        .replace("{{repo}}", &name);
    let path = Path::new(&expanded);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&repo.join(path))
    }
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = git(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git_stdout(repo, &["branch", branch, base])?;
    Ok(())
}

/// Delete a local branch. `force` deletes it even if unmerged.
pub fn delete_branch(repo: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    git_stdout(repo, &["branch", flag, branch])?;
    Ok(())
}

/// Whether every commit of `branch` is reachable from `target`.
pub fn is_merged(repo: &Path, branch: &str, target: &str) -> Result<bool> {
    let output = git(repo, &["merge-base", "--is-ancestor", branch, target])?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(GitError::CommandFailed(format!(
            "git merge-base --is-ancestor {branch} {target}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

pub fn rev_parse(dir: &Path, rev: &str) -> Result<String> {
    git_stdout(dir, &["rev-parse", rev])
}

/// Branch checked out in `dir`, or `None` when detached.
pub fn current_branch(dir: &Path) -> Result<Option<String>> {
    let branch = git_stdout(dir, &["branch", "--show-current"])?;
    Ok((!branch.is_empty()).then_some(branch))
}

/// Add a worktree at `path` with `branch` checked out, creating the branch from
/// `base` if it does not exist yet.
pub fn add_worktree(repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base)?;
    }
    git_stdout(
        repo,
        &["worktree", "add", path.to_string_lossy().as_ref(), branch],
    )?;
    Ok(())
}

/// Remove a worktree. `force` discards local changes.
pub fn remove_worktree(repo: &Path, path: &Path, force: bool) -> Result<()> {
    let path = path.to_string_lossy();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(path.as_ref());
    git_stdout(repo, &args)?;
    Ok(())
}

/// Drop administrative entries for worktrees whose directories are gone.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    git_stdout(repo, &["worktree", "prune"])?;
    Ok(())
}

pub fn list_worktrees(repo: &Path) -> Result<Vec<WorktreeInfo>> {
    let stdout = git_stdout(repo, &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_list(&stdout))
}

/// Parse `git worktree list --porcelain`. The first entry is the main worktree.
pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut worktrees: Vec<WorktreeInfo> = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(WorktreeInfo {
                path: path.to_string(),
                branch: None,
                head: String::new(),
                is_main: worktrees.is_empty(),
                is_bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
        } else if line == "bare" {
            entry.is_bare = true;
        }
    }
    worktrees.extend(current);
    worktrees
}

/// Whether the working tree has no uncommitted or untracked changes.
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    Ok(git_stdout(dir, &["status", "--porcelain"])?.is_empty())
}

/// Stage and commit everything in `dir`. Returns false when there was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    if is_working_tree_clean(dir)? {
        return Ok(false);
    }
    git_stdout(dir, &["add", "--all"])?;
    git_stdout(dir, &["commit", "--no-verify", "-m", message])?;
    Ok(true)
}

/// Paths with unresolved conflicts in `dir`.
pub fn conflict_files(dir: &Path) -> Result<Vec<String>> {
    let stdout = git_stdout(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(stdout.lines().map(str::to_string).collect())
}

/// Merge `source` into the branch checked out in `dir` with a merge commit.
///
/// A conflict is aborted so the tree is left clean, and reported as
/// [`MergeResult::Conflict`] rather than an error.
pub fn merge_no_ff(dir: &Path, source: &str, message: &str) -> Result<MergeResult> {
    if !is_working_tree_clean(dir)? {
        return Err(GitError::DirtyWorkingTree(format!(
            "{} has uncommitted changes",
            dir.display()
        )));
    }

    let output = git(dir, &["merge", "--no-ff", "-m", message, source])?;
    if output.status.success() {
        return Ok(MergeResult::Merged {
            commit: rev_parse(dir, "HEAD")?,
        });
    }

    let files = conflict_files(dir)?;
    if files.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git merge {source}: {}",
            stderr.trim()
        )));
    }
    if let Err(e) = git_stdout(dir, &["merge", "--abort"]) {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to abort conflicted merge");
    }
    Ok(MergeResult::Conflict { files })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    pub fn run(dir: &Path, args: &[&str]) {
        let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Fresh repository on `main` with one commit.
    pub fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        run(&repo, &["init", "-q"]);
        run(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run(&repo, &["config", "user.email", "test@test.com"]);
        run(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
        run(&repo, &["add", "."]);
        run(&repo, &["commit", "-q", "-m", "Initial commit"]);
        dir
    }

    pub fn commit_file(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
        run(dir, &["add", name]);
        run(dir, &["commit", "-q", "-m", &format!("edit {name}")]);
    }
}
