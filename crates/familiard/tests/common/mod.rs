//! Shared fixtures for familiard integration tests: a scratch repository, a daemon
//! wired to it, and a shell script standing in for the agent binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use familiar_core::{Config, Workflow, WorkflowStatus};
use familiard::{Daemon, DaemonConfig};
use tempfile::TempDir;

/// Agent that edits a file, commits it and reports completion.
pub const COMMITTING_AGENT: &str = r#"echo "working on: $1"
echo "change from $(basename "$PWD")" > feature.txt
git add feature.txt
git commit -q -m "implement task"
echo "Modified feature.txt"
echo "<promise>COMPLETE</promise>"
"#;

/// Agent that never finishes on its own.
pub const SLEEPING_AGENT: &str = "echo started\nexec sleep 30\n";

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Repository on `main` with one commit.
pub fn init_repo(repo: &Path) {
    std::fs::create_dir_all(repo).unwrap();
    git(repo, &["init", "-q"]);
    git(repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(repo, &["config", "user.email", "test@test.com"]);
    git(repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "-q", "-m", "Initial commit"]);
}

pub struct Harness {
    pub dir: TempDir,
    pub daemon: Daemon,
    pub config: DaemonConfig,
    pub project: Config,
}

impl Harness {
    pub async fn new(agent_script: &str) -> Self {
        Self::with(agent_script, &[], |_, _| {}).await
    }

    /// Build a daemon over a fresh repository. `grimoires` are written to the user
    /// grimoire directory; `tweak` adjusts settings before the daemon is created.
    pub async fn with(
        agent_script: &str,
        grimoires: &[(&str, &str)],
        tweak: impl FnOnce(&mut DaemonConfig, &mut Config),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let repo = root.join("repo");
        init_repo(&repo);

        let agent = root.join("agent.sh");
        std::fs::write(&agent, agent_script).unwrap();

        let grimoire_dir = root.join("grimoires");
        std::fs::create_dir_all(&grimoire_dir).unwrap();
        for (name, source) in grimoires {
            std::fs::write(grimoire_dir.join(format!("{name}.yaml")), source).unwrap();
        }

        let mut project = Config {
            base_branch: Some("main".to_string()),
            worktree_dir: root.join("worktrees").display().to_string(),
            agent_bin: PathBuf::from("/bin/sh"),
            agent_args: vec![agent.display().to_string()],
            max_concurrent_agents: 2,
            grimoire_dir,
            spell_dir: root.join("spells"),
            ..Config::default()
        };
        let mut config = DaemonConfig {
            workspace_root: repo,
            state_dir: root.join("state"),
            db_path: root.join("state").join("familiard.db"),
            port: 0,
            auth_token: None,
        };
        tweak(&mut config, &mut project);

        let daemon = Daemon::with_project(config.clone(), project.clone())
            .await
            .unwrap();
        Self {
            dir,
            daemon,
            config,
            project,
        }
    }

    /// A second daemon over the same repository and state, as after a restart.
    pub async fn restart(&self) -> Daemon {
        Daemon::with_project(self.config.clone(), self.project.clone())
            .await
            .unwrap()
    }

    pub fn repo(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn worktree(&self, task_id: &str) -> PathBuf {
        self.daemon
            .engine()
            .deps()
            .worktrees
            .path_for(task_id)
    }

    /// Poll until the workflow reaches `status`.
    pub async fn wait_for(&self, task_id: &str, status: WorkflowStatus) -> Workflow {
        let engine = self.daemon.engine();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let workflow = engine.get(task_id).unwrap();
            if workflow.status == status {
                return workflow;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workflow {task_id} stuck in {} (wanted {}): {:?}",
                workflow.status.as_str(),
                status.as_str(),
                workflow.error
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll until `check` holds.
    pub async fn wait_until(&self, what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
