//! Per-project configuration.
//!
//! Read from `.familiar/config` in the repository root, in `key=value` form with `#`
//! comments and optionally quoted values. Precedence: CLI flags > daemon config file >
//! `.familiar/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::duration::parse_duration;

/// Location of the project config relative to the repository root.
pub const PROJECT_CONFIG_PATH: &str = ".familiar/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("{source_name}: invalid config line: {line}")]
    InvalidLine { source_name: String, line: String },
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid duration for {key}: {message}")]
    InvalidDuration { key: String, message: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Branches
    /// Branch new task branches start from. Detected from the repository when unset.
    pub base_branch: Option<String>,
    /// Shared branch that merge steps integrate into. Defaults to the base branch.
    pub feature_branch: Option<String>,
    pub branch_prefix: String,

    // Worktrees
    /// Base directory for task worktrees; `{{ repo }}` expands to the repository name.
    pub worktree_dir: String,

    // Agent
    pub agent_bin: PathBuf,
    pub agent_args: Vec<String>,
    /// Extra environment variable names passed through to agents.
    pub agent_env: Vec<String>,
    pub max_concurrent_agents: usize,
    pub idle_timeout: Duration,

    // Workflows
    pub workflow_timeout: Duration,
    pub default_grimoire: String,
    pub grimoire_dir: PathBuf,
    pub spell_dir: PathBuf,

    // Upstream task source
    pub task_source_cmd: Option<String>,
    pub auto_start: bool,
    pub poll_interval: Duration,

    // Maintenance
    pub orphan_scan_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_branch: None,
            feature_branch: None,
            branch_prefix: "familiar/".to_string(),
            worktree_dir: "../{{ repo }}.worktrees".to_string(),
            agent_bin: PathBuf::from("claude"),
            agent_args: Vec::new(),
            agent_env: Vec::new(),
            max_concurrent_agents: 3,
            idle_timeout: Duration::from_secs(5 * 60),
            workflow_timeout: Duration::from_secs(60 * 60),
            default_grimoire: "default".to_string(),
            grimoire_dir: PathBuf::from(".familiar/grimoires"),
            spell_dir: PathBuf::from(".familiar/spells"),
            task_source_cmd: None,
            auto_start: false,
            poll_interval: Duration::from_secs(30),
            orphan_scan_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.familiar/config` under `root` if it exists, else defaults.
    pub fn for_workspace(root: &Path) -> Result<Self> {
        let path = root.join(PROJECT_CONFIG_PATH);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.resolve_paths(root);
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source_name: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine {
                    source_name: source_name.to_string(),
                    line: line.to_string(),
                });
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "base_branch" => self.base_branch = optional(value),
            "feature_branch" => self.feature_branch = optional(value),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "worktree_dir" => self.worktree_dir = value.to_string(),
            "agent_bin" => self.agent_bin = PathBuf::from(value),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(str::to_string).collect();
            }
            "agent_env" => {
                self.agent_env = value
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "max_concurrent_agents" => {
                self.max_concurrent_agents = match value.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        return Err(ConfigError::InvalidInt {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                };
            }
            "idle_timeout" => self.idle_timeout = Self::parse_duration_value(key, value)?,
            "workflow_timeout" => self.workflow_timeout = Self::parse_duration_value(key, value)?,
            "default_grimoire" => self.default_grimoire = value.to_string(),
            "grimoire_dir" => self.grimoire_dir = PathBuf::from(value),
            "spell_dir" => self.spell_dir = PathBuf::from(value),
            "task_source_cmd" => self.task_source_cmd = optional(value),
            "auto_start" => self.auto_start = Self::parse_bool(key, value)?,
            "poll_interval" => self.poll_interval = Self::parse_duration_value(key, value)?,
            "orphan_scan_interval" => {
                self.orphan_scan_interval = Self::parse_duration_value(key, value)?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_duration_value(key: &str, value: &str) -> Result<Duration> {
        parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve relative directories against the workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.grimoire_dir.is_relative() {
            self.grimoire_dir = workspace_root.join(&self.grimoire_dir);
        }
        if self.spell_dir.is_relative() {
            self.spell_dir = workspace_root.join(&self.spell_dir);
        }
    }

    /// Branch that merge steps integrate into.
    pub fn merge_target(&self) -> Option<&str> {
        self.feature_branch
            .as_deref()
            .or(self.base_branch.as_deref())
    }
}
