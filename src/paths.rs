use std::path::{Path, PathBuf};

use crate::config::{CONFIG_DIR, ProjectConfig};

/// Where every durable file of one project lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub log_file: PathBuf,
}

impl SentinelPaths {
    /// Resolve against the project root. Relative config paths are taken
    /// relative to `root`.
    pub fn resolve(root: &Path, config: &ProjectConfig) -> Self {
        let state_dir = root.join(&config.supervisor.state_dir);
        let log_file = match &config.supervisor.log_file {
            Some(file) => root.join(file),
            None => state_dir.join("activity.jsonl"),
        };
        Self {
            root: root.to_path_buf(),
            state_dir,
            log_file,
        }
    }

    pub fn snapshot(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn compliance_history(&self) -> PathBuf {
        self.state_dir.join("compliance-history.json")
    }

    pub fn notifications_log(&self) -> PathBuf {
        self.state_dir.join("notifications.log")
    }
}

/// Project root for a config file found at `<root>/.sentinel/config.toml`,
/// or `cwd` when there is none.
pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    config_path
        .and_then(Path::parent)
        .filter(|dir| dir.file_name().is_some_and(|n| n == CONFIG_DIR))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}
