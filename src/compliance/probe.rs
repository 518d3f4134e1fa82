//! Read-only view of the project the compliance rules inspect.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};

pub trait ProjectProbe: Send + Sync {
    /// Checked-out branch, `None` when detached or not a repository.
    fn current_branch(&self) -> Result<Option<String>>;
    /// Paths staged for commit (added, copied or modified).
    fn staged_files(&self) -> Result<Vec<String>>;
    /// Lines the staged diff adds to `path`.
    fn staged_additions(&self, path: &str) -> Result<Vec<String>>;
    /// Whether a project-relative path exists.
    fn exists(&self, relative: &str) -> bool;
}

/// Probe backed by the `git` CLI.
pub struct GitProbe {
    root: PathBuf,
}

impl GitProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProjectProbe for GitProbe {
    fn current_branch(&self) -> Result<Option<String>> {
        let output = run_git(&self.root, ["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!branch.is_empty() && branch != "HEAD").then_some(branch))
    }

    fn staged_files(&self) -> Result<Vec<String>> {
        let output = run_git(
            &self.root,
            ["diff", "--cached", "--name-only", "--diff-filter=ACM"],
        )?;
        if !output.status.success() {
            bail!(
                "git diff --cached failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn staged_additions(&self, path: &str) -> Result<Vec<String>> {
        let output = run_git(&self.root, ["diff", "--cached", "-U0", "--", path])?;
        if !output.status.success() {
            bail!(
                "git diff --cached {path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .map(|l| l[1..].to_string())
            .collect())
    }

    fn exists(&self, relative: &str) -> bool {
        self.root.join(relative).exists()
    }
}

fn run_git<I, S>(root: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git")
        .current_dir(root)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git in {}", root.display()))
}

/// Fixed project state, for embedding hosts that already know it and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub branch: Option<String>,
    pub staged: BTreeMap<String, Vec<String>>,
    pub files: BTreeSet<String>,
}

impl StaticProbe {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..Self::default()
        }
    }

    pub fn with_staged(mut self, path: &str, added: &[&str]) -> Self {
        self.staged.insert(
            path.to_string(),
            added.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.files.insert(path.to_string());
        self
    }
}

impl ProjectProbe for StaticProbe {
    fn current_branch(&self) -> Result<Option<String>> {
        Ok(self.branch.clone())
    }

    fn staged_files(&self) -> Result<Vec<String>> {
        Ok(self.staged.keys().cloned().collect())
    }

    fn staged_additions(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.staged.get(path).cloned().unwrap_or_default())
    }

    fn exists(&self, relative: &str) -> bool {
        self.files.contains(relative)
    }
}
