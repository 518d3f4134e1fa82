//! The four laws.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::probe::ProjectProbe;
use crate::analyzer::{is_production_path, is_test_path};

const DEFAULT_PROTECTED_BRANCHES: &[&str] = &["main", "master"];
const DEFAULT_DISALLOWED: &[&str] = &["console.log(", "debugger;", ".only(", "dbg!("];
const DEFAULT_DOCS_DIR: &str = "docs/features";

/// Tools whose target is a file being written.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub path: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub target: Option<String>,
    pub at: DateTime<Utc>,
}

/// Session-local observations fed in by the host.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    pub file_changes: Vec<FileChange>,
    pub tool_calls: Vec<ToolCall>,
    pub active_feature: Option<String>,
}

impl Activity {
    /// Every file write seen, from tracked changes and write-tool calls, in
    /// time order.
    pub fn writes(&self) -> Vec<(&str, DateTime<Utc>)> {
        let mut writes: Vec<(&str, DateTime<Utc>)> = self
            .file_changes
            .iter()
            .map(|c| (c.path.as_str(), c.at))
            .chain(self.tool_calls.iter().filter_map(|call| {
                let target = call.target.as_deref()?;
                WRITE_TOOLS
                    .contains(&call.tool.as_str())
                    .then_some((target, call.at))
            }))
            .collect();
        writes.sort_by_key(|(_, at)| *at);
        writes
    }
}

/// What a rule reads during one evaluation.
pub struct RuleContext<'a> {
    pub probe: &'a dyn ProjectProbe,
    pub activity: &'a Activity,
    pub config: &'a BTreeMap<String, Value>,
}

impl RuleContext<'_> {
    fn strings(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.config.get(key).and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub message: String,
    pub corrective_action: Option<String>,
}

impl Finding {
    fn new(message: String, corrective_action: String) -> Self {
        Self {
            message,
            corrective_action: Some(corrective_action),
        }
    }
}

pub trait ComplianceRule: Send + Sync {
    /// Slug used as the policy key.
    fn id(&self) -> &'static str;
    fn law(&self) -> u32;
    fn description(&self) -> &'static str;
    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Finding>>;
}

pub fn default_rules() -> Vec<Box<dyn ComplianceRule>> {
    vec![
        Box::new(TestFirst),
        Box::new(ProtectedBranch),
        Box::new(NoDisallowedConstructs),
        Box::new(FeatureDocs),
    ]
}

/// Law 1: a production file is only written after a test for it.
pub struct TestFirst;

impl ComplianceRule for TestFirst {
    fn id(&self) -> &'static str {
        "test-first"
    }

    fn law(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Write a failing test before the production code it covers"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Finding>> {
        let mut tested: Vec<String> = Vec::new();
        let mut findings = Vec::new();
        for (path, _) in ctx.activity.writes() {
            if is_test_path(path) {
                tested.push(test_subject(path));
                continue;
            }
            if !is_production_path(path) {
                continue;
            }
            let subject = file_stem(path);
            if !tested.contains(&subject) {
                findings.push(Finding::new(
                    format!("{path} was written before any test for `{subject}`"),
                    format!("Write a failing test for `{subject}` before changing {path}"),
                ));
            }
        }
        findings.dedup();
        Ok(findings)
    }
}

/// Law 2: no work directly on a protected branch.
pub struct ProtectedBranch;

impl ComplianceRule for ProtectedBranch {
    fn id(&self) -> &'static str {
        "protected-branch"
    }

    fn law(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "Never work directly on a protected branch"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Finding>> {
        let Some(branch) = ctx.probe.current_branch()? else {
            return Ok(Vec::new());
        };
        let protected = ctx.strings("branches", DEFAULT_PROTECTED_BRANCHES);
        if !protected.contains(&branch) {
            return Ok(Vec::new());
        }
        Ok(vec![Finding::new(
            format!("Working directly on protected branch `{branch}`"),
            "Create a feature branch (git switch -c feature/<name>) and move the work there"
                .to_string(),
        )])
    }
}

/// Law 3: no debugging leftovers in staged changes.
pub struct NoDisallowedConstructs;

impl ComplianceRule for NoDisallowedConstructs {
    fn id(&self) -> &'static str {
        "no-disallowed-constructs"
    }

    fn law(&self) -> u32 {
        3
    }

    fn description(&self) -> &'static str {
        "Staged changes must not add debugging leftovers"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Finding>> {
        let patterns = ctx.strings("patterns", DEFAULT_DISALLOWED);
        let mut findings = Vec::new();
        for file in ctx.probe.staged_files()? {
            let added = ctx.probe.staged_additions(&file)?;
            for pattern in &patterns {
                if added.iter().any(|line| line.contains(pattern.as_str())) {
                    findings.push(Finding::new(
                        format!("Staged changes to {file} add `{pattern}`"),
                        format!("Remove `{pattern}` from {file} before committing"),
                    ));
                }
            }
        }
        Ok(findings)
    }
}

/// Law 4: the feature in progress has documentation.
pub struct FeatureDocs;

impl ComplianceRule for FeatureDocs {
    fn id(&self) -> &'static str {
        "feature-docs"
    }

    fn law(&self) -> u32 {
        4
    }

    fn description(&self) -> &'static str {
        "Active features must be documented"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Finding>> {
        let Some(feature) = ctx.activity.active_feature.as_deref() else {
            return Ok(Vec::new());
        };
        let dir = ctx.string("docs_dir", DEFAULT_DOCS_DIR);
        let dir = dir.trim_end_matches('/');
        let slug = slugify(feature);
        if slug.is_empty() {
            return Ok(Vec::new());
        }
        let flat = format!("{dir}/{slug}.md");
        let nested = format!("{dir}/{slug}/README.md");
        if ctx.probe.exists(&flat) || ctx.probe.exists(&nested) {
            return Ok(Vec::new());
        }
        Ok(vec![Finding::new(
            format!("Feature `{feature}` has no documentation in {dir}"),
            format!("Create {flat} describing `{feature}`"),
        )])
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn file_stem(path: &str) -> String {
    let name = file_name(path);
    name.split('.').next().unwrap_or(name).to_ascii_lowercase()
}

/// Production stem a test file covers: `auth.test.ts`, `auth_test.go` and
/// `test_auth.py` all cover `auth`.
fn test_subject(path: &str) -> String {
    let stem = file_stem(path);
    let stem = stem.strip_prefix("test_").unwrap_or(&stem);
    let stem = stem
        .strip_suffix("_test")
        .or_else(|| stem.strip_suffix("_spec"))
        .unwrap_or(stem);
    stem.to_string()
}

fn slugify(feature: &str) -> String {
    let mut slug = String::with_capacity(feature.len());
    for c in feature.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
