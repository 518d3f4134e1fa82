//! Periodic compliance checks against project state.
//!
//! Each rule ("law") is evaluated independently on every [`ComplianceMonitor::check`].
//! A rule that errors is logged and skipped for that tick. New violations are
//! deduplicated by `(rule id, message)` for the life of the monitor and
//! appended to a durable history document.

mod probe;
mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use probe::{GitProbe, ProjectProbe, StaticProbe};
pub use rules::{
    Activity, ComplianceRule, FeatureDocs, FileChange, Finding, NoDisallowedConstructs,
    ProtectedBranch, RuleContext, TestFirst, ToolCall, default_rules,
};

use crate::issue::{Issue, signature};
use crate::scheduler::Clock;
use crate::store::DocumentStore;

const HISTORY_VERSION: u32 = 1;

/// Occurrence count at which a law counts as ignored.
pub const DEFAULT_IGNORED_AFTER: u64 = 3;

fn default_true() -> bool {
    true
}

/// Policy for one rule. Absent policy means enabled, unlocked, default config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            locked: false,
            config: BTreeMap::new(),
        }
    }
}

/// Rule id to policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompliancePolicy {
    rules: BTreeMap<String, RulePolicy>,
}

impl CompliancePolicy {
    pub fn new(rules: BTreeMap<String, RulePolicy>) -> Self {
        Self { rules }
    }

    /// Read a JSON policy map. A missing file is `Ok(None)`.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let policy = serde_json::from_str(&raw)
            .with_context(|| format!("invalid compliance policy in {}", path.display()))?;
        Ok(Some(policy))
    }

    /// Layer local entries over an externally supplied policy. Locked
    /// external entries win.
    pub fn merged(external: Option<Self>, local: &BTreeMap<String, RulePolicy>) -> Self {
        let mut rules = external.map(|p| p.rules).unwrap_or_default();
        for (id, policy) in local {
            match rules.get(id) {
                Some(existing) if existing.locked => {
                    debug!(rule = %id, "rule is locked by policy file; ignoring local override");
                }
                _ => {
                    rules.insert(id.clone(), policy.clone());
                }
            }
        }
        Self { rules }
    }

    pub fn rule(&self, id: &str) -> RulePolicy {
        self.rules.get(id).cloned().unwrap_or_default()
    }

    pub fn rules(&self) -> &BTreeMap<String, RulePolicy> {
        &self.rules
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule_id: String,
    pub law: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrective_action: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub locked: bool,
    /// How many distinct violations of this rule the session has seen,
    /// this one included.
    pub occurrence: u64,
}

impl Violation {
    pub fn signature(&self) -> String {
        signature(&self.rule_id, &self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceHistory {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub violations: Vec<Violation>,
}

pub struct ComplianceMonitor {
    rules: Vec<Box<dyn ComplianceRule>>,
    policy: CompliancePolicy,
    probe: Box<dyn ProjectProbe>,
    clock: Arc<dyn Clock>,
    activity: Activity,
    seen: BTreeSet<String>,
    counts: BTreeMap<String, u64>,
    history: Vec<Violation>,
    store: Option<Box<dyn DocumentStore<ComplianceHistory>>>,
    ignored_after: u64,
}

impl ComplianceMonitor {
    pub fn new(probe: Box<dyn ProjectProbe>, policy: CompliancePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: default_rules(),
            policy,
            probe,
            clock,
            activity: Activity::default(),
            seen: BTreeSet::new(),
            counts: BTreeMap::new(),
            history: Vec::new(),
            store: None,
            ignored_after: DEFAULT_IGNORED_AFTER,
        }
    }

    pub fn with_rules(mut self, rules: Vec<Box<dyn ComplianceRule>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_ignored_after(mut self, ignored_after: u64) -> Self {
        self.ignored_after = ignored_after;
        self
    }

    /// Back the history with a durable document, loading what it holds.
    pub fn with_history(
        mut self,
        store: Box<dyn DocumentStore<ComplianceHistory>>,
    ) -> Result<Self> {
        self.history = match store.load() {
            Ok(Some(doc)) => doc.violations,
            Ok(None) => Vec::new(),
            Err(e) if e.is_corrupt() => {
                let moved = store
                    .quarantine()
                    .context("failed to quarantine compliance history")?;
                warn!(error = %e, quarantined = ?moved, "compliance history corrupt; starting empty");
                Vec::new()
            }
            Err(e) => return Err(e).context("failed to load compliance history"),
        };
        self.store = Some(store);
        Ok(self)
    }

    pub fn policy(&self) -> &CompliancePolicy {
        &self.policy
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn ComplianceRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn track_file_change(&mut self, path: impl Into<String>, at: DateTime<Utc>) {
        self.activity.file_changes.push(FileChange {
            path: path.into(),
            at,
        });
    }

    pub fn track_tool_call(
        &mut self,
        tool: impl Into<String>,
        target: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.activity.tool_calls.push(ToolCall {
            tool: tool.into(),
            target,
            at,
        });
    }

    pub fn set_active_feature(&mut self, feature: Option<String>) {
        if self.activity.active_feature != feature {
            debug!(feature = ?feature, "active feature changed");
        }
        self.activity.active_feature = feature;
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Evaluate every enabled rule and return violations not seen before.
    pub fn check(&mut self) -> Vec<Violation> {
        let now = self.clock.now();
        let mut fresh = Vec::new();

        for rule in &self.rules {
            let policy = self.policy.rule(rule.id());
            if !policy.enabled {
                continue;
            }
            let ctx = RuleContext {
                probe: self.probe.as_ref(),
                activity: &self.activity,
                config: &policy.config,
            };
            let findings = match rule.evaluate(&ctx) {
                Ok(findings) => findings,
                Err(e) => {
                    warn!(rule = rule.id(), error = %e, "compliance rule failed; skipping");
                    continue;
                }
            };
            for finding in findings {
                if !self.seen.insert(signature(rule.id(), &finding.message)) {
                    continue;
                }
                let count = self.counts.entry(rule.id().to_string()).or_default();
                *count += 1;
                fresh.push(Violation {
                    rule_id: rule.id().to_string(),
                    law: rule.law(),
                    message: finding.message,
                    corrective_action: finding.corrective_action.filter(|a| !a.is_empty()),
                    detected_at: now,
                    locked: policy.locked,
                    occurrence: *count,
                });
            }
        }

        if !fresh.is_empty() {
            info!(count = fresh.len(), "new compliance violations");
            self.history.extend(fresh.iter().cloned());
            self.persist(now);
        }
        fresh
    }

    /// The issue a violation raises, escalated by how often its law has
    /// been broken this session.
    pub fn escalate(&self, violation: &Violation) -> Issue {
        Issue::iron_law(
            violation.law,
            violation.occurrence,
            &violation.message,
            violation.corrective_action.clone(),
            self.ignored_after,
        )
        .with_extra("rule_id", violation.rule_id.clone())
    }

    pub fn history(&self) -> &[Violation] {
        &self.history
    }

    pub fn session_count(&self, rule_id: &str) -> u64 {
        self.counts.get(rule_id).copied().unwrap_or(0)
    }

    pub fn seen_signatures(&self) -> BTreeSet<String> {
        self.seen.clone()
    }

    /// Carry dedup state over from an earlier run.
    pub fn restore_seen(&mut self, seen: impl IntoIterator<Item = String>) {
        self.seen.extend(seen);
    }

    fn persist(&self, now: DateTime<Utc>) {
        let Some(store) = &self.store else {
            return;
        };
        let doc = ComplianceHistory {
            version: HISTORY_VERSION,
            updated_at: now,
            violations: self.history.clone(),
        };
        if let Err(e) = store.save(&doc) {
            warn!(error = %e, "failed to persist compliance history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueType;
    use crate::scheduler::ManualClock;
    use crate::store::{JsonFileStore, MemoryStore};
    use anyhow::bail;
    use chrono::TimeZone;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn build(probe: StaticProbe, policy: CompliancePolicy) -> (ComplianceMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let monitor = ComplianceMonitor::new(Box::new(probe), policy, clock.clone());
        (monitor, clock)
    }

    fn policy(entries: &[(&str, RulePolicy)]) -> BTreeMap<String, RulePolicy> {
        entries
            .iter()
            .map(|(id, p)| (id.to_string(), p.clone()))
            .collect()
    }

    struct Broken;

    impl ComplianceRule for Broken {
        fn id(&self) -> &'static str {
            "broken"
        }
        fn law(&self) -> u32 {
            9
        }
        fn description(&self) -> &'static str {
            "always errors"
        }
        fn evaluate(&self, _ctx: &RuleContext<'_>) -> Result<Vec<Finding>> {
            bail!("probe exploded")
        }
    }

    #[test]
    fn rule_policy_defaults_to_enabled() {
        let parsed: RulePolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, RulePolicy::default());
        assert!(parsed.enabled);
        assert!(CompliancePolicy::default().rule("anything").enabled);
    }

    #[test]
    fn merge_respects_locked_file_entries() {
        let external: CompliancePolicy = serde_json::from_str(
            r#"{
                "protected-branch": {"enabled": true, "locked": true},
                "feature-docs": {"enabled": true}
            }"#,
        )
        .unwrap();
        let disabled = RulePolicy {
            enabled: false,
            ..RulePolicy::default()
        };
        let local = policy(&[
            ("protected-branch", disabled.clone()),
            ("feature-docs", disabled.clone()),
            ("test-first", disabled),
        ]);
        let merged = CompliancePolicy::merged(Some(external), &local);
        assert!(merged.rule("protected-branch").enabled);
        assert!(merged.rule("protected-branch").locked);
        assert!(!merged.rule("feature-docs").enabled);
        assert!(!merged.rule("test-first").enabled);
        assert!(merged.rule("no-disallowed-constructs").enabled);
    }

    #[test]
    fn load_file_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(CompliancePolicy::load_file(&tmp.path().join("nope.json")).unwrap().is_none());

        let path = tmp.path().join("policy.json");
        std::fs::write(&path, r#"{"test-first": {"enabled": false}}"#).unwrap();
        let loaded = CompliancePolicy::load_file(&path).unwrap().unwrap();
        assert!(!loaded.rule("test-first").enabled);

        std::fs::write(&path, "not json").unwrap();
        assert!(CompliancePolicy::load_file(&path).is_err());
    }

    #[test]
    fn check_reports_each_violation_once() {
        let (mut monitor, clock) = build(StaticProbe::on_branch("main"), CompliancePolicy::default());
        let first = monitor.check();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].rule_id, "protected-branch");
        assert_eq!(first[0].law, 2);
        assert_eq!(first[0].occurrence, 1);
        assert_eq!(first[0].detected_at, start());
        assert!(first[0].corrective_action.is_some());

        clock.advance(Duration::from_secs(60));
        assert!(monitor.check().is_empty());
        assert_eq!(monitor.history().len(), 1);
        assert_eq!(monitor.session_count("protected-branch"), 1);
    }

    #[test]
    fn disabled_rule_never_fires() {
        let local = policy(&[(
            "protected-branch",
            RulePolicy {
                enabled: false,
                ..RulePolicy::default()
            },
        )]);
        let (mut monitor, _) = build(
            StaticProbe::on_branch("main"),
            CompliancePolicy::merged(None, &local),
        );
        assert!(monitor.check().is_empty());
    }

    #[test]
    fn locked_flag_is_carried_onto_violations() {
        let local = policy(&[(
            "protected-branch",
            RulePolicy {
                locked: true,
                ..RulePolicy::default()
            },
        )]);
        let (mut monitor, _) = build(
            StaticProbe::on_branch("master"),
            CompliancePolicy::merged(None, &local),
        );
        let found = monitor.check();
        assert!(found[0].locked);
    }

    #[test]
    fn repeated_law_escalates_to_repeated_then_ignored() {
        let (mut monitor, clock) = build(StaticProbe::default(), CompliancePolicy::default());
        let mut issues = Vec::new();
        for (i, file) in ["src/a.ts", "src/b.ts", "src/c.ts"].iter().enumerate() {
            clock.advance(Duration::from_secs(1));
            monitor.track_file_change(*file, start() + chrono::Duration::seconds(i as i64));
            for v in monitor.check() {
                issues.push(monitor.escalate(&v));
            }
        }
        let types: Vec<IssueType> = issues.iter().map(|i| i.issue_type).collect();
        assert_eq!(
            types,
            vec![
                IssueType::IronLawViolation,
                IssueType::IronLawRepeated,
                IssueType::IronLawIgnored,
            ]
        );
        assert!(issues[1].message.contains("2 times"));
        assert_eq!(issues[1].context()["count"], 2);
        assert_eq!(issues[1].context()["rule_id"], "test-first");
    }

    #[test]
    fn failing_rule_is_skipped() {
        let (monitor, _) = build(StaticProbe::on_branch("main"), CompliancePolicy::default());
        let mut monitor = monitor.with_rules(vec![Box::new(Broken), Box::new(ProtectedBranch)]);
        let found = monitor.check();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule_id, "protected-branch");
    }

    #[test]
    fn restored_signatures_suppress_renotification() {
        let (mut first, _) = build(StaticProbe::on_branch("main"), CompliancePolicy::default());
        assert_eq!(first.check().len(), 1);

        let (mut second, _) = build(StaticProbe::on_branch("main"), CompliancePolicy::default());
        second.restore_seen(first.seen_signatures());
        assert!(second.check().is_empty());
    }

    #[test]
    fn feature_docs_follow_active_feature() {
        let (mut monitor, _) = build(
            StaticProbe::default().with_file("docs/features/billing.md"),
            CompliancePolicy::default(),
        );
        monitor.set_active_feature(Some("billing".to_string()));
        assert!(monitor.check().is_empty());
        monitor.set_active_feature(Some("search".to_string()));
        let found = monitor.check();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule_id, "feature-docs");
    }

    #[test]
    fn history_is_persisted_and_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("compliance-history.json");
        let (monitor, _) = build(StaticProbe::on_branch("main"), CompliancePolicy::default());
        let mut monitor = monitor
            .with_history(Box::new(JsonFileStore::<ComplianceHistory>::new(&path)))
            .unwrap();
        monitor.check();

        let doc: ComplianceHistory =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.version, HISTORY_VERSION);
        assert_eq!(doc.violations.len(), 1);

        let (reloaded, _) = build(StaticProbe::default(), CompliancePolicy::default());
        let reloaded = reloaded
            .with_history(Box::new(JsonFileStore::<ComplianceHistory>::new(&path)))
            .unwrap();
        assert_eq!(reloaded.history().len(), 1);
    }

    #[test]
    fn corrupt_history_is_quarantined() {
        let store = Arc::new(MemoryStore::<ComplianceHistory>::with_raw("{broken"));
        let (monitor, _) = build(StaticProbe::default(), CompliancePolicy::default());
        let monitor = monitor.with_history(Box::new(store.clone())).unwrap();
        assert!(monitor.history().is_empty());
        assert_eq!(store.quarantined().as_deref(), Some("{broken"));
    }
}
