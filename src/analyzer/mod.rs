//! Workflow analyzer.
//!
//! A fold over the ordered activity log. [`WorkflowFold::apply`] consumes one
//! entry at a time and records event-driven issues (failures, ordering
//! mistakes, chain breaks) as they happen; [`WorkflowFold::finish`] adds the
//! time-based detections (stalls, silence, abandoned agents) against an
//! injected "now". Replaying the whole log through a fresh fold and applying
//! entries incrementally give identical results.

mod chain;

pub use chain::{AgentRecord, ChainProgress, ChainStage, StageStatus, WorkflowState};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::issue::{Evidence, Issue, IssueType, format_duration_ms};
use crate::log::{AgentDescriptor, EventKind, LogEntry, TddPhase};

/// Detection thresholds. All of them are tunable policy, see `[analyzer]`
/// in the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    /// Repetitions of one milestone must fall within this window to count.
    pub loop_window: Duration,
    pub loop_threshold: u64,
    pub loop_escalation: u64,
    pub loop_confidence: f64,
    pub loop_escalated_confidence: f64,
    pub phase_stuck: Duration,
    /// Per-command stall thresholds, keyed by command name without `/`.
    pub phase_stuck_overrides: BTreeMap<String, Duration>,
    pub silence: Duration,
    pub agent_silence: Duration,
    pub agent_abandon: Duration,
    pub velocity_samples: usize,
    /// Commands expected to log at least one milestone before completing.
    pub milestone_commands: Vec<String>,
    pub iron_law_ignored_after: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            loop_window: Duration::from_secs(5 * 60),
            loop_threshold: 3,
            loop_escalation: 7,
            loop_confidence: 0.85,
            loop_escalated_confidence: 0.95,
            phase_stuck: Duration::from_secs(10 * 60),
            phase_stuck_overrides: BTreeMap::new(),
            silence: Duration::from_secs(15 * 60),
            agent_silence: Duration::from_secs(60),
            agent_abandon: Duration::from_secs(90),
            velocity_samples: 4,
            milestone_commands: vec!["build".to_string()],
            iron_law_ignored_after: 3,
        }
    }
}

impl AnalyzerConfig {
    pub fn stuck_threshold(&self, command: &str) -> Duration {
        self.phase_stuck_overrides
            .get(&command_name(command))
            .copied()
            .unwrap_or(self.phase_stuck)
    }

    fn expects_milestones(&self, command: &str) -> bool {
        let name = command_name(command);
        self.milestone_commands
            .iter()
            .any(|c| command_name(c) == name)
    }
}

/// Result of one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAnalysis {
    pub state: WorkflowState,
    pub agents: Vec<AgentRecord>,
    pub issues: Vec<Issue>,
    pub analyzed_at: DateTime<Utc>,
}

impl WorkflowAnalysis {
    pub fn issues_of(&self, issue_type: IssueType) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |i| i.issue_type == issue_type)
    }
}

pub struct WorkflowAnalyzer {
    config: Arc<AnalyzerConfig>,
}

impl Default for WorkflowAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

impl WorkflowAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// An empty fold sharing this analyzer's thresholds.
    pub fn fold(&self) -> WorkflowFold {
        WorkflowFold::new(Arc::clone(&self.config))
    }

    /// A fold continuing from a persisted state. Agent lifecycles and
    /// per-feature history are not part of the state and start empty.
    pub fn resume(&self, state: WorkflowState) -> WorkflowFold {
        let mut fold = self.fold();
        fold.state = state;
        fold
    }

    /// Fold every entry from scratch and evaluate at `now`.
    pub fn analyze(&self, entries: &[LogEntry], now: DateTime<Utc>) -> WorkflowAnalysis {
        let mut fold = self.fold();
        for entry in entries {
            fold.apply(entry);
        }
        fold.finish(now)
    }

    pub fn analyze_now(&self, entries: &[LogEntry]) -> WorkflowAnalysis {
        self.analyze(entries, Utc::now())
    }
}

#[derive(Debug, Clone)]
struct ActiveCommand {
    command: String,
    started_at: DateTime<Utc>,
    last_progress: DateTime<Utc>,
    milestones: u64,
}

#[derive(Debug, Clone)]
struct MilestoneRun {
    label: String,
    times: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LawTally {
    count: u64,
    detail: String,
    corrective_action: Option<String>,
}

/// Incremental analyzer state.
#[derive(Debug, Clone)]
pub struct WorkflowFold {
    config: Arc<AnalyzerConfig>,
    state: WorkflowState,
    agents: BTreeMap<String, AgentRecord>,
    active: Option<ActiveCommand>,
    phases: BTreeMap<String, TddPhase>,
    red_seen: BTreeSet<String>,
    last_test: BTreeMap<String, bool>,
    milestone_runs: BTreeMap<(String, String), MilestoneRun>,
    recent_milestones: BTreeMap<String, Vec<DateTime<Utc>>>,
    laws: BTreeMap<u32, LawTally>,
    events: Vec<Issue>,
}

impl WorkflowFold {
    fn new(config: Arc<AnalyzerConfig>) -> Self {
        Self {
            config,
            state: WorkflowState::default(),
            agents: BTreeMap::new(),
            active: None,
            phases: BTreeMap::new(),
            red_seen: BTreeSet::new(),
            last_test: BTreeMap::new(),
            milestone_runs: BTreeMap::new(),
            recent_milestones: BTreeMap::new(),
            laws: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.get(agent_id)
    }

    pub fn apply(&mut self, entry: &LogEntry) {
        let ts = entry.timestamp;
        self.state.entries_processed += 1;
        self.state.last_activity = Some(match self.state.last_activity {
            Some(prev) if prev > ts => prev,
            _ => ts,
        });

        let agent = entry.agent_descriptor.as_ref();
        if let Some(descriptor) = agent {
            if let Some(record) = self.agents.get_mut(&descriptor.agent_id) {
                record.last_activity_at = ts;
            }
        }

        match (entry.event_kind, agent) {
            (EventKind::AgentSpawn, Some(a)) => self.agent_spawned(a, ts),
            (EventKind::AgentSpawn, None) => {
                debug!(command = %entry.command, "AGENT_SPAWN without agent descriptor; ignoring");
            }
            (EventKind::Start, Some(a)) => self.agent_started(a, ts),
            (EventKind::Start, None) => self.command_started(entry),
            (EventKind::Complete | EventKind::AgentComplete, Some(a)) => {
                self.agent_completed(entry, a)
            }
            (EventKind::AgentComplete, None) => self.check_completion(entry, &entry.command),
            (EventKind::Complete, None) => self.command_completed(entry),
            (EventKind::Failed, Some(a)) => self.agent_failed(entry, a),
            (EventKind::Failed, None) => self.command_failed(entry),
            (EventKind::Milestone, _) => self.milestone(entry),
            (EventKind::Phase, _) => self.phase(entry),
            (EventKind::TestResult, _) => self.test_result(entry),
            (EventKind::FileChange, _) => self.file_change(entry),
            (EventKind::IronLawCheck, _) => self.iron_law_check(entry),
            (EventKind::ToolCall | EventKind::Other, _) => {}
        }
    }

    /// Event-driven issues so far plus time-based detections at `now`.
    pub fn finish(&self, now: DateTime<Utc>) -> WorkflowAnalysis {
        let mut issues = self.events.clone();
        self.loop_issues(&mut issues);
        self.stall_issues(now, &mut issues);
        self.velocity_issues(&mut issues);
        self.agent_issues(now, &mut issues);
        self.law_issues(&mut issues);

        WorkflowAnalysis {
            state: self.state.clone(),
            agents: self.agents.values().cloned().collect(),
            issues,
            analyzed_at: now,
        }
    }

    // ── commands and chain ──

    fn command_started(&mut self, entry: &LogEntry) {
        let ts = entry.timestamp;
        if let Some(previous) = self.active.take() {
            self.events.push(Issue::new(
                IssueType::AbruptStop,
                format!(
                    "{} was interrupted by {} at {}",
                    previous.command,
                    entry.command,
                    stamp(ts)
                ),
                0.7,
                Evidence::AbruptStop {
                    interrupted: previous.command,
                    started: entry.command.clone(),
                },
            ));
        }

        self.state.chain_complete = false;
        if let Some(stage) = ChainStage::from_command(&entry.command) {
            if self.state.chain.is_complete() {
                self.state.chain = ChainProgress::default();
            }
            if let Some(pred) = stage.predecessor() {
                if self.state.chain.get(pred) != StageStatus::Complete {
                    self.events.push(Issue::new(
                        IssueType::ChainBroken,
                        format!(
                            "{} started at {} before {} completed",
                            stage.as_str(),
                            stamp(ts),
                            pred.as_str()
                        ),
                        0.75,
                        Evidence::Chain {
                            stage: stage.as_str().to_string(),
                            missing_stage: pred.as_str().to_string(),
                        },
                    ));
                }
            }
            self.state.chain.advance(stage, StageStatus::InProgress);
        }

        self.state.current_command = Some(entry.command.clone());
        self.state.current_phase = None;
        self.active = Some(ActiveCommand {
            command: entry.command.clone(),
            started_at: ts,
            last_progress: ts,
            milestones: 0,
        });
    }

    fn command_completed(&mut self, entry: &LogEntry) {
        if let Some(stage) = ChainStage::from_command(&entry.command) {
            self.state.chain.advance(stage, StageStatus::Complete);
            if stage == ChainStage::Ship {
                self.state.chain_complete = true;
            }
        }
        self.check_completion(entry, &entry.command);

        let Some(active) = self.take_active(&entry.command) else {
            return;
        };
        if active.milestones == 0 && self.config.expects_milestones(&entry.command) {
            self.events.push(Issue::new(
                IssueType::MissingMilestones,
                format!(
                    "{} completed at {} without recording any milestones",
                    entry.command,
                    stamp(entry.timestamp)
                ),
                0.65,
                Evidence::Milestones {
                    command: entry.command.clone(),
                },
            ));
        }
    }

    fn command_failed(&mut self, entry: &LogEntry) {
        let reason = entry.reason().map(str::to_string);
        let mut message = format!("{} failed at {}", entry.command, stamp(entry.timestamp));
        if let Some(r) = &reason {
            message.push_str(&format!(": {r}"));
        }
        self.events.push(Issue::new(
            IssueType::ExplicitFailure,
            message,
            0.95,
            Evidence::Failure {
                command: entry.command.clone(),
                reason,
            },
        ));
        self.take_active(&entry.command);
    }

    fn take_active(&mut self, command: &str) -> Option<ActiveCommand> {
        if self.active.as_ref().is_some_and(|a| a.command == command) {
            self.active.take()
        } else {
            None
        }
    }

    /// Missing outputs and partial results on any kind of completion.
    fn check_completion(&mut self, entry: &LogEntry, who: &str) {
        let ts = entry.timestamp;
        let missing = entry.missing_outputs();
        if !missing.is_empty() {
            self.events.push(Issue::new(
                IssueType::IncompleteOutputs,
                format!(
                    "{who} completed at {} with missing outputs: {}",
                    stamp(ts),
                    missing.join(", ")
                ),
                0.7,
                Evidence::Outputs {
                    command: entry.command.clone(),
                    missing,
                },
            ));
        }

        let (completed, total) = entry.completion_counts();
        let short = matches!((completed, total), (Some(c), Some(t)) if c < t);
        if short || entry.payload_str("status") == Some("partial") {
            let message = match (completed, total) {
                (Some(c), Some(t)) => {
                    format!("{who} completed only {c} of {t} items at {}", stamp(ts))
                }
                _ => format!("{who} reported a partial completion at {}", stamp(ts)),
            };
            self.events.push(Issue::new(
                IssueType::PartialCompletion,
                message,
                0.8,
                Evidence::Partial {
                    command: entry.command.clone(),
                    agent_id: entry.agent_descriptor.as_ref().map(|a| a.agent_id.clone()),
                    completed,
                    total,
                },
            ));
        }
    }

    // ── agents ──

    fn agent_spawned(&mut self, descriptor: &AgentDescriptor, ts: DateTime<Utc>) {
        self.agents.insert(
            descriptor.agent_id.clone(),
            AgentRecord {
                agent_id: descriptor.agent_id.clone(),
                agent_type: descriptor.agent_type.clone(),
                parent_command: descriptor.parent_command.clone(),
                spawned_at: ts,
                started: false,
                started_at: None,
                completed: false,
                failed: false,
                last_activity_at: ts,
            },
        );
    }

    fn agent_record(&mut self, descriptor: &AgentDescriptor, ts: DateTime<Utc>) -> &mut AgentRecord {
        self.agents
            .entry(descriptor.agent_id.clone())
            .or_insert_with(|| AgentRecord {
                agent_id: descriptor.agent_id.clone(),
                agent_type: descriptor.agent_type.clone(),
                parent_command: descriptor.parent_command.clone(),
                spawned_at: ts,
                started: false,
                started_at: None,
                completed: false,
                failed: false,
                last_activity_at: ts,
            })
    }

    fn agent_started(&mut self, descriptor: &AgentDescriptor, ts: DateTime<Utc>) {
        let record = self.agent_record(descriptor, ts);
        record.started = true;
        record.started_at = Some(ts);
    }

    fn agent_completed(&mut self, entry: &LogEntry, descriptor: &AgentDescriptor) {
        self.agent_record(descriptor, entry.timestamp).completed = true;
        let who = format!("Agent {}", descriptor.agent_id);
        self.check_completion(entry, &who);
    }

    fn agent_failed(&mut self, entry: &LogEntry, descriptor: &AgentDescriptor) {
        let record = self.agent_record(descriptor, entry.timestamp);
        record.failed = true;
        let evidence = Evidence::Agent {
            agent_id: record.agent_id.clone(),
            agent_type: record.agent_type.clone(),
            parent_command: record.parent_command.clone(),
            idle_ms: None,
            reason: entry.reason().map(str::to_string),
        };

        let mut message = format!(
            "Agent {} ({}) failed at {}",
            descriptor.agent_id,
            descriptor.agent_type,
            stamp(entry.timestamp)
        );
        if let Some(reason) = entry.reason() {
            message.push_str(&format!(": {reason}"));
        }
        self.events
            .push(Issue::new(IssueType::AgentFailed, message, 0.9, evidence));
    }

    // ── milestones and phases ──

    fn milestone(&mut self, entry: &LogEntry) {
        let ts = entry.timestamp;
        let window = to_chrono(self.config.loop_window);
        let run = self
            .milestone_runs
            .entry((entry.command.clone(), entry.milestone_key()))
            .or_insert_with(|| MilestoneRun {
                label: entry.milestone_label(),
                times: Vec::new(),
            });
        run.times.retain(|t| ts - *t <= window);
        run.times.push(ts);

        let samples = self.config.velocity_samples.max(3);
        let recent = self
            .recent_milestones
            .entry(entry.command.clone())
            .or_default();
        recent.push(ts);
        if recent.len() > samples {
            let excess = recent.len() - samples;
            recent.drain(..excess);
        }

        self.state.milestones.push(ts);
        if let Some(active) = self.active.as_mut() {
            if active.command == entry.command {
                active.milestones += 1;
                active.last_progress = ts;
            }
        }
    }

    fn phase(&mut self, entry: &LogEntry) {
        let Some(phase) = entry.tdd_phase() else {
            debug!(phase = ?entry.phase, "PHASE entry without a TDD phase; ignoring");
            return;
        };
        let feature = entry.feature().to_string();
        let previous = self.phases.get(&feature).copied();

        let expected = match phase {
            TddPhase::Red => None,
            TddPhase::Green if previous != Some(TddPhase::Red) => Some(TddPhase::Red),
            TddPhase::Refactor
                if !matches!(previous, Some(TddPhase::Green | TddPhase::Refactor)) =>
            {
                Some(TddPhase::Green)
            }
            _ => None,
        };
        if let Some(expected) = expected {
            self.events.push(Issue::new(
                IssueType::OutOfOrder,
                format!(
                    "{} for {feature} at {} without a preceding {}",
                    phase.as_str(),
                    stamp(entry.timestamp),
                    expected.as_str()
                ),
                0.85,
                Evidence::PhaseOrder {
                    feature: feature.clone(),
                    phase: phase.as_str().to_string(),
                    previous: previous.map(|p| p.as_str().to_string()),
                },
            ));
        }

        if phase == TddPhase::Red {
            self.red_seen.insert(feature.clone());
        }
        self.phases.insert(feature, phase);
        self.state.current_phase = Some(phase.as_str().to_string());
        if let Some(active) = self.active.as_mut() {
            active.last_progress = active.last_progress.max(entry.timestamp);
        }
    }

    fn test_result(&mut self, entry: &LogEntry) {
        let Some(passed) = entry.test_passed() else {
            return;
        };
        let feature = entry.feature().to_string();
        let previous = self.last_test.insert(feature.clone(), passed);
        if !passed && previous == Some(true) {
            let test = entry
                .payload_str("test")
                .or_else(|| entry.file_path())
                .map(str::to_string);
            self.events.push(Issue::new(
                IssueType::Regression,
                format!(
                    "Tests for {feature} failing at {} after passing",
                    stamp(entry.timestamp)
                ),
                0.85,
                Evidence::Regression { feature, test },
            ));
        }
    }

    fn file_change(&mut self, entry: &LogEntry) {
        let Some(path) = entry.file_path() else {
            return;
        };
        if ChainStage::from_command(&entry.command) != Some(ChainStage::Build)
            || !is_production_path(path)
        {
            return;
        }
        let feature = entry.feature().to_string();
        if self.red_seen.contains(&feature) {
            return;
        }
        self.events.push(Issue::new(
            IssueType::TddViolation,
            format!(
                "{path} changed at {} before any RED phase for {feature}",
                stamp(entry.timestamp)
            ),
            0.8,
            Evidence::Tdd {
                feature,
                file: path.to_string(),
            },
        ));
    }

    fn iron_law_check(&mut self, entry: &LogEntry) {
        let mut seen = BTreeSet::new();
        for violation in entry.violations() {
            if !seen.insert(violation.law) {
                continue;
            }
            let detail = if violation.message.trim().is_empty() {
                "violation reported".to_string()
            } else {
                violation.message.clone()
            };
            let tally = self.laws.entry(violation.law).or_insert(LawTally {
                count: 0,
                detail: String::new(),
                corrective_action: None,
            });
            tally.count += 1;
            tally.detail = detail;
            if violation.corrective_action.is_some() {
                tally.corrective_action = violation.corrective_action.clone();
            }
        }
    }

    // ── time-based detections ──

    fn loop_issues(&self, issues: &mut Vec<Issue>) {
        let cfg = &self.config;
        for ((command, _), run) in &self.milestone_runs {
            let count = run.times.len() as u64;
            if count < cfg.loop_threshold.max(1) {
                continue;
            }
            let (tier, confidence) = if count >= cfg.loop_escalation {
                (cfg.loop_escalation, cfg.loop_escalated_confidence)
            } else {
                (cfg.loop_threshold, cfg.loop_confidence)
            };
            issues.push(Issue::new(
                IssueType::LoopDetected,
                format!(
                    "Milestone '{}' for {command} repeated at least {tier} times within {}",
                    run.label,
                    format_duration_ms(millis(cfg.loop_window))
                ),
                confidence,
                Evidence::Loop {
                    command: command.clone(),
                    milestone: run.label.clone(),
                    repeat_count: count,
                    window_ms: millis(cfg.loop_window),
                },
            ));
        }
    }

    fn stall_issues(&self, now: DateTime<Utc>, issues: &mut Vec<Issue>) {
        let Some(active) = &self.active else {
            return;
        };

        let threshold = self.config.stuck_threshold(&active.command);
        let idle = elapsed(now, active.last_progress);
        if !threshold.is_zero() && idle >= threshold {
            let multiple = (idle.as_millis() / threshold.as_millis().max(1)).clamp(1, 3) as u32;
            let confidence = match multiple {
                1 => 0.75,
                2 => 0.85,
                _ => 0.92,
            };
            issues.push(Issue::new(
                IssueType::PhaseStuck,
                format!(
                    "{} has made no progress since {} (over {})",
                    active.command,
                    stamp(active.last_progress),
                    format_duration_ms(millis(threshold * multiple))
                ),
                confidence,
                Evidence::Stall {
                    command: active.command.clone(),
                    phase: self.state.current_phase.clone(),
                    since: stamp(active.last_progress),
                    idle_ms: millis(idle),
                    threshold_ms: millis(threshold),
                },
            ));
        }

        let last = self.state.last_activity.unwrap_or(active.started_at);
        let quiet = elapsed(now, last);
        if !self.config.silence.is_zero() && quiet >= self.config.silence {
            issues.push(Issue::new(
                IssueType::Silence,
                format!(
                    "No activity since {} while {} is in progress",
                    stamp(last),
                    active.command
                ),
                0.6,
                Evidence::Silence {
                    command: active.command.clone(),
                    idle_ms: millis(quiet),
                },
            ));
        }
    }

    fn velocity_issues(&self, issues: &mut Vec<Issue>) {
        let Some(active) = &self.active else {
            return;
        };
        let Some(times) = self.recent_milestones.get(&active.command) else {
            return;
        };
        if times.len() < self.config.velocity_samples.max(3) {
            return;
        }

        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| millis(elapsed(w[1], w[0])))
            .collect();
        let slowing = gaps.windows(2).all(|w| w[1] > w[0]);
        let (first, last) = (gaps[0], gaps[gaps.len() - 1]);
        if slowing && last >= first.saturating_mul(2) {
            issues.push(Issue::new(
                IssueType::DecliningVelocity,
                format!(
                    "Milestone pace for {} declining since {}",
                    active.command,
                    stamp(times[0])
                ),
                0.72,
                Evidence::Velocity {
                    command: active.command.clone(),
                    gaps_ms: gaps,
                },
            ));
        }
    }

    fn agent_issues(&self, now: DateTime<Utc>, issues: &mut Vec<Issue>) {
        for record in self.agents.values().filter(|r| !r.is_finished()) {
            let evidence = |idle: Duration| Evidence::Agent {
                agent_id: record.agent_id.clone(),
                agent_type: record.agent_type.clone(),
                parent_command: record.parent_command.clone(),
                idle_ms: Some(millis(idle)),
                reason: None,
            };

            if !record.started {
                let idle = elapsed(now, record.spawned_at);
                if idle >= self.config.agent_silence {
                    issues.push(Issue::new(
                        IssueType::AgentSilence,
                        format!(
                            "Agent {} ({}) spawned at {} but never started",
                            record.agent_id,
                            record.agent_type,
                            stamp(record.spawned_at)
                        ),
                        0.8,
                        evidence(idle),
                    ));
                }
                continue;
            }

            let idle = elapsed(now, record.last_activity_at);
            if idle >= self.config.agent_abandon {
                let started = record.started_at.unwrap_or(record.spawned_at);
                issues.push(Issue::new(
                    IssueType::AbandonedAgent,
                    format!(
                        "Agent {} ({}) started at {} but never completed",
                        record.agent_id,
                        record.agent_type,
                        stamp(started)
                    ),
                    0.85,
                    evidence(idle),
                ));
            }
        }
    }

    fn law_issues(&self, issues: &mut Vec<Issue>) {
        for (law, tally) in &self.laws {
            issues.push(Issue::iron_law(
                *law,
                tally.count,
                &tally.detail,
                tally.corrective_action.clone(),
                self.config.iron_law_ignored_after,
            ));
        }
    }
}

fn command_name(command: &str) -> String {
    command.trim().trim_start_matches('/').to_ascii_lowercase()
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "py", "go", "java", "kt", "rb", "swift", "c", "cc",
    "cpp", "h", "hpp", "cs", "php",
];

/// Source files that are not tests.
pub fn is_production_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let Some((_, ext)) = lower.rsplit_once('.') else {
        return false;
    };
    CODE_EXTENSIONS.contains(&ext) && !is_test_path(&lower)
}

pub fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase().replace('\\', "/");
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    lower.split('/').any(|seg| matches!(seg, "test" | "tests" | "__tests__" | "spec"))
        || file.starts_with("test_")
        || file.contains(".test.")
        || file.contains(".spec.")
        || file.contains("_test.")
        || file.contains("_spec.")
}
