use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analyzer::AnalyzerConfig;
use crate::compliance::{CompliancePolicy, RulePolicy};
use crate::intervention::Thresholds;
use crate::queue::DEFAULT_CAPACITY;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".sentinel";

/// When the compliance monitor runs.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MonitoringMode {
    /// On a timer for as long as the supervisor runs.
    Continuous,
    /// Only when asked (`sentinel check`).
    #[default]
    OnDemand,
}

fn default_poll_interval_millis() -> u64 {
    50
}

fn default_compliance_interval_secs() -> u64 {
    60
}

fn default_reanalyze_interval_secs() -> u64 {
    15
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR)
}

fn default_loop_window_secs() -> u64 {
    5 * 60
}

fn default_loop_threshold() -> u64 {
    3
}

fn default_loop_escalation() -> u64 {
    7
}

fn default_loop_confidence() -> f64 {
    0.85
}

fn default_loop_escalated_confidence() -> f64 {
    0.95
}

fn default_phase_stuck_secs() -> u64 {
    10 * 60
}

fn default_silence_secs() -> u64 {
    15 * 60
}

fn default_agent_silence_secs() -> u64 {
    60
}

fn default_agent_abandon_secs() -> u64 {
    90
}

fn default_velocity_samples() -> usize {
    4
}

fn default_milestone_commands() -> Vec<String> {
    vec!["build".to_string()]
}

fn default_iron_law_ignored_after() -> u64 {
    3
}

fn default_auto_remediate_above() -> f64 {
    0.9
}

fn default_notify_suggest_from() -> f64 {
    0.7
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default)]
    pub monitoring: MonitoringMode,
    #[serde(default = "default_compliance_interval_secs")]
    pub compliance_interval_secs: u64,
    /// How often time-based detections run when the log is quiet.
    #[serde(default = "default_reanalyze_interval_secs")]
    pub reanalyze_interval_secs: u64,
    /// Defaults to `activity.jsonl` inside `state_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            monitoring: MonitoringMode::default(),
            compliance_interval_secs: default_compliance_interval_secs(),
            reanalyze_interval_secs: default_reanalyze_interval_secs(),
            log_file: None,
            state_dir: default_state_dir(),
        }
    }
}

/// Analyzer thresholds, in seconds where they are durations.
///
/// ```toml
/// [analyzer]
/// phase_stuck_secs = 900
///
/// [analyzer.phase_stuck]
/// ship = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    #[serde(default = "default_loop_window_secs")]
    pub loop_window_secs: u64,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u64,
    #[serde(default = "default_loop_escalation")]
    pub loop_escalation: u64,
    #[serde(default = "default_loop_confidence")]
    pub loop_confidence: f64,
    #[serde(default = "default_loop_escalated_confidence")]
    pub loop_escalated_confidence: f64,
    #[serde(default = "default_phase_stuck_secs")]
    pub phase_stuck_secs: u64,
    #[serde(default = "default_silence_secs")]
    pub silence_secs: u64,
    #[serde(default = "default_agent_silence_secs")]
    pub agent_silence_secs: u64,
    #[serde(default = "default_agent_abandon_secs")]
    pub agent_abandon_secs: u64,
    #[serde(default = "default_velocity_samples")]
    pub velocity_samples: usize,
    #[serde(default = "default_milestone_commands")]
    pub milestone_commands: Vec<String>,
    #[serde(default = "default_iron_law_ignored_after")]
    pub iron_law_ignored_after: u64,
    /// Per-command stall thresholds in seconds.
    #[serde(default)]
    pub phase_stuck: BTreeMap<String, u64>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            loop_window_secs: default_loop_window_secs(),
            loop_threshold: default_loop_threshold(),
            loop_escalation: default_loop_escalation(),
            loop_confidence: default_loop_confidence(),
            loop_escalated_confidence: default_loop_escalated_confidence(),
            phase_stuck_secs: default_phase_stuck_secs(),
            silence_secs: default_silence_secs(),
            agent_silence_secs: default_agent_silence_secs(),
            agent_abandon_secs: default_agent_abandon_secs(),
            velocity_samples: default_velocity_samples(),
            milestone_commands: default_milestone_commands(),
            iron_law_ignored_after: default_iron_law_ignored_after(),
            phase_stuck: BTreeMap::new(),
        }
    }
}

impl AnalyzerSettings {
    pub fn to_analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            loop_window: Duration::from_secs(self.loop_window_secs),
            loop_threshold: self.loop_threshold,
            loop_escalation: self.loop_escalation,
            loop_confidence: self.loop_confidence,
            loop_escalated_confidence: self.loop_escalated_confidence,
            phase_stuck: Duration::from_secs(self.phase_stuck_secs),
            phase_stuck_overrides: self
                .phase_stuck
                .iter()
                .map(|(cmd, secs)| {
                    (
                        cmd.trim_start_matches('/').to_string(),
                        Duration::from_secs(*secs),
                    )
                })
                .collect(),
            silence: Duration::from_secs(self.silence_secs),
            agent_silence: Duration::from_secs(self.agent_silence_secs),
            agent_abandon: Duration::from_secs(self.agent_abandon_secs),
            velocity_samples: self.velocity_samples,
            milestone_commands: self.milestone_commands.clone(),
            iron_law_ignored_after: self.iron_law_ignored_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionSettings {
    #[serde(default = "default_auto_remediate_above")]
    pub auto_remediate_above: f64,
    #[serde(default = "default_notify_suggest_from")]
    pub notify_suggest_from: f64,
}

impl Default for InterventionSettings {
    fn default() -> Self {
        Self {
            auto_remediate_above: default_auto_remediate_above(),
            notify_suggest_from: default_notify_suggest_from(),
        }
    }
}

impl InterventionSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            auto_remediate_above: self.auto_remediate_above,
            notify_suggest_from: self.notify_suggest_from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Compliance policy sources.
///
/// ```toml
/// [compliance]
/// policy_file = ".sentinel/policy.json"
///
/// [compliance.rules.protected-branch]
/// config = { branches = ["main", "release"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,
    #[serde(default)]
    pub rules: BTreeMap<String, RulePolicy>,
}

impl ComplianceSettings {
    /// Effective policy: the policy file (relative to `root`) with inline
    /// rules layered on top.
    pub fn policy(&self, root: &Path) -> Result<CompliancePolicy> {
        let external = match &self.policy_file {
            Some(file) => CompliancePolicy::load_file(&root.join(file))?,
            None => None,
        };
        Ok(CompliancePolicy::merged(external, &self.rules))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
    #[serde(default)]
    pub intervention: InterventionSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub compliance: ComplianceSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.sentinel/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config as TOML")
    }
}
