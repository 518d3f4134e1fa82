//! Workflow chain and derived state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four stages a unit of work moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStage {
    Ideate,
    Plan,
    Build,
    Ship,
}

impl ChainStage {
    pub const ALL: [ChainStage; 4] = [Self::Ideate, Self::Plan, Self::Build, Self::Ship];

    /// Stage a command belongs to; `/build` and `build` both map to Build.
    pub fn from_command(command: &str) -> Option<Self> {
        let name = command.trim().trim_start_matches('/');
        let name = name.split_whitespace().next().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "ideate" => Some(Self::Ideate),
            "plan" => Some(Self::Plan),
            "build" => Some(Self::Build),
            "ship" => Some(Self::Ship),
            _ => None,
        }
    }

    pub fn predecessor(&self) -> Option<Self> {
        match self {
            Self::Ideate => None,
            Self::Plan => Some(Self::Ideate),
            Self::Build => Some(Self::Plan),
            Self::Ship => Some(Self::Build),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ideate => "ideate",
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Ship => "ship",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProgress {
    pub ideate: StageStatus,
    pub plan: StageStatus,
    pub build: StageStatus,
    pub ship: StageStatus,
}

impl ChainProgress {
    pub fn get(&self, stage: ChainStage) -> StageStatus {
        match stage {
            ChainStage::Ideate => self.ideate,
            ChainStage::Plan => self.plan,
            ChainStage::Build => self.build,
            ChainStage::Ship => self.ship,
        }
    }

    /// Move a stage forward. Returns false (and changes nothing) when `to`
    /// would move it backwards.
    pub fn advance(&mut self, stage: ChainStage, to: StageStatus) -> bool {
        let slot = match stage {
            ChainStage::Ideate => &mut self.ideate,
            ChainStage::Plan => &mut self.plan,
            ChainStage::Build => &mut self.build,
            ChainStage::Ship => &mut self.ship,
        };
        if to < *slot {
            return false;
        }
        *slot = to;
        true
    }

    pub fn is_complete(&self) -> bool {
        ChainStage::ALL
            .iter()
            .all(|s| self.get(*s) == StageStatus::Complete)
    }
}

/// Everything the analyzer derives from the log. Rebuilt by folding entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub current_command: Option<String>,
    pub current_phase: Option<String>,
    pub chain: ChainProgress,
    /// Set by a `ship` completion; cleared when the next command starts.
    pub chain_complete: bool,
    pub milestones: Vec<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub entries_processed: u64,
}

/// Lifecycle of one sub-agent, keyed by agent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub parent_command: String,
    pub spawned_at: DateTime<Utc>,
    pub started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub failed: bool,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn is_finished(&self) -> bool {
        self.completed || self.failed
    }
}
