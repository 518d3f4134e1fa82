//! Detected anomalies and their typed evidence.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    LoopDetected,
    PhaseStuck,
    Regression,
    OutOfOrder,
    ChainBroken,
    TddViolation,
    ExplicitFailure,
    AgentFailed,
    Silence,
    MissingMilestones,
    DecliningVelocity,
    IncompleteOutputs,
    AgentSilence,
    AbruptStop,
    PartialCompletion,
    AbandonedAgent,
    IronLawViolation,
    IronLawRepeated,
    IronLawIgnored,
}

impl IssueType {
    pub const ALL: [IssueType; 19] = [
        Self::LoopDetected,
        Self::PhaseStuck,
        Self::Regression,
        Self::OutOfOrder,
        Self::ChainBroken,
        Self::TddViolation,
        Self::ExplicitFailure,
        Self::AgentFailed,
        Self::Silence,
        Self::MissingMilestones,
        Self::DecliningVelocity,
        Self::IncompleteOutputs,
        Self::AgentSilence,
        Self::AbruptStop,
        Self::PartialCompletion,
        Self::AbandonedAgent,
        Self::IronLawViolation,
        Self::IronLawRepeated,
        Self::IronLawIgnored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopDetected => "loop_detected",
            Self::PhaseStuck => "phase_stuck",
            Self::Regression => "regression",
            Self::OutOfOrder => "out_of_order",
            Self::ChainBroken => "chain_broken",
            Self::TddViolation => "tdd_violation",
            Self::ExplicitFailure => "explicit_failure",
            Self::AgentFailed => "agent_failed",
            Self::Silence => "silence",
            Self::MissingMilestones => "missing_milestones",
            Self::DecliningVelocity => "declining_velocity",
            Self::IncompleteOutputs => "incomplete_outputs",
            Self::AgentSilence => "agent_silence",
            Self::AbruptStop => "abrupt_stop",
            Self::PartialCompletion => "partial_completion",
            Self::AbandonedAgent => "abandoned_agent",
            Self::IronLawViolation => "iron_law_violation",
            Self::IronLawRepeated => "iron_law_repeated",
            Self::IronLawIgnored => "iron_law_ignored",
        }
    }

    /// Heading used in prompts and notification titles.
    pub fn title(&self) -> &'static str {
        match self {
            Self::LoopDetected => "Loop Detected",
            Self::PhaseStuck => "Phase Stuck",
            Self::Regression => "Test Regression",
            Self::OutOfOrder => "TDD Phases Out of Order",
            Self::ChainBroken => "Workflow Chain Broken",
            Self::TddViolation => "TDD Violation",
            Self::ExplicitFailure => "Command Failed",
            Self::AgentFailed => "Agent Failed",
            Self::Silence => "Workflow Silent",
            Self::MissingMilestones => "Missing Milestones",
            Self::DecliningVelocity => "Declining Velocity",
            Self::IncompleteOutputs => "Incomplete Outputs",
            Self::AgentSilence => "Agent Never Started",
            Self::AbruptStop => "Abrupt Stop",
            Self::PartialCompletion => "Partial Completion",
            Self::AbandonedAgent => "Abandoned Agent",
            Self::IronLawViolation => "Iron Law Violation",
            Self::IronLawRepeated => "Iron Law Repeated",
            Self::IronLawIgnored => "Iron Law Ignored",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendered evidence value.
#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceValue {
    Text(String),
    Count(u64),
    DurationMs(u64),
    List(Vec<String>),
}

impl EvidenceValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Count(n) | Self::DurationMs(n) => Value::from(*n),
            Self::List(items) => Value::from(items.clone()),
        }
    }

    /// Human rendering; durations become minutes/seconds.
    pub fn display(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Count(n) => n.to_string(),
            Self::DurationMs(ms) => format_duration_ms(*ms),
            Self::List(items) if items.is_empty() => "(none)".to_string(),
            Self::List(items) => items.join(", "),
        }
    }
}

/// Supporting facts for an issue, one shape per detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Loop {
        command: String,
        milestone: String,
        repeat_count: u64,
        window_ms: u64,
    },
    Stall {
        command: String,
        phase: Option<String>,
        since: String,
        idle_ms: u64,
        threshold_ms: u64,
    },
    Regression {
        feature: String,
        test: Option<String>,
    },
    PhaseOrder {
        feature: String,
        phase: String,
        previous: Option<String>,
    },
    Chain {
        stage: String,
        missing_stage: String,
    },
    Tdd {
        feature: String,
        file: String,
    },
    Failure {
        command: String,
        reason: Option<String>,
    },
    Agent {
        agent_id: String,
        agent_type: String,
        parent_command: String,
        idle_ms: Option<u64>,
        reason: Option<String>,
    },
    Silence {
        command: String,
        idle_ms: u64,
    },
    Milestones {
        command: String,
    },
    Velocity {
        command: String,
        gaps_ms: Vec<u64>,
    },
    Outputs {
        command: String,
        missing: Vec<String>,
    },
    AbruptStop {
        interrupted: String,
        started: String,
    },
    Partial {
        command: String,
        agent_id: Option<String>,
        completed: Option<u64>,
        total: Option<u64>,
    },
    IronLaw {
        law: u32,
        count: u64,
        detail: String,
        corrective_action: Option<String>,
    },
}

impl Evidence {
    /// Evidence as ordered `(key, value)` pairs. Absent optionals are omitted.
    pub fn fields(&self) -> Vec<(&'static str, EvidenceValue)> {
        use EvidenceValue::{Count, DurationMs, List, Text};

        fn opt_text(
            out: &mut Vec<(&'static str, EvidenceValue)>,
            key: &'static str,
            value: &Option<String>,
        ) {
            if let Some(v) = value {
                out.push((key, EvidenceValue::Text(v.clone())));
            }
        }

        let mut out = Vec::new();
        match self {
            Self::Loop {
                command,
                milestone,
                repeat_count,
                window_ms,
            } => {
                out.push(("command", Text(command.clone())));
                out.push(("milestone", Text(milestone.clone())));
                out.push(("repeat_count", Count(*repeat_count)));
                out.push(("window_ms", DurationMs(*window_ms)));
            }
            Self::Stall {
                command,
                phase,
                since,
                idle_ms,
                threshold_ms,
            } => {
                out.push(("command", Text(command.clone())));
                opt_text(&mut out, "phase", phase);
                out.push(("since", Text(since.clone())));
                out.push(("idle_ms", DurationMs(*idle_ms)));
                out.push(("threshold_ms", DurationMs(*threshold_ms)));
            }
            Self::Regression { feature, test } => {
                out.push(("feature", Text(feature.clone())));
                opt_text(&mut out, "test", test);
            }
            Self::PhaseOrder {
                feature,
                phase,
                previous,
            } => {
                out.push(("feature", Text(feature.clone())));
                out.push(("phase", Text(phase.clone())));
                opt_text(&mut out, "previous_phase", previous);
            }
            Self::Chain {
                stage,
                missing_stage,
            } => {
                out.push(("stage", Text(stage.clone())));
                out.push(("missing_stage", Text(missing_stage.clone())));
            }
            Self::Tdd { feature, file } => {
                out.push(("feature", Text(feature.clone())));
                out.push(("file", Text(file.clone())));
            }
            Self::Failure { command, reason } => {
                out.push(("command", Text(command.clone())));
                opt_text(&mut out, "reason", reason);
            }
            Self::Agent {
                agent_id,
                agent_type,
                parent_command,
                idle_ms,
                reason,
            } => {
                out.push(("agent_id", Text(agent_id.clone())));
                out.push(("subagent_type", Text(agent_type.clone())));
                out.push(("parent_command", Text(parent_command.clone())));
                if let Some(ms) = idle_ms {
                    out.push(("idle_ms", DurationMs(*ms)));
                }
                opt_text(&mut out, "reason", reason);
            }
            Self::Silence { command, idle_ms } => {
                out.push(("command", Text(command.clone())));
                out.push(("idle_ms", DurationMs(*idle_ms)));
            }
            Self::Milestones { command } => {
                out.push(("command", Text(command.clone())));
            }
            Self::Velocity { command, gaps_ms } => {
                out.push(("command", Text(command.clone())));
                out.push((
                    "milestone_gaps",
                    List(gaps_ms.iter().map(|ms| format_duration_ms(*ms)).collect()),
                ));
            }
            Self::Outputs { command, missing } => {
                out.push(("command", Text(command.clone())));
                out.push(("missing_outputs", List(missing.clone())));
            }
            Self::AbruptStop {
                interrupted,
                started,
            } => {
                out.push(("interrupted_command", Text(interrupted.clone())));
                out.push(("started_command", Text(started.clone())));
            }
            Self::Partial {
                command,
                agent_id,
                completed,
                total,
            } => {
                out.push(("command", Text(command.clone())));
                opt_text(&mut out, "agent_id", agent_id);
                if let Some(n) = completed {
                    out.push(("completed", Count(*n)));
                }
                if let Some(n) = total {
                    out.push(("total", Count(*n)));
                }
            }
            Self::IronLaw {
                law,
                count,
                detail,
                corrective_action,
            } => {
                out.push(("law", Count(u64::from(*law))));
                out.push(("count", Count(*count)));
                out.push(("detail", Text(detail.clone())));
                opt_text(&mut out, "corrective_action", corrective_action);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub issue_type: IssueType,
    pub message: String,
    confidence: f64,
    pub evidence: Evidence,
    /// Optional diagnostics that have no typed home, e.g. `agent_type`.
    pub extra: BTreeMap<String, Value>,
}

impl Issue {
    pub fn new(
        issue_type: IssueType,
        message: impl Into<String>,
        confidence: f64,
        evidence: Evidence,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            issue_type,
            message: message.into(),
            confidence,
            evidence,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Escalation ladder for a compliance law seen `count` times in the
    /// session: first sighting, then repeated, then ignored.
    pub fn iron_law(
        law: u32,
        count: u64,
        detail: &str,
        corrective_action: Option<String>,
        ignored_after: u64,
    ) -> Self {
        let evidence = Evidence::IronLaw {
            law,
            count,
            detail: detail.to_string(),
            corrective_action,
        };
        if count <= 1 {
            Self::new(
                IssueType::IronLawViolation,
                format!("Iron Law {law} violated: {detail}"),
                0.85,
                evidence,
            )
        } else if count < ignored_after.max(3) {
            Self::new(
                IssueType::IronLawRepeated,
                format!("Iron Law {law} violated {count} times: {detail}"),
                0.92,
                evidence,
            )
        } else {
            Self::new(
                IssueType::IronLawIgnored,
                format!("Iron Law {law} violated {count} times and still ignored: {detail}"),
                0.97,
                evidence,
            )
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Evidence plus extras as a JSON map.
    pub fn context(&self) -> BTreeMap<String, Value> {
        let mut ctx: BTreeMap<String, Value> = self
            .evidence
            .fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_json()))
            .collect();
        for (k, v) in &self.extra {
            ctx.entry(k.clone()).or_insert_with(|| v.clone());
        }
        ctx
    }

    /// Dedup key: hash of `(type, message)`.
    pub fn signature(&self) -> String {
        signature(self.issue_type.as_str(), &self.message)
    }

    /// Explicit agent role requested by whoever raised the issue.
    pub fn agent_override(&self) -> Option<&str> {
        self.extra.get("agent_type").and_then(Value::as_str)
    }
}

impl Serialize for Issue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            issue_type: IssueType,
            message: &'a str,
            confidence: f64,
            context: BTreeMap<String, Value>,
        }

        Wire {
            issue_type: self.issue_type,
            message: &self.message,
            confidence: self.confidence,
            context: self.context(),
        }
        .serialize(serializer)
    }
}

/// SHA-256 hex of `kind\0message`.
pub fn signature(kind: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `1500` → `"1s"`, `150000` → `"2m 30s"`, `5400000` → `"1h 30m"`.
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let secs = ms / 1_000;
    if secs < 60 {
        return format!("{secs}s");
    }
    let (mins, secs) = (secs / 60, secs % 60);
    if mins < 60 {
        return if secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {secs}s")
        };
    }
    let (hours, mins) = (mins / 60, mins % 60);
    if mins == 0 {
        format!("{hours}h")
    } else {
        format!("{hours}h {mins}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> Issue {
        Issue::new(
            IssueType::ExplicitFailure,
            message,
            0.95,
            Evidence::Failure {
                command: "/build".into(),
                reason: None,
            },
        )
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(failure("x").confidence(), 0.95);
        let hi = Issue::new(
            IssueType::Silence,
            "m",
            1.7,
            Evidence::Milestones {
                command: "/plan".into(),
            },
        );
        assert_eq!(hi.confidence(), 1.0);
        let nan = Issue::new(
            IssueType::Silence,
            "m",
            f64::NAN,
            Evidence::Milestones {
                command: "/plan".into(),
            },
        );
        assert_eq!(nan.confidence(), 0.0);
    }

    #[test]
    fn signature_depends_on_type_and_message_only() {
        let a = failure("build failed");
        let mut b = failure("build failed");
        b.evidence = Evidence::Failure {
            command: "/other".into(),
            reason: Some("boom".into()),
        };
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), failure("build failed again").signature());
        assert_eq!(a.signature().len(), 64);
    }

    #[test]
    fn serializes_type_and_context() {
        let issue = failure("boom").with_extra("agent_type", "debugger");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["type"], "explicit_failure");
        assert_eq!(json["context"]["command"], "/build");
        assert_eq!(json["context"]["agent_type"], "debugger");
        assert!(json["context"].get("reason").is_none());
        assert_eq!(issue.agent_override(), Some("debugger"));
    }

    #[test]
    fn iron_law_ladder() {
        let first = Issue::iron_law(1, 1, "tests must come first", None, 3);
        assert_eq!(first.issue_type, IssueType::IronLawViolation);

        let second = Issue::iron_law(1, 2, "tests must come first", None, 3);
        assert_eq!(second.issue_type, IssueType::IronLawRepeated);
        assert!(second.message.contains("2 times"));
        assert_eq!(second.context()["count"], 2);
        assert_eq!(second.context()["law"], 1);

        let third = Issue::iron_law(1, 3, "tests must come first", None, 3);
        assert_eq!(third.issue_type, IssueType::IronLawIgnored);
        assert!(third.confidence() > second.confidence());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(1_500), "1s");
        assert_eq!(format_duration_ms(120_000), "2m");
        assert_eq!(format_duration_ms(150_000), "2m 30s");
        assert_eq!(format_duration_ms(5_400_000), "1h 30m");
        assert_eq!(format_duration_ms(7_200_000), "2h");
    }

    #[test]
    fn every_type_has_a_distinct_name() {
        let mut names: Vec<_> = IssueType::ALL.iter().map(IssueType::as_str).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 19);
        for t in IssueType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, t.as_str());
        }
    }
}
