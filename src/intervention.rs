//! Turns a detected issue into a graduated response.
//!
//! Confidence decides the tier: high-confidence issues are queued for
//! automatic remediation, mid-confidence ones notify and suggest a task, and
//! everything below only notifies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::issue::{Issue, IssueType};
use crate::queue::{NewTask, Priority};

/// Response tier for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Queue a high-priority task that may run without asking.
    AutoRemediate,
    /// Notify and queue a task that waits for a human.
    NotifySuggest,
    /// Notify only; nothing is queued.
    NotifyOnly,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoRemediate => "auto_remediate",
            Self::NotifySuggest => "notify_suggest",
            Self::NotifyOnly => "notify_only",
        }
    }
}

/// Confidence boundaries between tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Strictly above this is auto-remediated.
    pub auto_remediate_above: f64,
    /// At or above this (and not auto) is notify-and-suggest.
    pub notify_suggest_from: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_remediate_above: 0.9,
            notify_suggest_from: 0.7,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, confidence: f64) -> ResponseType {
        if confidence > self.auto_remediate_above {
            ResponseType::AutoRemediate
        } else if confidence >= self.notify_suggest_from {
            ResponseType::NotifySuggest
        } else {
            ResponseType::NotifyOnly
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

/// Task an intervention wants queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub priority: Priority,
    pub prompt: String,
    pub suggested_agent: String,
    pub auto_execute: bool,
    pub anomaly_type: String,
    pub context: BTreeMap<String, Value>,
}

impl QueueTask {
    pub fn into_new_task(self, source: &str) -> NewTask {
        let mut context = self.context;
        context.insert("auto_execute".to_string(), Value::Bool(self.auto_execute));
        NewTask {
            priority: self.priority,
            source: source.to_string(),
            anomaly_type: self.anomaly_type,
            prompt: self.prompt,
            suggested_agent: self.suggested_agent,
            context,
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub response_type: ResponseType,
    pub issue: Issue,
    pub notification: Notification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_task: Option<QueueTask>,
}

#[derive(Debug, Clone, Default)]
pub struct InterventionGenerator {
    thresholds: Thresholds,
}

impl InterventionGenerator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn generate(&self, issue: &Issue) -> Intervention {
        let response_type = self.thresholds.classify(issue.confidence());
        let queue_task = match response_type {
            ResponseType::NotifyOnly => None,
            tier => Some(QueueTask {
                priority: if tier == ResponseType::AutoRemediate {
                    Priority::High
                } else {
                    Priority::Medium
                },
                prompt: create_prompt(issue),
                suggested_agent: suggested_agent(issue).to_string(),
                auto_execute: tier == ResponseType::AutoRemediate,
                anomaly_type: issue.issue_type.as_str().to_string(),
                context: issue.context(),
            }),
        };

        Intervention {
            response_type,
            issue: issue.clone(),
            notification: create_notification(issue, response_type),
            queue_task,
        }
    }
}

/// Remediation document handed to whichever agent picks up the task.
pub fn create_prompt(issue: &Issue) -> String {
    let mut out = format!("# {}\n\n{}\n\n## Evidence\n\n", issue.issue_type.title(), issue.message);

    let fields = issue.evidence.fields();
    if fields.is_empty() && issue.extra.is_empty() {
        out.push_str("- (none recorded)\n");
    }
    for (key, value) in fields {
        out.push_str(&format!("- **{}**: {}\n", label(key), value.display()));
    }
    for (key, value) in &issue.extra {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("- **{}**: {}\n", label(key), rendered));
    }

    out.push_str(&format!(
        "\n## Suggested Action\n\n{}\n\nConfidence: {:.0}%\n",
        suggested_action(issue.issue_type),
        issue.confidence() * 100.0
    ));
    out
}

pub fn create_notification(issue: &Issue, response_type: ResponseType) -> Notification {
    let mut message = issue.message.clone();
    if issue.issue_type == IssueType::IronLawRepeated
        && !message.to_ascii_lowercase().contains("repeated")
    {
        message = format!("Repeated violation: {message}");
    }

    let sound = match response_type {
        ResponseType::AutoRemediate => Some("alert".to_string()),
        ResponseType::NotifySuggest => Some("notice".to_string()),
        ResponseType::NotifyOnly => None,
    };

    Notification {
        title: format!("Sentinel: {}", issue.issue_type.title()),
        message,
        sound,
    }
}

/// `agent_type` from the issue wins over the per-type default.
pub fn suggested_agent(issue: &Issue) -> &str {
    issue
        .agent_override()
        .unwrap_or_else(|| default_agent(issue.issue_type))
}

pub fn default_agent(issue_type: IssueType) -> &'static str {
    use IssueType::*;
    match issue_type {
        LoopDetected | PhaseStuck | ExplicitFailure | AgentFailed | Silence | AgentSilence
        | AbruptStop | AbandonedAgent => "debugger",
        Regression | TddViolation | OutOfOrder => "test-engineer",
        DecliningVelocity => "performance-engineer",
        ChainBroken | MissingMilestones | IncompleteOutputs | PartialCompletion => {
            "workflow-orchestrator"
        }
        IronLawViolation | IronLawRepeated | IronLawIgnored => "code-reviewer",
    }
}

pub fn suggested_action(issue_type: IssueType) -> &'static str {
    match issue_type {
        IssueType::LoopDetected => {
            "Stop repeating the same step; inspect why it does not make progress and change approach."
        }
        IssueType::PhaseStuck => {
            "Break the current step into smaller pieces and log a milestone as each one lands."
        }
        IssueType::Regression => {
            "Revert or fix the most recent change until the previously passing tests pass again."
        }
        IssueType::OutOfOrder => {
            "Follow RED→GREEN→REFACTOR order: write a failing test before making it pass."
        }
        IssueType::ChainBroken => {
            "Finish the skipped stage (ideate→plan→build→ship) before continuing."
        }
        IssueType::TddViolation => {
            "Write a failing test for this behaviour before touching production code."
        }
        IssueType::ExplicitFailure => {
            "Read the failure output, fix the root cause, and re-run the command."
        }
        IssueType::AgentFailed => {
            "Inspect the agent's last output and retry it with the missing context supplied."
        }
        IssueType::Silence => {
            "Check whether the workflow is blocked on input or crashed, and resume or restart it."
        }
        IssueType::MissingMilestones => {
            "Record milestones while building so progress can be tracked and verified."
        }
        IssueType::DecliningVelocity => {
            "Profile the slow steps and narrow the scope of the remaining work."
        }
        IssueType::IncompleteOutputs => {
            "Produce the missing outputs before marking the work complete."
        }
        IssueType::AgentSilence => {
            "Confirm the spawned agent received its instructions, then restart it."
        }
        IssueType::AbruptStop => {
            "Return to the interrupted command and complete or explicitly abandon it."
        }
        IssueType::PartialCompletion => {
            "Finish the remaining items or record why they were deferred."
        }
        IssueType::AbandonedAgent => {
            "Collect whatever the agent produced and re-dispatch the unfinished work."
        }
        IssueType::IronLawViolation => "Apply the corrective action for the violated rule now.",
        IssueType::IronLawRepeated => {
            "Stop and fix the repeated violation before any further changes."
        }
        IssueType::IronLawIgnored => {
            "Halt work until the violated rule is fixed and the fix is reviewed."
        }
    }
}

/// `repeat_count` → `Repeat count`, `idle_ms` → `Idle`.
fn label(key: &str) -> String {
    let key = key.strip_suffix("_ms").unwrap_or(key);
    let mut words = key.split('_').filter(|w| !w.is_empty());
    let mut out = String::new();
    if let Some(first) = words.next() {
        let mut chars = first.chars();
        if let Some(c) = chars.next() {
            out.extend(c.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    for word in words {
        out.push(' ');
        out.push_str(word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Evidence;
    use proptest::prelude::*;

    fn stuck(confidence: f64) -> Issue {
        Issue::new(
            IssueType::PhaseStuck,
            "/build has made no progress",
            confidence,
            Evidence::Stall {
                command: "/build".into(),
                phase: Some("GREEN".into()),
                since: "2025-10-09T10:00:00Z".into(),
                idle_ms: 750_000,
                threshold_ms: 600_000,
            },
        )
    }

    #[test]
    fn tier_boundaries() {
        let t = Thresholds::default();
        assert_eq!(t.classify(0.91), ResponseType::AutoRemediate);
        assert_eq!(t.classify(0.9), ResponseType::NotifySuggest);
        assert_eq!(t.classify(0.7), ResponseType::NotifySuggest);
        assert_eq!(t.classify(0.69), ResponseType::NotifyOnly);
    }

    #[test]
    fn auto_remediate_queues_high_priority_auto_task() {
        let intervention = InterventionGenerator::default().generate(&stuck(0.92));
        assert_eq!(intervention.response_type, ResponseType::AutoRemediate);
        let task = intervention.queue_task.unwrap();
        assert_eq!(task.priority, Priority::High);
        assert!(task.auto_execute);
        assert_eq!(task.suggested_agent, "debugger");
        assert_eq!(task.anomaly_type, "phase_stuck");
        assert_eq!(intervention.notification.sound.as_deref(), Some("alert"));
    }

    #[test]
    fn suggest_queues_medium_priority() {
        let intervention = InterventionGenerator::default().generate(&stuck(0.75));
        let task = intervention.queue_task.unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert!(!task.auto_execute);
    }

    #[test]
    fn notify_only_never_queues() {
        let intervention = InterventionGenerator::default().generate(&stuck(0.6));
        assert_eq!(intervention.response_type, ResponseType::NotifyOnly);
        assert!(intervention.queue_task.is_none());
        assert!(intervention.notification.sound.is_none());
    }

    #[test]
    fn prompt_renders_evidence_and_action() {
        let prompt = create_prompt(&stuck(0.85));
        assert!(prompt.starts_with("# Phase Stuck\n"));
        assert!(prompt.contains("## Evidence"));
        assert!(prompt.contains("- **Idle**: 12m 30s"));
        assert!(prompt.contains("- **Threshold**: 10m"));
        assert!(prompt.contains("- **Phase**: GREEN"));
        assert!(prompt.contains("## Suggested Action"));
        assert!(prompt.contains("Confidence: 85%"));
    }

    #[test]
    fn out_of_order_action_names_the_cycle() {
        assert!(suggested_action(IssueType::OutOfOrder).contains("RED→GREEN→REFACTOR"));
    }

    #[test]
    fn repeated_notification_always_says_repeated() {
        let issue = Issue::iron_law(1, 2, "tests first", None, 3);
        let note = create_notification(&issue, ResponseType::AutoRemediate);
        assert!(note.message.to_lowercase().contains("repeated"));
        assert!(note.message.contains("2 times"));

        let already = Issue::new(
            IssueType::IronLawRepeated,
            "Law 1 repeated again",
            0.92,
            Evidence::IronLaw {
                law: 1,
                count: 2,
                detail: "x".into(),
                corrective_action: None,
            },
        );
        let note = create_notification(&already, ResponseType::AutoRemediate);
        assert_eq!(note.message, "Law 1 repeated again");
    }

    #[test]
    fn agent_type_overrides_default_mapping() {
        let issue = stuck(0.95).with_extra("agent_type", "frontend-specialist");
        let task = InterventionGenerator::default()
            .generate(&issue)
            .queue_task
            .unwrap();
        assert_eq!(task.suggested_agent, "frontend-specialist");
        assert_eq!(default_agent(IssueType::Regression), "test-engineer");
        assert_eq!(default_agent(IssueType::DecliningVelocity), "performance-engineer");
    }

    #[test]
    fn queue_task_converts_with_source() {
        let task = InterventionGenerator::default()
            .generate(&stuck(0.95))
            .queue_task
            .unwrap();
        let new = task.into_new_task("workflow_analyzer");
        assert_eq!(new.source, "workflow_analyzer");
        assert_eq!(new.context["auto_execute"], true);
        assert_eq!(new.context["command"], "/build");
    }

    #[test]
    fn labels_are_humanized() {
        assert_eq!(label("repeat_count"), "Repeat count");
        assert_eq!(label("idle_ms"), "Idle");
        assert_eq!(label("law"), "Law");
    }

    proptest! {
        #[test]
        fn tier_follows_confidence(confidence in 0.0f64..=1.0) {
            let intervention = InterventionGenerator::default().generate(&stuck(confidence));
            let expected = if confidence > 0.9 {
                ResponseType::AutoRemediate
            } else if confidence >= 0.7 {
                ResponseType::NotifySuggest
            } else {
                ResponseType::NotifyOnly
            };
            prop_assert_eq!(intervention.response_type, expected);
            prop_assert_eq!(
                intervention.queue_task.is_none(),
                expected == ResponseType::NotifyOnly
            );
        }
    }
}
