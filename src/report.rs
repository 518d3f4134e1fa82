//! Terminal and JSON rendering for the CLI.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde_json::Value;

use crate::analyzer::{ChainStage, WorkflowAnalysis};
use crate::compliance::Violation;
use crate::config::ProjectConfig;
use crate::intervention::InterventionGenerator;
use crate::queue::{Priority, Task};
use crate::rules::Anomaly;

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

pub fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .sentinel/config.toml found)".to_string())
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    let s = &config.supervisor;
    output.push_str("Supervisor\n");
    push_kv(&mut output, "poll_interval", format!("{}ms", s.poll_interval_millis));
    push_kv(
        &mut output,
        "monitoring",
        match s.monitoring {
            crate::config::MonitoringMode::Continuous => "continuous",
            crate::config::MonitoringMode::OnDemand => "on-demand",
        },
    );
    push_kv(&mut output, "compliance_interval", format!("{}s", s.compliance_interval_secs));
    push_kv(&mut output, "reanalyze_interval", format!("{}s", s.reanalyze_interval_secs));
    push_kv(&mut output, "state_dir", s.state_dir.display());
    push_kv(
        &mut output,
        "log_file",
        s.log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(state_dir/activity.jsonl)".to_string()),
    );
    output.push('\n');

    let a = &config.analyzer;
    output.push_str("Analyzer\n");
    push_kv(&mut output, "loop_window", format!("{}s", a.loop_window_secs));
    push_kv(
        &mut output,
        "loop_threshold",
        format!("{} (escalates at {})", a.loop_threshold, a.loop_escalation),
    );
    push_kv(&mut output, "phase_stuck", format!("{}s", a.phase_stuck_secs));
    for (command, secs) in &a.phase_stuck {
        output.push_str(&format!("    - {command} => {secs}s\n"));
    }
    push_kv(&mut output, "silence", format!("{}s", a.silence_secs));
    push_kv(&mut output, "agent_silence", format!("{}s", a.agent_silence_secs));
    push_kv(&mut output, "agent_abandon", format!("{}s", a.agent_abandon_secs));
    push_kv(&mut output, "velocity_samples", a.velocity_samples);
    push_kv(&mut output, "milestone_commands", a.milestone_commands.join(", "));
    push_kv(&mut output, "iron_law_ignored_after", a.iron_law_ignored_after);
    output.push('\n');

    output.push_str("Intervention\n");
    push_kv(&mut output, "auto_remediate_above", config.intervention.auto_remediate_above);
    push_kv(&mut output, "notify_suggest_from", config.intervention.notify_suggest_from);
    output.push('\n');

    output.push_str("Queue\n");
    push_kv(&mut output, "capacity", config.queue.capacity);
    output.push('\n');

    output.push_str("Compliance\n");
    push_kv(
        &mut output,
        "policy_file",
        config
            .compliance
            .policy_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    );
    if config.compliance.rules.is_empty() {
        push_kv(&mut output, "rules", "(all enabled)");
    } else {
        for (id, rule) in &config.compliance.rules {
            let mut flags = vec![if rule.enabled { "enabled" } else { "disabled" }];
            if rule.locked {
                flags.push("locked");
            }
            output.push_str(&format!("  - {id} => {}\n", flags.join(", ")));
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Value::Object(map) = &mut payload {
        map.insert(
            "source_path".to_string(),
            Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

pub fn render_analysis(analysis: &WorkflowAnalysis, generator: &InterventionGenerator) -> String {
    let mut output = String::new();
    let state = &analysis.state;
    output.push_str("Workflow\n");
    push_kv(
        &mut output,
        "command",
        state.current_command.as_deref().unwrap_or("(idle)"),
    );
    push_kv(
        &mut output,
        "phase",
        state.current_phase.as_deref().unwrap_or("(none)"),
    );
    let chain: Vec<String> = ChainStage::ALL
        .iter()
        .map(|stage| format!("{}={}", stage.as_str(), state.chain.get(*stage).as_str()))
        .collect();
    push_kv(&mut output, "chain", chain.join(" "));
    push_kv(&mut output, "milestones", state.milestones.len());
    push_kv(&mut output, "entries", state.entries_processed);
    if let Some(last) = state.last_activity {
        push_kv(
            &mut output,
            "last_activity",
            last.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    if !analysis.agents.is_empty() {
        output.push_str("\nAgents\n");
        for agent in &analysis.agents {
            let status = if agent.failed {
                "failed"
            } else if agent.completed {
                "completed"
            } else if agent.started {
                "running"
            } else {
                "spawned"
            };
            output.push_str(&format!(
                "  - {} ({}) {}\n",
                agent.agent_id, agent.agent_type, status
            ));
        }
    }

    output.push_str("\nIssues\n");
    if analysis.issues.is_empty() {
        output.push_str("  (none)\n");
    }
    for issue in &analysis.issues {
        let response = generator.thresholds().classify(issue.confidence());
        output.push_str(&format!(
            "  - [{} {:.0}%] {}: {}\n",
            response.as_str(),
            issue.confidence() * 100.0,
            issue.issue_type.as_str(),
            issue.message
        ));
    }
    output
}

pub fn render_anomaly(anomaly: Option<&Anomaly>) -> String {
    match anomaly {
        None => "No anomaly detected.\n".to_string(),
        Some(anomaly) => {
            let mut output = format!(
                "{} ({:.0}%): {}\n",
                anomaly.anomaly_type(),
                anomaly.confidence * 100.0,
                anomaly.message
            );
            push_kv(&mut output, "priority", anomaly.priority());
            push_kv(&mut output, "agent", &anomaly.suggested_agent);
            push_kv(&mut output, "excerpt", &anomaly.excerpt);
            output
        }
    }
}

pub fn render_violations(violations: &[Violation]) -> String {
    if violations.is_empty() {
        return "No compliance violations.\n".to_string();
    }
    let mut output = String::new();
    for v in violations {
        let lock = if v.locked { " locked" } else { "" };
        output.push_str(&format!("Law {} [{}{}] {}\n", v.law, v.rule_id, lock, v.message));
        if let Some(action) = &v.corrective_action {
            output.push_str(&format!("  fix: {action}\n"));
        }
    }
    output
}

pub fn render_task_line(task: &Task) -> String {
    format!(
        "{:<28} {:<8} {:<9} {:<22} {}",
        task.id,
        task.priority.as_str(),
        task.status.as_str(),
        task.anomaly_type,
        task.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub fn render_task(task: &Task) -> String {
    let mut output = String::new();
    push_kv(&mut output, "id", &task.id);
    push_kv(&mut output, "priority", task.priority);
    push_kv(&mut output, "status", task.status);
    push_kv(&mut output, "source", &task.source);
    push_kv(&mut output, "type", &task.anomaly_type);
    push_kv(&mut output, "agent", &task.suggested_agent);
    push_kv(&mut output, "attempts", task.attempts);
    push_kv(
        &mut output,
        "created",
        task.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    if let Some(done) = task.completed_at {
        push_kv(&mut output, "finished", done.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Some(error) = &task.error {
        push_kv(&mut output, "error", error);
    }
    output.push('\n');
    output.push_str(&task.prompt);
    if !task.prompt.ends_with('\n') {
        output.push('\n');
    }
    output
}

pub fn render_queue_stats(pending: usize, by_priority: &BTreeMap<Priority, usize>) -> String {
    let mut output = String::new();
    push_kv(&mut output, "pending", pending);
    for priority in Priority::ALL {
        push_kv(
            &mut output,
            priority.as_str(),
            by_priority.get(&priority).copied().unwrap_or(0),
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::WorkflowAnalyzer;
    use crate::log::{EventKind, LogEntry};
    use crate::queue::TaskStatus;
    use crate::rules::RuleEngine;
    use chrono::{TimeZone, Utc};

    #[test]
    fn render_config_human_groups_sections() {
        let rendered = render_config_human(&ProjectConfig::default(), None);
        for section in ["Supervisor", "Analyzer", "Intervention", "Queue", "Compliance"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("on-demand"));
        assert!(rendered.contains("(all enabled)"));
        assert!(rendered.contains("(defaults, no .sentinel/config.toml found)"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let json = render_config_json(&ProjectConfig::default(), None).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["supervisor"]["monitoring"], "on-demand");
        assert_eq!(value["queue"]["capacity"], 50);
        assert_eq!(value["intervention"]["auto_remediate_above"], 0.9);
        assert_eq!(value["source_path"], "(defaults, no .sentinel/config.toml found)");
    }

    #[test]
    fn render_analysis_lists_issues_with_tier() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let entries = vec![
            LogEntry::new(ts, "/build", EventKind::Start),
            LogEntry::new(ts, "/build", EventKind::Failed).with_payload("error", "linker"),
        ];
        let analysis = WorkflowAnalyzer::default().analyze(&entries, ts);
        let rendered = render_analysis(&analysis, &InterventionGenerator::default());
        assert!(rendered.contains("build=in_progress"));
        assert!(rendered.contains("[auto_remediate 95%] explicit_failure"));
    }

    #[test]
    fn render_anomaly_handles_none() {
        assert_eq!(render_anomaly(None), "No anomaly detected.\n");
        let anomaly = RuleEngine::shared().analyze("FAIL src/auth.test.ts");
        let rendered = render_anomaly(anomaly.as_ref());
        assert!(rendered.starts_with("test_failure (90%)"));
    }

    #[test]
    fn render_task_includes_prompt() {
        let task = Task {
            id: "task-20250102-030405-ab12".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            priority: Priority::High,
            source: "workflow_analyzer".to_string(),
            anomaly_type: "loop_detected".to_string(),
            prompt: "# Loop Detected".to_string(),
            suggested_agent: "debugger".to_string(),
            context: BTreeMap::new(),
            report_path: None,
            status: TaskStatus::Pending,
            attempts: 0,
            completed_at: None,
            error: None,
        };
        let rendered = render_task(&task);
        assert!(rendered.contains("debugger"));
        assert!(rendered.ends_with("# Loop Detected\n"));
        assert!(render_task_line(&task).starts_with("task-20250102-030405-ab12"));
    }

    #[test]
    fn queue_stats_list_every_priority() {
        let mut counts = BTreeMap::new();
        counts.insert(Priority::High, 2);
        let rendered = render_queue_stats(3, &counts);
        assert!(rendered.contains("critical"));
        assert!(rendered.contains("low"));
        assert!(rendered.lines().any(|l| l.trim_start().starts_with("high") && l.ends_with('2')));
    }
}
