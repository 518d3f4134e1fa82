//! Callbacks fired as the supervisor works.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tracing::{debug, info, warn};

use crate::analyzer::WorkflowAnalysis;
use crate::compliance::Violation;
use crate::intervention::{Intervention, Notification};
use crate::rules::Anomaly;
use crate::scheduler::Clock;

/// Every method defaults to doing nothing.
pub trait SupervisorObserver: Send + Sync {
    /// After every analysis pass, new issues or not.
    fn on_analysis(&self, _analysis: &WorkflowAnalysis) {}
    /// For each newly seen issue.
    fn on_intervention(&self, _intervention: &Intervention) {}
    /// For every notification, whatever produced it.
    fn on_notification(&self, _notification: &Notification) {}
    fn on_violation(&self, _violation: &Violation) {}
    fn on_anomaly(&self, _anomaly: &Anomaly) {}
}

/// Emits every callback as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SupervisorObserver for TracingObserver {
    fn on_analysis(&self, analysis: &WorkflowAnalysis) {
        debug!(
            entries = analysis.state.entries_processed,
            issues = analysis.issues.len(),
            command = ?analysis.state.current_command,
            "analysis pass"
        );
    }

    fn on_intervention(&self, intervention: &Intervention) {
        info!(
            issue = intervention.issue.issue_type.as_str(),
            response = intervention.response_type.as_str(),
            confidence = intervention.issue.confidence(),
            "intervention"
        );
    }

    fn on_notification(&self, notification: &Notification) {
        info!(title = %notification.title, "{}", notification.message);
    }

    fn on_violation(&self, violation: &Violation) {
        warn!(
            rule = %violation.rule_id,
            law = violation.law,
            occurrence = violation.occurrence,
            "{}",
            violation.message
        );
    }

    fn on_anomaly(&self, anomaly: &Anomaly) {
        info!(
            anomaly = anomaly.anomaly_type(),
            confidence = anomaly.confidence,
            "{}",
            anomaly.message
        );
    }
}

/// Appends one line per notification to a plain-text log.
pub struct LogFileObserver {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LogFileObserver {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, notification: &Notification) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let message = notification.message.replace('\n', " ");
        writeln!(
            file,
            "{} [{}] {}",
            self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
            notification.title,
            message
        )
        .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

impl SupervisorObserver for LogFileObserver {
    fn on_notification(&self, notification: &Notification) {
        if let Err(e) = self.append(notification) {
            warn!(error = %format!("{e:#}"), "failed to record notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn log_file_observer_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("notifications.log");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let observer = LogFileObserver::new(&path, clock);
        observer.on_notification(&Notification {
            title: "Sentinel: Loop Detected".to_string(),
            message: "first\nsecond".to_string(),
            sound: None,
        });
        observer.on_notification(&Notification {
            title: "Sentinel: Silence".to_string(),
            message: "quiet".to_string(),
            sound: Some("notice".to_string()),
        });

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "2024-05-01T12:00:00Z [Sentinel: Loop Detected] first second",
                "2024-05-01T12:00:00Z [Sentinel: Silence] quiet",
            ]
        );
    }
}
