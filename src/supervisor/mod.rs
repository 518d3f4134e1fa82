//! Supervision loop.
//!
//! Tails the activity log, folds each entry into the workflow state and turns
//! every issue whose signature has not been seen before into an intervention:
//! observers hear about it and any remediation task lands in the queue. A
//! periodic re-analysis catches time-based conditions while the log is
//! quiet, and in continuous mode a compliance timer runs alongside.
//!
//! The snapshot (workflow state, consumed log offset, seen signatures) is
//! rewritten after each entry so a restart resumes tailing where the last
//! run stopped without re-notifying what it already reported.

mod observer;

pub use observer::{LogFileObserver, SupervisorObserver, TracingObserver};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::analyzer::{WorkflowAnalysis, WorkflowAnalyzer, WorkflowFold, WorkflowState};
use crate::compliance::{ComplianceHistory, ComplianceMonitor, GitProbe, Violation};
use crate::config::{MonitoringMode, ProjectConfig, SupervisorSettings};
use crate::intervention::{
    Intervention, InterventionGenerator, Notification, ResponseType, create_prompt,
    suggested_agent,
};
use crate::issue::Issue;
use crate::log::{EventKind, LogEntry, LogReader, TailHandle, TailedEntry};
use crate::paths::SentinelPaths;
use crate::queue::{NewTask, Priority, QueueManager};
use crate::rules::{Anomaly, RuleEngine};
use crate::scheduler::{Clock, JobHandle, Scheduler};
use crate::store::{DocumentStore, JsonFileStore};

const SNAPSHOT_VERSION: u32 = 1;

pub const WORKFLOW_SOURCE: &str = "workflow_analyzer";
pub const COMPLIANCE_SOURCE: &str = "compliance_monitor";
pub const RULE_ENGINE_SOURCE: &str = "rule_engine";

/// Durable supervisor state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub workflow: WorkflowState,
    /// Bytes of the log already processed.
    pub log_offset: u64,
    #[serde(default)]
    pub seen_issues: BTreeSet<String>,
    #[serde(default)]
    pub seen_violations: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub monitoring: MonitoringMode,
    pub compliance_interval: Duration,
    pub reanalyze_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_millis),
            monitoring: settings.monitoring,
            compliance_interval: Duration::from_secs(settings.compliance_interval_secs),
            reanalyze_interval: Duration::from_secs(settings.reanalyze_interval_secs),
        }
    }
}

/// Collaborators a supervisor is assembled from.
pub struct SupervisorParts {
    pub log_path: PathBuf,
    pub analyzer: WorkflowAnalyzer,
    pub generator: InterventionGenerator,
    pub queue: Arc<QueueManager>,
    pub compliance: Option<ComplianceMonitor>,
    pub snapshots: Box<dyn DocumentStore<SupervisorSnapshot>>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

impl SupervisorParts {
    /// Everything file-backed under the project's state directory, with a
    /// git-backed compliance monitor.
    pub fn for_project(
        config: &ProjectConfig,
        paths: &SentinelPaths,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let queue = QueueManager::open_dir(&paths.state_dir, config.queue.capacity, clock.clone())
            .context("failed to open task queue")?;
        let policy = config.compliance.policy(&paths.root)?;
        let compliance =
            ComplianceMonitor::new(Box::new(GitProbe::new(&paths.root)), policy, clock.clone())
                .with_ignored_after(config.analyzer.iron_law_ignored_after)
                .with_history(Box::new(JsonFileStore::<ComplianceHistory>::new(
                    paths.compliance_history(),
                )))?;
        Ok(Self {
            log_path: paths.log_file.clone(),
            analyzer: WorkflowAnalyzer::new(config.analyzer.to_analyzer_config()),
            generator: InterventionGenerator::new(config.intervention.thresholds()),
            queue: Arc::new(queue),
            compliance: Some(compliance),
            snapshots: Box::new(JsonFileStore::<SupervisorSnapshot>::new(paths.snapshot())),
            scheduler,
            clock,
        })
    }
}

struct Engine {
    analyzer: WorkflowAnalyzer,
    fold: WorkflowFold,
    seen: BTreeSet<String>,
    log_offset: u64,
    last_analysis: Option<WorkflowAnalysis>,
}

impl Engine {
    /// Evaluate at `now` and return the issues not reported before.
    fn evaluate(&mut self, now: DateTime<Utc>) -> (WorkflowAnalysis, Vec<Issue>) {
        let analysis = self.fold.finish(now);
        let fresh: Vec<Issue> = analysis
            .issues
            .iter()
            .filter(|issue| self.seen.insert(issue.signature()))
            .cloned()
            .collect();
        self.last_analysis = Some(analysis.clone());
        (analysis, fresh)
    }
}

struct Shared {
    engine: Mutex<Engine>,
    compliance: Option<Mutex<ComplianceMonitor>>,
    generator: InterventionGenerator,
    queue: Arc<QueueManager>,
    observers: RwLock<Vec<Arc<dyn SupervisorObserver>>>,
    snapshots: Box<dyn DocumentStore<SupervisorSnapshot>>,
    clock: Arc<dyn Clock>,
    log_path: PathBuf,
}

struct Running {
    tail: TailHandle,
    jobs: Vec<Box<dyn JobHandle>>,
}

impl Running {
    fn cancel(&mut self) {
        for job in &mut self.jobs {
            job.cancel();
        }
        self.tail.stop();
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    shared: Arc<Shared>,
    scheduler: Arc<dyn Scheduler>,
    running: Option<Running>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, parts: SupervisorParts) -> Self {
        let fold = parts.analyzer.fold();
        let shared = Shared {
            engine: Mutex::new(Engine {
                analyzer: parts.analyzer,
                fold,
                seen: BTreeSet::new(),
                log_offset: 0,
                last_analysis: None,
            }),
            compliance: parts.compliance.map(Mutex::new),
            generator: parts.generator,
            queue: parts.queue,
            observers: RwLock::new(Vec::new()),
            snapshots: parts.snapshots,
            clock: parts.clock,
            log_path: parts.log_path,
        };
        Self {
            config,
            shared: Arc::new(shared),
            scheduler: parts.scheduler,
            running: None,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn SupervisorObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Restore or rebuild state, then begin tailing and the periodic jobs.
    /// A no-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            debug!("supervisor already running");
            return Ok(());
        }

        let offset = self.shared.restore()?;
        let reader = LogReader::with_position(&self.shared.log_path, offset);
        let shared = Arc::clone(&self.shared);
        let tail = reader.start_tailing(
            self.scheduler.as_ref(),
            self.config.poll_interval,
            move |tailed| shared.on_tailed(tailed),
        )?;

        let mut running = Running {
            tail,
            jobs: Vec::new(),
        };
        if let Err(e) = self.schedule_jobs(&mut running) {
            running.cancel();
            return Err(e);
        }

        info!(
            log = %self.shared.log_path.display(),
            offset,
            monitoring = ?self.config.monitoring,
            "supervisor started"
        );
        self.running = Some(running);
        Ok(())
    }

    /// Cancel every job, stop tailing and persist the final snapshot. A
    /// no-op when already stopped.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        running.cancel();
        info!("supervisor stopped");
        self.shared.persist()
    }

    /// Feed one entry directly, bypassing the log.
    pub fn process_entry(&self, entry: &LogEntry) -> Result<Vec<Intervention>> {
        self.shared.handle_entry(entry, None)
    }

    /// Run the time-based detections at the current time.
    pub fn reanalyze(&self) -> Vec<Intervention> {
        self.shared.reanalyze()
    }

    /// One compliance pass, regardless of monitoring mode.
    pub fn check_compliance(&self) -> Vec<Violation> {
        self.shared.compliance_tick()
    }

    /// Classify unstructured tool or test output. Returns the anomaly only
    /// when it had not been reported already.
    pub fn ingest_output(&self, text: &str) -> Option<Anomaly> {
        self.shared.ingest_output(text)
    }

    /// Run `f` against the compliance monitor, if there is one.
    pub fn with_compliance<R>(&self, f: impl FnOnce(&mut ComplianceMonitor) -> R) -> Option<R> {
        let monitor = self.shared.compliance.as_ref()?;
        Some(f(&mut lock(monitor)))
    }

    pub fn state(&self) -> WorkflowState {
        self.shared.engine().fold.state().clone()
    }

    pub fn last_analysis(&self) -> Option<WorkflowAnalysis> {
        self.shared.engine().last_analysis.clone()
    }

    pub fn log_offset(&self) -> u64 {
        self.shared.engine().log_offset
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.shared.queue
    }

    fn schedule_jobs(&self, running: &mut Running) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        running.jobs.push(self.scheduler.every(
            "reanalyze",
            self.config.reanalyze_interval,
            Box::new(move || {
                shared.reanalyze();
            }),
        )?);

        if self.config.monitoring == MonitoringMode::Continuous && self.shared.compliance.is_some()
        {
            let shared = Arc::clone(&self.shared);
            running.jobs.push(self.scheduler.every(
                "compliance",
                self.config.compliance_interval,
                Box::new(move || {
                    shared.compliance_tick();
                }),
            )?);
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %format!("{e:#}"), "failed to persist state on shutdown");
        }
    }
}

impl Shared {
    fn engine(&self) -> MutexGuard<'_, Engine> {
        lock(&self.engine)
    }

    fn observers(&self) -> Vec<Arc<dyn SupervisorObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild the fold from the snapshot's log prefix, or from the whole
    /// log when there is no usable snapshot. Returns the offset to resume
    /// tailing from.
    fn restore(&self) -> Result<u64> {
        let snapshot = match self.snapshots.load() {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_corrupt() => {
                let moved = self
                    .snapshots
                    .quarantine()
                    .context("failed to quarantine supervisor snapshot")?;
                warn!(error = %e, quarantined = ?moved, "supervisor snapshot corrupt; replaying the log");
                None
            }
            Err(e) => return Err(e).context("failed to load supervisor snapshot"),
        };

        let reader = LogReader::new(&self.log_path);
        let offset = {
            let mut engine = self.engine();
            engine.seen.clear();
            match snapshot {
                Some(snapshot) => {
                    let log_len = reader.file_len()?;
                    let offset = if snapshot.log_offset > log_len {
                        warn!(
                            offset = snapshot.log_offset,
                            log_len, "activity log is shorter than the snapshot; resuming from its state"
                        );
                        engine.fold = engine.analyzer.resume(snapshot.workflow);
                        0
                    } else {
                        let entries = reader.read_until(snapshot.log_offset)?;
                        let mut fold = engine.analyzer.fold();
                        for entry in &entries {
                            fold.apply(entry);
                        }
                        if fold.state() != &snapshot.workflow {
                            debug!("snapshot state differs from the replayed log; keeping the log's");
                        }
                        engine.fold = fold;
                        snapshot.log_offset
                    };
                    engine.seen.extend(snapshot.seen_issues);
                    if let Some(monitor) = &self.compliance {
                        lock(monitor).restore_seen(snapshot.seen_violations);
                    }
                    info!(offset, "restored supervisor snapshot");
                    offset
                }
                None => {
                    let (entries, offset) = reader.read_all()?;
                    let mut fold = engine.analyzer.fold();
                    for entry in &entries {
                        fold.apply(entry);
                    }
                    engine.fold = fold;
                    info!(entries = entries.len(), offset, "rebuilt workflow state from the log");
                    offset
                }
            }
        };
        self.engine().log_offset = offset;

        self.reanalyze();
        self.persist()?;
        Ok(offset)
    }

    fn on_tailed(&self, tailed: TailedEntry) {
        if let Err(e) = self.handle_entry(&tailed.entry, Some(tailed.end_offset)) {
            warn!(error = %format!("{e:#}"), "failed to process log entry");
        }
    }

    fn handle_entry(&self, entry: &LogEntry, end_offset: Option<u64>) -> Result<Vec<Intervention>> {
        let now = self.clock.now();
        let (analysis, fresh) = {
            let mut engine = self.engine();
            engine.fold.apply(entry);
            if let Some(offset) = end_offset {
                engine.log_offset = offset;
            }
            engine.evaluate(now)
        };
        debug!(
            command = %entry.command,
            kind = entry.event_kind.as_str(),
            new_issues = fresh.len(),
            "processed log entry"
        );

        self.track_compliance(entry);
        for observer in self.observers() {
            observer.on_analysis(&analysis);
        }
        let interventions = fresh
            .into_iter()
            .map(|issue| self.deliver(issue, WORKFLOW_SOURCE))
            .collect();
        self.persist()?;
        Ok(interventions)
    }

    fn reanalyze(&self) -> Vec<Intervention> {
        let now = self.clock.now();
        let (analysis, fresh) = self.engine().evaluate(now);
        for observer in self.observers() {
            observer.on_analysis(&analysis);
        }
        if fresh.is_empty() {
            return Vec::new();
        }
        let interventions: Vec<Intervention> = fresh
            .into_iter()
            .map(|issue| self.deliver(issue, WORKFLOW_SOURCE))
            .collect();
        if let Err(e) = self.persist() {
            warn!(error = %format!("{e:#}"), "failed to persist supervisor snapshot");
        }
        interventions
    }

    fn track_compliance(&self, entry: &LogEntry) {
        let Some(monitor) = &self.compliance else {
            return;
        };
        let mut monitor = lock(monitor);
        match entry.event_kind {
            EventKind::FileChange => {
                if let Some(path) = entry.file_path() {
                    monitor.track_file_change(path, entry.timestamp);
                }
            }
            EventKind::ToolCall => {
                let tool = entry
                    .payload_str("tool")
                    .or_else(|| entry.payload_str("name"))
                    .unwrap_or("unknown");
                monitor.track_tool_call(
                    tool,
                    entry.file_path().map(str::to_string),
                    entry.timestamp,
                );
            }
            EventKind::Start if entry.agent_descriptor.is_none() => {
                if let Some(feature) = entry.payload_str("feature") {
                    monitor.set_active_feature(Some(feature.to_string()));
                }
            }
            _ => {}
        }
    }

    fn deliver(&self, issue: Issue, source: &str) -> Intervention {
        let intervention = self.generator.generate(&issue);
        for observer in self.observers() {
            observer.on_intervention(&intervention);
            observer.on_notification(&intervention.notification);
        }
        if let Some(task) = &intervention.queue_task {
            self.enqueue(task.clone().into_new_task(source));
        }
        intervention
    }

    fn enqueue(&self, task: NewTask) {
        let source = task.source.clone();
        match self.queue.add_task(task) {
            Ok(task) => info!(
                id = %task.id,
                priority = task.priority.as_str(),
                source = %source,
                "queued remediation task"
            ),
            Err(e) => warn!(error = %e, source = %source, "failed to queue remediation task"),
        }
    }

    fn compliance_tick(&self) -> Vec<Violation> {
        let Some(monitor) = &self.compliance else {
            return Vec::new();
        };
        let (violations, issues) = {
            let mut monitor = lock(monitor);
            let violations = monitor.check();
            let issues: Vec<Issue> = violations.iter().map(|v| monitor.escalate(v)).collect();
            (violations, issues)
        };
        debug!(violations = violations.len(), "compliance tick");
        if violations.is_empty() {
            return violations;
        }

        let observers = self.observers();
        for (violation, issue) in violations.iter().zip(issues) {
            for observer in &observers {
                observer.on_violation(violation);
            }
            let intervention = self.generator.generate(&issue);
            for observer in &observers {
                observer.on_intervention(&intervention);
                observer.on_notification(&intervention.notification);
            }
            if violation.corrective_action.is_some() {
                self.enqueue(compliance_task(violation, &issue));
            }
        }
        if let Err(e) = self.persist() {
            warn!(error = %format!("{e:#}"), "failed to persist supervisor snapshot");
        }
        violations
    }

    fn ingest_output(&self, text: &str) -> Option<Anomaly> {
        let anomaly = RuleEngine::shared().analyze(text)?;
        if !self.engine().seen.insert(anomaly.signature()) {
            debug!(anomaly = anomaly.anomaly_type(), "anomaly already reported");
            return None;
        }

        let response = self.generator.thresholds().classify(anomaly.confidence);
        let notification = Notification {
            title: format!("Sentinel: {}", anomaly.kind.title()),
            message: anomaly.message.clone(),
            sound: match response {
                ResponseType::AutoRemediate => Some("alert".to_string()),
                ResponseType::NotifySuggest => Some("notice".to_string()),
                ResponseType::NotifyOnly => None,
            },
        };
        for observer in self.observers() {
            observer.on_anomaly(&anomaly);
            observer.on_notification(&notification);
        }
        if response != ResponseType::NotifyOnly {
            self.enqueue(anomaly.to_new_task());
        }
        if let Err(e) = self.persist() {
            warn!(error = %format!("{e:#}"), "failed to persist supervisor snapshot");
        }
        Some(anomaly)
    }

    fn persist(&self) -> Result<()> {
        let snapshot = {
            let engine = self.engine();
            SupervisorSnapshot {
                version: SNAPSHOT_VERSION,
                updated_at: self.clock.now(),
                workflow: engine.fold.state().clone(),
                log_offset: engine.log_offset,
                seen_issues: engine.seen.clone(),
                seen_violations: self
                    .compliance
                    .as_ref()
                    .map(|m| lock(m).seen_signatures())
                    .unwrap_or_default(),
            }
        };
        self.snapshots
            .save(&snapshot)
            .context("failed to persist supervisor snapshot")
    }
}

/// Locked laws go to the front of the queue.
fn compliance_task(violation: &Violation, issue: &Issue) -> NewTask {
    let mut context = issue.context();
    context.insert("locked".to_string(), Value::Bool(violation.locked));
    NewTask {
        priority: if violation.locked {
            Priority::Critical
        } else {
            Priority::High
        },
        source: COMPLIANCE_SOURCE.to_string(),
        anomaly_type: issue.issue_type.as_str().to_string(),
        prompt: create_prompt(issue),
        suggested_agent: suggested_agent(issue).to_string(),
        context,
        report_path: None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
