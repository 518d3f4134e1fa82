//! End-to-end supervisor runs against a real activity log, driven by the
//! virtual scheduler and clock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use sentinel::analyzer::WorkflowAnalyzer;
use sentinel::compliance::{CompliancePolicy, ComplianceMonitor, RulePolicy, StaticProbe};
use sentinel::config::ProjectConfig;
use sentinel::intervention::{Intervention, InterventionGenerator, Notification, Thresholds};
use sentinel::issue::IssueType;
use sentinel::log::{EntryWriter, EventKind, LawViolation, LogEntry};
use sentinel::paths::SentinelPaths;
use sentinel::queue::{ArchiveDocument, Priority, QueueDocument, QueueManager};
use sentinel::scheduler::{ManualClock, ManualScheduler};
use sentinel::store::MemoryStore;
use sentinel::supervisor::{
    COMPLIANCE_SOURCE, Supervisor, SupervisorConfig, SupervisorObserver, SupervisorParts,
    SupervisorSnapshot, WORKFLOW_SOURCE,
};

const POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Recorder {
    interventions: Mutex<Vec<Intervention>>,
    notifications: Mutex<Vec<Notification>>,
}

impl Recorder {
    fn issue_types(&self) -> Vec<IssueType> {
        self.interventions
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.issue.issue_type)
            .collect()
    }

    fn of(&self, issue_type: IssueType) -> Vec<Intervention> {
        self.interventions
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.issue.issue_type == issue_type)
            .cloned()
            .collect()
    }
}

impl SupervisorObserver for Recorder {
    fn on_intervention(&self, intervention: &Intervention) {
        self.interventions.lock().unwrap().push(intervention.clone());
    }

    fn on_notification(&self, notification: &Notification) {
        self.notifications.lock().unwrap().push(notification.clone());
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

struct Rig {
    supervisor: Supervisor,
    scheduler: ManualScheduler,
    clock: Arc<ManualClock>,
    recorder: Arc<Recorder>,
}

/// In-memory stores, a static compliance probe and the log at `log`.
fn rig(log: &Path, probe: StaticProbe, policy: CompliancePolicy) -> Rig {
    let scheduler = ManualScheduler::new();
    let clock = Arc::new(ManualClock::new(t0()));
    let queue = QueueManager::open(
        Box::new(MemoryStore::<QueueDocument>::new()),
        Box::new(MemoryStore::<ArchiveDocument>::new()),
        50,
        clock.clone(),
    )
    .unwrap();
    let parts = SupervisorParts {
        log_path: log.to_path_buf(),
        analyzer: WorkflowAnalyzer::default(),
        generator: InterventionGenerator::new(Thresholds::default()),
        queue: Arc::new(queue),
        compliance: Some(ComplianceMonitor::new(Box::new(probe), policy, clock.clone())),
        snapshots: Box::new(MemoryStore::<SupervisorSnapshot>::new()),
        scheduler: Arc::new(scheduler.clone()),
        clock: clock.clone(),
    };
    let supervisor = Supervisor::new(SupervisorConfig::default(), parts);
    let recorder = Arc::new(Recorder::default());
    supervisor.add_observer(recorder.clone());
    Rig {
        supervisor,
        scheduler,
        clock,
        recorder,
    }
}

fn law_check(secs: i64, law: u32) -> LogEntry {
    LogEntry::new(at(secs), "/build", EventKind::IronLawCheck).with_violations(vec![LawViolation {
        law,
        message: "implementation written before its test".into(),
        corrective_action: Some("write the failing test first".into()),
    }])
}

#[test]
fn started_agent_that_goes_quiet_is_reported_as_abandoned() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("activity.jsonl");
    let writer = EntryWriter::new(&log).unwrap();
    writer
        .append(
            &LogEntry::new(at(0), "/build", EventKind::AgentSpawn)
                .with_agent("test-engineer", "te-orphan"),
            true,
        )
        .unwrap();
    writer
        .append(
            &LogEntry::new(at(1), "/build", EventKind::Start).with_agent("test-engineer", "te-orphan"),
            true,
        )
        .unwrap();

    let mut rig = rig(&log, StaticProbe::default(), CompliancePolicy::default());
    rig.clock.set(at(1));
    rig.supervisor.start().unwrap();
    rig.scheduler.advance(Duration::ZERO);
    assert!(rig.recorder.of(IssueType::AbandonedAgent).is_empty());
    assert_eq!(rig.supervisor.state().entries_processed, 2);

    rig.clock.set(at(121));
    rig.scheduler.advance(Duration::from_secs(15));
    let abandoned = rig.recorder.of(IssueType::AbandonedAgent);
    assert_eq!(abandoned.len(), 1);
    assert!(abandoned[0].issue.message.contains("te-orphan"));
    assert!(abandoned[0].queue_task.is_some());
    assert!(
        rig.recorder
            .notifications
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.message.contains("te-orphan"))
    );

    // Still abandoned on the next pass, but reported once.
    rig.clock.set(at(180));
    rig.scheduler.advance(Duration::from_secs(15));
    assert_eq!(rig.recorder.of(IssueType::AbandonedAgent).len(), 1);
    let tasks = rig.supervisor.queue().get_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].source, WORKFLOW_SOURCE);
    assert_eq!(tasks[0].anomaly_type, "abandoned_agent");

    rig.supervisor.stop().unwrap();
}

#[test]
fn repeated_iron_law_violation_escalates_while_tailing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("activity.jsonl");
    let mut rig = rig(&log, StaticProbe::default(), CompliancePolicy::default());
    rig.supervisor.start().unwrap();
    rig.scheduler.advance(Duration::ZERO);
    assert!(rig.recorder.issue_types().is_empty());

    let writer = EntryWriter::new(&log).unwrap();
    writer.append(&law_check(0, 1), true).unwrap();
    rig.scheduler.advance(POLL);
    assert_eq!(rig.recorder.issue_types(), vec![IssueType::IronLawViolation]);

    rig.clock.set(at(10));
    writer.append(&law_check(10, 1), true).unwrap();
    rig.scheduler.advance(POLL);
    let repeated = rig.recorder.of(IssueType::IronLawRepeated);
    assert_eq!(repeated.len(), 1);
    assert!(repeated[0].issue.message.contains("2 times"));
    assert_eq!(repeated[0].issue.context()["count"], 2);

    rig.supervisor.stop().unwrap();
}

#[test]
fn restart_resumes_from_snapshot_without_renotifying() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProjectConfig::default();
    let paths = SentinelPaths::resolve(dir.path(), &config);
    let writer = EntryWriter::new(&paths.log_file).unwrap();
    writer
        .append(
            &LogEntry::new(at(0), "/ideate", EventKind::Failed).with_payload("reason", "no idea"),
            false,
        )
        .unwrap();

    let scheduler = ManualScheduler::new();
    let clock = Arc::new(ManualClock::new(at(5)));
    let first_recorder = Arc::new(Recorder::default());
    {
        let parts =
            SupervisorParts::for_project(&config, &paths, Arc::new(scheduler.clone()), clock.clone())
                .unwrap();
        let mut supervisor = Supervisor::new(SupervisorConfig::default(), parts);
        supervisor.add_observer(first_recorder.clone());
        supervisor.start().unwrap();
        scheduler.advance(Duration::ZERO);
        assert_eq!(first_recorder.of(IssueType::ExplicitFailure).len(), 1);
        supervisor.stop().unwrap();
    }
    assert!(paths.snapshot().exists());

    // Appended while nobody was watching.
    writer
        .append(
            &LogEntry::new(at(10), "/plan", EventKind::Failed).with_payload("reason", "no spec"),
            false,
        )
        .unwrap();

    let second_recorder = Arc::new(Recorder::default());
    let parts =
        SupervisorParts::for_project(&config, &paths, Arc::new(scheduler.clone()), clock.clone())
            .unwrap();
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), parts);
    supervisor.add_observer(second_recorder.clone());
    clock.set(at(12));
    supervisor.start().unwrap();
    scheduler.advance(POLL);

    let failures = second_recorder.of(IssueType::ExplicitFailure);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].issue.message.contains("/plan"));
    assert_eq!(supervisor.state().entries_processed, 2);
    assert_eq!(
        supervisor.log_offset(),
        std::fs::metadata(&paths.log_file).unwrap().len()
    );
    assert_eq!(supervisor.queue().len(), 2);
    supervisor.stop().unwrap();
}

#[test]
fn locked_compliance_violation_jumps_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("activity.jsonl");
    let mut rules = BTreeMap::new();
    rules.insert(
        "protected-branch".to_string(),
        RulePolicy {
            locked: true,
            ..RulePolicy::default()
        },
    );
    let rig = rig(
        &log,
        StaticProbe::on_branch("main"),
        CompliancePolicy::new(rules),
    );

    rig.supervisor
        .process_entry(
            &LogEntry::new(at(0), "/build", EventKind::Failed).with_payload("reason", "compile error"),
        )
        .unwrap();
    let violations = rig.supervisor.check_compliance();
    assert_eq!(violations.len(), 1);
    assert!(violations[0].locked);

    let next = rig.supervisor.queue().get_next_task().unwrap();
    assert_eq!(next.source, COMPLIANCE_SOURCE);
    assert_eq!(next.priority, Priority::Critical);
    assert_eq!(rig.supervisor.queue().get_pending_count(), 2);
    let by_priority = rig.supervisor.queue().get_count_by_priority();
    assert_eq!(by_priority[&Priority::Critical], 1);
    assert_eq!(by_priority[&Priority::High], 1);

    // Same violation on the next pass: history only, no new task.
    assert!(rig.supervisor.check_compliance().is_empty());
    assert_eq!(rig.supervisor.queue().len(), 2);
}

#[test]
fn on_demand_mode_leaves_compliance_to_explicit_checks() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("activity.jsonl");
    let mut rig = rig(
        &log,
        StaticProbe::on_branch("main"),
        CompliancePolicy::default(),
    );
    rig.supervisor.start().unwrap();
    rig.scheduler.advance(Duration::from_secs(120));
    assert!(rig.supervisor.queue().is_empty());

    let violations = rig.supervisor.check_compliance();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule_id, "protected-branch");
    let tasks = rig.supervisor.queue().get_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].priority, Priority::High);
    rig.supervisor.stop().unwrap();
}
