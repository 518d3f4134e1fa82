//! Bounded, durable, priority-ordered task queue.
//!
//! Every mutation rewrites the whole queue document before returning, and
//! all mutations go through one mutex so the entry-driven path and the
//! compliance timer never interleave writes. When the queue overflows, the
//! lowest-priority, oldest task moves to the archive document with reason
//! `dropped`; nothing is discarded silently.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::Clock;
use crate::store::{DocumentStore, JsonFileStore, StoreError};

pub const DEFAULT_CAPACITY: usize = 50;
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => bail!("unknown priority: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    pub source: String,
    pub anomaly_type: String,
    pub prompt: String,
    pub suggested_agent: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input to [`QueueManager::add_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub priority: Priority,
    pub source: String,
    pub anomaly_type: String,
    pub prompt: String,
    pub suggested_agent: String,
    pub context: BTreeMap<String, Value>,
    pub report_path: Option<String>,
}

/// Fields [`QueueManager::update_task`] may change. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub attempts: Option<u32>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveReason {
    Dropped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTask {
    #[serde(flatten)]
    pub task: Task,
    pub archived_at: DateTime<Utc>,
    #[serde(rename = "archive_reason")]
    pub archive_reason: ArchiveReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveDocument {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<ArchivedTask>,
}

pub struct QueueManager {
    tasks: Mutex<Vec<Task>>,
    store: Box<dyn DocumentStore<QueueDocument>>,
    archive: Box<dyn DocumentStore<ArchiveDocument>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    /// Load durable state, quarantining a corrupt queue document.
    pub fn open(
        store: Box<dyn DocumentStore<QueueDocument>>,
        archive: Box<dyn DocumentStore<ArchiveDocument>>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let tasks = match store.load() {
            Ok(Some(doc)) => doc.tasks,
            Ok(None) => Vec::new(),
            Err(e) if e.is_corrupt() => {
                let moved = store.quarantine()?;
                warn!(error = %e, quarantined = ?moved, "queue document corrupt; starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let manager = Self {
            tasks: Mutex::new(Vec::new()),
            store,
            archive,
            capacity: capacity.max(1),
            clock,
        };

        let mut tasks = tasks;
        let evicted = evict_overflow(&mut tasks, manager.capacity);
        if !evicted.is_empty() {
            let now = manager.clock.now();
            manager.archive_tasks(evicted, ArchiveReason::Dropped, now)?;
            manager.persist(&tasks, now)?;
        }
        debug!(tasks = tasks.len(), "queue loaded");
        *manager.lock() = tasks;
        Ok(manager)
    }

    /// Queue and archive as `queue.json` / `queue-archive.json` in `dir`.
    pub fn open_dir(dir: &Path, capacity: usize, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        Self::open(
            Box::new(JsonFileStore::<QueueDocument>::new(dir.join("queue.json"))),
            Box::new(JsonFileStore::<ArchiveDocument>::new(dir.join("queue-archive.json"))),
            capacity,
            clock,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add_task(&self, input: NewTask) -> Result<Task, QueueError> {
        let mut guard = self.lock();
        let now = self.clock.now();

        let mut id = generate_id(now);
        while guard.iter().any(|t| t.id == id) {
            id = generate_id(now);
        }
        let task = Task {
            id,
            created_at: now,
            priority: input.priority,
            source: input.source,
            anomaly_type: input.anomaly_type,
            prompt: input.prompt,
            suggested_agent: input.suggested_agent,
            context: input.context,
            report_path: input.report_path,
            status: TaskStatus::Pending,
            attempts: 0,
            completed_at: None,
            error: None,
        };

        let mut tasks = guard.clone();
        tasks.push(task.clone());
        let evicted = evict_overflow(&mut tasks, self.capacity);
        if !evicted.is_empty() {
            for dropped in &evicted {
                warn!(
                    task = %dropped.id,
                    priority = %dropped.priority,
                    "queue full; archiving lowest-priority task"
                );
            }
            self.archive_tasks(evicted, ArchiveReason::Dropped, now)?;
        }
        self.persist(&tasks, now)?;
        *guard = tasks;

        info!(
            task = %task.id,
            priority = %task.priority,
            source = %task.source,
            anomaly = %task.anomaly_type,
            "task queued"
        );
        Ok(task)
    }

    /// Highest-priority pending task, oldest first within a priority.
    pub fn get_next_task(&self) -> Option<Task> {
        self.lock()
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| (Reverse(t.priority), t.created_at))
            .cloned()
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, QueueError> {
        let mut guard = self.lock();
        let mut tasks = guard.clone();
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Err(QueueError::TaskNotFound(id.to_string()));
        };

        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(attempts) = patch.attempts {
            task.attempts = attempts;
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if let Some(at) = patch.completed_at {
            task.completed_at = Some(at);
        }
        let updated = task.clone();

        self.persist(&tasks, self.clock.now())?;
        *guard = tasks;
        debug!(task = %id, status = %updated.status, "task updated");
        Ok(updated)
    }

    /// Delete a task. Unknown ids are not an error.
    pub fn remove_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let mut guard = self.lock();
        let Some(index) = guard.iter().position(|t| t.id == id) else {
            return Ok(None);
        };
        let mut tasks = guard.clone();
        let removed = tasks.remove(index);
        self.persist(&tasks, self.clock.now())?;
        *guard = tasks;
        debug!(task = %id, "task removed");
        Ok(Some(removed))
    }

    pub fn get_pending_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Tasks per priority across every status; all four keys are present.
    pub fn get_count_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts: BTreeMap<Priority, usize> = Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for task in self.lock().iter() {
            *counts.entry(task.priority).or_default() += 1;
        }
        counts
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.lock().clone()
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get_archive(&self) -> Result<Vec<ArchivedTask>, QueueError> {
        Ok(self.load_archive()?.map(|doc| doc.tasks).unwrap_or_default())
    }

    /// Move completed and failed tasks to the archive. Returns how many moved.
    pub fn archive_finished(&self) -> Result<usize, QueueError> {
        let mut guard = self.lock();
        let (finished, remaining): (Vec<Task>, Vec<Task>) =
            guard.iter().cloned().partition(|t| t.status.is_finished());
        if finished.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now();
        let count = finished.len();
        let (completed, failed): (Vec<Task>, Vec<Task>) = finished
            .into_iter()
            .partition(|t| t.status == TaskStatus::Completed);
        let mut archived: Vec<ArchivedTask> = Vec::with_capacity(count);
        archived.extend(completed.into_iter().map(|task| ArchivedTask {
            task,
            archived_at: now,
            archive_reason: ArchiveReason::Completed,
        }));
        archived.extend(failed.into_iter().map(|task| ArchivedTask {
            task,
            archived_at: now,
            archive_reason: ArchiveReason::Failed,
        }));

        self.append_archive(archived, now)?;
        self.persist(&remaining, now)?;
        *guard = remaining;
        info!(count, "finished tasks archived");
        Ok(count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, tasks: &[Task], now: DateTime<Utc>) -> Result<(), QueueError> {
        self.store.save(&QueueDocument {
            version: DOCUMENT_VERSION,
            updated_at: now,
            tasks: tasks.to_vec(),
        })?;
        Ok(())
    }

    fn archive_tasks(
        &self,
        tasks: Vec<Task>,
        reason: ArchiveReason,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let archived = tasks
            .into_iter()
            .map(|task| ArchivedTask {
                task,
                archived_at: now,
                archive_reason: reason,
            })
            .collect();
        self.append_archive(archived, now)
    }

    fn append_archive(&self, mut archived: Vec<ArchivedTask>, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut tasks = self.load_archive()?.map(|doc| doc.tasks).unwrap_or_default();
        tasks.append(&mut archived);
        self.archive.save(&ArchiveDocument {
            version: DOCUMENT_VERSION,
            updated_at: now,
            tasks,
        })?;
        Ok(())
    }

    fn load_archive(&self) -> Result<Option<ArchiveDocument>, QueueError> {
        match self.archive.load() {
            Ok(doc) => Ok(doc),
            Err(e) if e.is_corrupt() => {
                let moved = self.archive.quarantine()?;
                warn!(error = %e, quarantined = ?moved, "archive document corrupt; starting a new one");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove tasks until `tasks` fits, lowest priority then oldest first.
fn evict_overflow(tasks: &mut Vec<Task>, capacity: usize) -> Vec<Task> {
    let mut evicted = Vec::new();
    while tasks.len() > capacity {
        let Some(index) = tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.priority, t.created_at))
            .map(|(i, _)| i)
        else {
            break;
        };
        evicted.push(tasks.remove(index));
    }
    evicted
}

const ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `task-YYYYMMDD-HHMMSS-xxxx`.
fn generate_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().into_bytes();
    let suffix: String = random[12..]
        .iter()
        .map(|b| ID_ALPHABET[usize::from(*b) % ID_ALPHABET.len()] as char)
        .collect();
    format!("task-{}-{suffix}", now.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2025-10-09T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ))
    }

    fn memory_queue(capacity: usize, clock: Arc<ManualClock>) -> QueueManager {
        QueueManager::open(
            Box::new(MemoryStore::<QueueDocument>::new()),
            Box::new(MemoryStore::<ArchiveDocument>::new()),
            capacity,
            clock,
        )
        .unwrap()
    }

    fn new_task(priority: Priority, anomaly: &str) -> NewTask {
        NewTask {
            priority,
            source: "workflow_analyzer".into(),
            anomaly_type: anomaly.into(),
            prompt: format!("# {anomaly}"),
            suggested_agent: "debugger".into(),
            context: BTreeMap::new(),
            report_path: None,
        }
    }

    #[test]
    fn add_assigns_id_and_defaults() {
        let queue = memory_queue(50, clock());
        let task = queue.add_task(new_task(Priority::High, "loop_detected")).unwrap();
        assert!(task.id.starts_with("task-20251009-100000-"));
        assert_eq!(task.id.len(), "task-20251009-100000-".len() + 4);
        assert!(task.id[21..].chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(queue.get_pending_count(), 1);
    }

    #[test]
    fn next_task_prefers_priority_then_age() {
        let clock = clock();
        let queue = memory_queue(50, Arc::clone(&clock));
        queue.add_task(new_task(Priority::Medium, "a")).unwrap();
        clock.advance(Duration::from_secs(1));
        let high_old = queue.add_task(new_task(Priority::High, "b")).unwrap();
        clock.advance(Duration::from_secs(1));
        queue.add_task(new_task(Priority::High, "c")).unwrap();

        assert_eq!(queue.get_next_task().unwrap().id, high_old.id);

        queue
            .update_task(
                &high_old.id,
                TaskPatch {
                    status: Some(TaskStatus::Executing),
                    attempts: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(queue.get_next_task().unwrap().anomaly_type, "c");
    }

    #[test]
    fn next_task_is_none_without_pending() {
        let queue = memory_queue(50, clock());
        assert!(queue.get_next_task().is_none());
        let task = queue.add_task(new_task(Priority::Low, "a")).unwrap();
        queue
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(queue.get_next_task().is_none());
    }

    #[test]
    fn update_unknown_task_is_an_error() {
        let queue = memory_queue(50, clock());
        let err = queue.update_task("task-missing", TaskPatch::default()).unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(ref id) if id == "task-missing"));
        assert_eq!(err.to_string(), "task not found: task-missing");
    }

    #[test]
    fn update_records_failure_details() {
        let clock = clock();
        let queue = memory_queue(50, Arc::clone(&clock));
        let task = queue.add_task(new_task(Priority::High, "a")).unwrap();
        let done_at = clock.now();
        let updated = queue
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    attempts: Some(3),
                    error: Some("agent crashed".into()),
                    completed_at: Some(done_at),
                },
            )
            .unwrap();
        assert_eq!(updated.error.as_deref(), Some("agent crashed"));
        assert_eq!(queue.get_task(&task.id).unwrap(), updated);
    }

    #[test]
    fn remove_is_unconditional() {
        let queue = memory_queue(50, clock());
        let task = queue.add_task(new_task(Priority::Low, "a")).unwrap();
        assert_eq!(queue.remove_task(&task.id).unwrap().unwrap().id, task.id);
        assert!(queue.remove_task(&task.id).unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_archives_lowest_oldest() {
        let clock = clock();
        let queue = memory_queue(3, Arc::clone(&clock));
        let low_old = queue.add_task(new_task(Priority::Low, "old")).unwrap();
        clock.advance(Duration::from_secs(1));
        queue.add_task(new_task(Priority::Low, "young")).unwrap();
        clock.advance(Duration::from_secs(1));
        queue.add_task(new_task(Priority::Critical, "c")).unwrap();
        clock.advance(Duration::from_secs(1));
        queue.add_task(new_task(Priority::Medium, "m")).unwrap();

        assert_eq!(queue.len(), 3);
        assert!(queue.get_task(&low_old.id).is_none());
        let archive = queue.get_archive().unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].task.id, low_old.id);
        assert_eq!(archive[0].archive_reason, ArchiveReason::Dropped);
    }

    #[test]
    fn counts_cover_every_priority() {
        let queue = memory_queue(50, clock());
        queue.add_task(new_task(Priority::High, "a")).unwrap();
        queue.add_task(new_task(Priority::High, "b")).unwrap();
        let counts = queue.get_count_by_priority();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&Priority::High], 2);
        assert_eq!(counts[&Priority::Critical], 0);
    }

    #[test]
    fn archive_finished_moves_done_and_failed() {
        let queue = memory_queue(50, clock());
        let a = queue.add_task(new_task(Priority::High, "a")).unwrap();
        let b = queue.add_task(new_task(Priority::High, "b")).unwrap();
        queue.add_task(new_task(Priority::High, "c")).unwrap();
        for (id, status) in [(&a.id, TaskStatus::Completed), (&b.id, TaskStatus::Failed)] {
            queue
                .update_task(
                    id,
                    TaskPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        assert_eq!(queue.archive_finished().unwrap(), 2);
        assert_eq!(queue.len(), 1);
        let reasons: Vec<_> = queue
            .get_archive()
            .unwrap()
            .into_iter()
            .map(|t| t.archive_reason)
            .collect();
        assert_eq!(reasons, vec![ArchiveReason::Completed, ArchiveReason::Failed]);
        assert_eq!(queue.archive_finished().unwrap(), 0);
    }

    #[test]
    fn survives_restart_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let ids: Vec<(String, Priority)> = {
            let queue = QueueManager::open_dir(tmp.path(), 50, clock.clone()).unwrap();
            let a = queue.add_task(new_task(Priority::Critical, "a")).unwrap();
            let b = queue.add_task(new_task(Priority::Low, "b")).unwrap();
            queue
                .update_task(
                    &b.id,
                    TaskPatch {
                        status: Some(TaskStatus::Executing),
                        ..Default::default()
                    },
                )
                .unwrap();
            vec![(a.id, a.priority), (b.id, b.priority)]
        };

        let reopened = QueueManager::open_dir(tmp.path(), 50, clock).unwrap();
        let tasks = reopened.get_tasks();
        let got: Vec<_> = tasks.iter().map(|t| (t.id.clone(), t.priority)).collect();
        assert_eq!(got, ids);
        assert_eq!(tasks[1].status, TaskStatus::Executing);

        let raw = std::fs::read_to_string(tmp.path().join("queue.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], 1);
        assert!(doc["updatedAt"].is_string());
        assert_eq!(doc["tasks"][0]["anomalyType"], "a");
    }

    #[test]
    fn archive_document_uses_snake_reason_key() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = QueueManager::open_dir(tmp.path(), 1, clock()).unwrap();
        queue.add_task(new_task(Priority::Low, "a")).unwrap();
        queue.add_task(new_task(Priority::High, "b")).unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("queue-archive.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["tasks"][0]["archive_reason"], "dropped");
        assert!(doc["tasks"][0]["archivedAt"].is_string());
        assert_eq!(doc["tasks"][0]["anomalyType"], "a");
    }

    #[test]
    fn corrupt_queue_is_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("queue.json"), "{{{").unwrap();
        let queue = QueueManager::open_dir(tmp.path(), 50, clock()).unwrap();
        assert!(queue.is_empty());
        assert!(tmp.path().join("queue.json.corrupt").exists());
        queue.add_task(new_task(Priority::Low, "a")).unwrap();
        assert!(tmp.path().join("queue.json").exists());
    }

    #[test]
    fn oversized_document_is_trimmed_on_open() {
        let clock = clock();
        let store: Arc<MemoryStore<QueueDocument>> = Arc::new(MemoryStore::new());
        {
            let queue = QueueManager::open(
                Box::new(Arc::clone(&store)),
                Box::new(MemoryStore::<ArchiveDocument>::new()),
                10,
                clock.clone(),
            )
            .unwrap();
            for i in 0..10 {
                queue.add_task(new_task(Priority::Medium, &format!("t{i}"))).unwrap();
            }
        }
        let archive: Arc<MemoryStore<ArchiveDocument>> = Arc::new(MemoryStore::new());
        let queue = QueueManager::open(
            Box::new(Arc::clone(&store)),
            Box::new(Arc::clone(&archive)),
            4,
            clock,
        )
        .unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.get_archive().unwrap().len(), 6);
    }

    fn arb_priority() -> impl Strategy<Value = Priority> {
        prop::sample::select(Priority::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn capacity_and_eviction_order(priorities in prop::collection::vec(arb_priority(), 1..80)) {
            let clock = clock();
            let queue = memory_queue(DEFAULT_CAPACITY, Arc::clone(&clock));
            for (i, p) in priorities.iter().enumerate() {
                queue.add_task(new_task(*p, &format!("t{i}"))).unwrap();
                clock.advance(Duration::from_secs(1));
                prop_assert!(queue.len() <= DEFAULT_CAPACITY);
            }

            let retained_min = queue.get_tasks().iter().map(|t| t.priority).min();
            for dropped in queue.get_archive().unwrap() {
                prop_assert_eq!(dropped.archive_reason, ArchiveReason::Dropped);
                if let Some(min) = retained_min {
                    prop_assert!(dropped.task.priority <= min);
                }
            }
            prop_assert_eq!(queue.len() + queue.get_archive().unwrap().len(), priorities.len());
        }

        #[test]
        fn next_task_is_best_pending(
            items in prop::collection::vec((arb_priority(), any::<bool>()), 0..30)
        ) {
            let clock = clock();
            let queue = memory_queue(DEFAULT_CAPACITY, Arc::clone(&clock));
            for (i, (p, pending)) in items.iter().enumerate() {
                let task = queue.add_task(new_task(*p, &format!("t{i}"))).unwrap();
                if !pending {
                    queue.update_task(&task.id, TaskPatch {
                        status: Some(TaskStatus::Executing),
                        ..Default::default()
                    }).unwrap();
                }
                clock.advance(Duration::from_secs(1));
            }

            let expected = queue
                .get_tasks()
                .into_iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .max_by(|a, b| a.priority.cmp(&b.priority).then(b.created_at.cmp(&a.created_at)));
            prop_assert_eq!(queue.get_next_task().map(|t| t.id), expected.map(|t| t.id));
        }
    }
}
