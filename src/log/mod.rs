//! Activity log: one JSON object per line.
//!
//! Command wrappers append a structured entry for every lifecycle event
//! (command start/complete, milestones, TDD phases, sub-agent spawns,
//! compliance checks) and may follow it with a free-text mirror line for
//! humans. The log is append-only; append order is timestamp order.
//!
//! [`LogReader`] tails the file by polling: seek to the last consumed byte,
//! read what was appended, and hand complete lines to the caller. Partial
//! lines stay buffered until their newline arrives, mirror lines and
//! malformed JSON are skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::scheduler::{JobHandle, Scheduler};

/// Lifecycle event recorded by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A command (or, with an agent descriptor, a sub-agent) started.
    Start,
    /// A command finished.
    Complete,
    /// A command or sub-agent reported failure.
    Failed,
    /// Progress marker within a command.
    Milestone,
    /// TDD phase transition (RED/GREEN/REFACTOR in `phase`).
    Phase,
    /// A sub-agent was spawned.
    AgentSpawn,
    /// A sub-agent finished.
    AgentComplete,
    /// Result of a compliance evaluation, violations in the snapshot.
    IronLawCheck,
    /// Test run outcome, `passed` in the payload.
    TestResult,
    /// A file was written, `path` in the payload.
    FileChange,
    /// A tool was invoked, `tool` and optional `target` in the payload.
    ToolCall,
    /// Anything this version does not know about.
    #[serde(other)]
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Milestone => "MILESTONE",
            Self::Phase => "PHASE",
            Self::AgentSpawn => "AGENT_SPAWN",
            Self::AgentComplete => "AGENT_COMPLETE",
            Self::IronLawCheck => "IRON_LAW_CHECK",
            Self::TestResult => "TEST_RESULT",
            Self::FileChange => "FILE_CHANGE",
            Self::ToolCall => "TOOL_CALL",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let kind: EventKind = serde_json::from_value(Value::String(normalized))
            .with_context(|| format!("unknown event kind: {s}"))?;
        if kind == EventKind::Other {
            anyhow::bail!("unknown event kind: {s}");
        }
        Ok(kind)
    }
}

/// TDD sub-cycle within the build stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TddPhase {
    Red,
    Green,
    Refactor,
}

impl TddPhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RED" => Some(Self::Red),
            "GREEN" => Some(Self::Green),
            "REFACTOR" => Some(Self::Refactor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "RED",
            Self::Green => "GREEN",
            Self::Refactor => "REFACTOR",
        }
    }
}

/// Identifies the sub-agent an entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub agent_type: String,
    pub agent_id: String,
    #[serde(default)]
    pub parent_command: String,
}

/// One violated law reported by an `IRON_LAW_CHECK` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LawViolation {
    pub law: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrective_action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceSnapshot {
    #[serde(default)]
    pub violations: Vec<LawViolation>,
}

/// A structured entry in the activity log. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub event_kind: EventKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_descriptor: Option<AgentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_snapshot: Option<ComplianceSnapshot>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, command: impl Into<String>, event_kind: EventKind) -> Self {
        Self {
            timestamp,
            command: command.into(),
            phase: None,
            event_kind,
            payload: BTreeMap::new(),
            agent_descriptor: None,
            compliance_snapshot: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_agent(mut self, agent_type: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let parent_command = self.command.clone();
        self.agent_descriptor = Some(AgentDescriptor {
            agent_type: agent_type.into(),
            agent_id: agent_id.into(),
            parent_command,
        });
        self
    }

    pub fn with_violations(mut self, violations: Vec<LawViolation>) -> Self {
        self.compliance_snapshot = Some(ComplianceSnapshot { violations });
        self
    }

    /// String payload field, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Feature this entry is about; falls back to the command.
    pub fn feature(&self) -> &str {
        self.payload_str("feature").unwrap_or(&self.command)
    }

    pub fn tdd_phase(&self) -> Option<TddPhase> {
        self.phase.as_deref().and_then(TddPhase::parse)
    }

    /// Canonical identity of a milestone payload. `payload` is ordered, so
    /// equal payloads always produce equal keys.
    pub fn milestone_key(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_default()
    }

    /// Human label for a milestone.
    pub fn milestone_label(&self) -> String {
        ["name", "milestone", "message"]
            .iter()
            .find_map(|key| self.payload_str(key))
            .map(str::to_string)
            .unwrap_or_else(|| self.milestone_key())
    }

    pub fn reason(&self) -> Option<&str> {
        ["reason", "error", "message"]
            .iter()
            .find_map(|key| self.payload_str(key))
    }

    pub fn test_passed(&self) -> Option<bool> {
        self.payload.get("passed").and_then(Value::as_bool)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.payload_str("path")
            .or_else(|| self.payload_str("file"))
            .or_else(|| self.payload_str("target"))
    }

    /// Outputs a completion says it failed to produce.
    pub fn missing_outputs(&self) -> Vec<String> {
        self.payload
            .get("missing_outputs")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(completed, total)` when a completion reports partial progress.
    pub fn completion_counts(&self) -> (Option<u64>, Option<u64>) {
        (
            self.payload.get("completed").and_then(Value::as_u64),
            self.payload.get("total").and_then(Value::as_u64),
        )
    }

    pub fn violations(&self) -> &[LawViolation] {
        self.compliance_snapshot
            .as_ref()
            .map(|s| s.violations.as_slice())
            .unwrap_or_default()
    }

    /// One-line rendering for the human mirror line.
    pub fn mirror_line(&self) -> String {
        let mut line = format!(
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.command,
            self.event_kind
        );
        if let Some(phase) = &self.phase {
            line.push_str(&format!(" ({phase})"));
        }
        if let Some(agent) = &self.agent_descriptor {
            line.push_str(&format!(" agent={}:{}", agent.agent_type, agent.agent_id));
        }
        line
    }
}

/// Parse one log line. Mirror lines and malformed JSON yield `None`.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<LogEntry>(trimmed) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(error = %e, "skipping malformed log line");
            None
        }
    }
}

/// Appends entries to the activity log.
pub struct EntryWriter {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl EntryWriter {
    /// Open the log for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Append an entry, optionally followed by its human mirror line.
    pub fn append(&self, entry: &LogEntry, mirror: bool) -> Result<()> {
        let json = serde_json::to_string(entry).context("failed to serialize log entry")?;
        debug!(event = %json, "activity log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        if mirror {
            writeln!(writer, "{}", entry.mirror_line()).context("failed to write mirror line")?;
        }
        writer.flush().context("failed to flush log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// An entry together with the byte offset just past its line.
#[derive(Debug, Clone, PartialEq)]
pub struct TailedEntry {
    pub entry: LogEntry,
    pub end_offset: u64,
}

/// Incremental reader over the activity log.
pub struct LogReader {
    path: PathBuf,
    position: u64,
    pending: Vec<u8>,
}

impl LogReader {
    pub fn new(path: &Path) -> Self {
        Self::with_position(path, 0)
    }

    /// Start reading at a byte offset. Offsets past EOF are clamped on poll.
    pub fn with_position(path: &Path, position: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            position,
            pending: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the first byte not yet consumed as a complete line.
    pub fn checkpoint_offset(&self) -> u64 {
        self.position.saturating_sub(self.pending.len() as u64)
    }

    /// Parse every complete line currently in the file. Returns the entries
    /// and the offset just past the last complete line.
    pub fn read_all(&self) -> Result<(Vec<LogEntry>, u64)> {
        let Some(bytes) = self.read_bytes(None)? else {
            return Ok((Vec::new(), 0));
        };
        let (lines, consumed) = complete_lines(&bytes, 0);
        let entries = lines.into_iter().filter_map(|(l, _)| parse_line(&l)).collect();
        Ok((entries, consumed))
    }

    /// Parse complete lines that end at or before `offset`.
    pub fn read_until(&self, offset: u64) -> Result<Vec<LogEntry>> {
        let Some(bytes) = self.read_bytes(Some(offset))? else {
            return Ok(Vec::new());
        };
        let (lines, _) = complete_lines(&bytes, 0);
        Ok(lines.into_iter().filter_map(|(l, _)| parse_line(&l)).collect())
    }

    /// Current length of the log, zero when absent.
    pub fn file_len(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("failed to stat {}", self.path.display())),
        }
    }

    /// Read whatever was appended since the last poll.
    pub fn poll(&mut self) -> Result<Vec<TailedEntry>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open activity log: {}", self.path.display()));
            }
        };

        // Truncation or rotation: start over from what is there now.
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if self.position > file_len {
            debug!(
                position = self.position,
                file_len, "activity log shrank; clamping read position"
            );
            self.position = file_len;
            self.pending.clear();
        }

        file.seek(SeekFrom::Start(self.position))
            .context("failed to seek in activity log")?;
        let mut new_bytes = Vec::new();
        let n = file
            .read_to_end(&mut new_bytes)
            .context("failed to read activity log")?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let base = self.checkpoint_offset();
        self.position += n as u64;
        self.pending.extend_from_slice(&new_bytes);

        let (lines, consumed) = complete_lines(&self.pending, base);
        self.pending.drain(..(consumed - base) as usize);

        Ok(lines
            .into_iter()
            .filter_map(|(line, end_offset)| {
                parse_line(&line).map(|entry| TailedEntry { entry, end_offset })
            })
            .collect())
    }

    /// Poll on the scheduler's cadence, delivering entries in file order.
    /// Read errors are logged and retried on the next tick.
    pub fn start_tailing<F>(
        mut self,
        scheduler: &dyn Scheduler,
        interval: Duration,
        mut on_entry: F,
    ) -> Result<TailHandle>
    where
        F: FnMut(TailedEntry) + Send + 'static,
    {
        let job = scheduler.every(
            "log-tail",
            interval,
            Box::new(move || match self.poll() {
                Ok(entries) => {
                    for entry in entries {
                        on_entry(entry);
                    }
                }
                Err(e) => debug!(error = %format!("{e:#}"), "activity log poll failed; retrying"),
            }),
        )?;
        Ok(TailHandle { job: Some(job) })
    }

    fn read_bytes(&self, limit: Option<u64>) -> Result<Option<Vec<u8>>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open activity log: {}", self.path.display()));
            }
        };
        let mut bytes = Vec::new();
        match limit {
            Some(limit) => file.take(limit).read_to_end(&mut bytes),
            None => (&file).read_to_end(&mut bytes),
        }
        .with_context(|| format!("failed to read activity log: {}", self.path.display()))?;
        Ok(Some(bytes))
    }
}

/// Split `bytes` into complete lines, returning each line with the absolute
/// offset just past its newline, plus the absolute offset after the last one.
fn complete_lines(bytes: &[u8], base: u64) -> (Vec<(String, u64)>, u64) {
    let mut lines = Vec::new();
    let mut start = 0usize;
    while let Some(rel) = bytes[start..].iter().position(|b| *b == b'\n') {
        let end = start + rel;
        let line = String::from_utf8_lossy(&bytes[start..end]).into_owned();
        lines.push((line, base + end as u64 + 1));
        start = end + 1;
    }
    (lines, base + start as u64)
}

/// Stops a running tail. Stopping twice is a no-op.
pub struct TailHandle {
    job: Option<Box<dyn JobHandle>>,
}

impl TailHandle {
    pub fn stop(&mut self) {
        if let Some(mut job) = self.job.take() {
            job.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }
}
