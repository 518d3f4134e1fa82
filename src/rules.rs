//! Rule engine for unstructured tool and test output.
//!
//! Text that never becomes a structured log entry (test runner output, stack
//! traces, git push errors) is classified here. All category patterns are
//! compiled once into a single `RegexSet`, so a blob is scanned in one pass
//! regardless of how many rules exist; capture extraction only runs for the
//! winning category.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Regex, RegexSet};
use serde::Serialize;
use serde_json::Value;

use crate::issue::signature;
use crate::queue::{NewTask, Priority};

/// Identical tool calls in a row before it counts as a loop.
pub const LOOP_REPEAT_THRESHOLD: usize = 5;
const EXCERPT_LIMIT: usize = 200;
const ACTION_PREFIXES: &[&str] = &["Tool:", "Calling tool", "Using tool", "⏺"];

/// Categories in precedence order; the first one that matches wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Test,
    Exception,
    Push,
    PullRequest,
    Ci,
    Stuck,
}

/// `(category, pattern)`; patterns are scanned together.
const RULES: &[(Category, &str)] = &[
    (Category::Test, r"(?m)^\s*FAIL\s+\S+"),
    (Category::Test, r"(?m)^test \S+ \.\.\. FAILED$"),
    (Category::Test, r"\bAssertionError\b"),
    (Category::Test, r"(?i)\bassertion failed\b"),
    (Category::Test, r"(?i)\bexpected\b[^\n]{1,80}\b(?:but|received|got)\b"),
    (Category::Test, r"(?i)\b[1-9]\d* (?:tests? )?failed\b"),
    (Category::Test, r"(?i)\btest result: FAILED\b"),
    (Category::Exception, r"(?m)^Traceback \(most recent call last\)"),
    (Category::Exception, r"(?m)^\s*(?:Uncaught )?[A-Za-z_][\w.]*(?:Error|Exception): "),
    (Category::Exception, r"(?m)^\s+at [^\n]*:\d+:\d+\)?$"),
    (Category::Exception, r"thread '[^']*' panicked at"),
    (Category::Push, r"! \[rejected\]"),
    (Category::Push, r"(?i)failed to push some refs"),
    (Category::Push, r"(?i)\bpush(?:es)? (?:was |were )?rejected\b"),
    (Category::PullRequest, r"(?i)\b(?:pr|pull request)\b[^\n]{0,60}\bchecks? (?:failed|failing)\b"),
    (Category::PullRequest, r"(?i)some checks were not successful"),
    (Category::PullRequest, r"(?i)required status checks? [^\n]*fail"),
    (Category::Ci, r"(?i)\b(?:ci|pipeline|workflow run|github actions)\b[^\n]{0,40}\bfail(?:ed|ure|ing)\b"),
    (Category::Ci, r"(?i)\bbuild (?:failed|failure)\b"),
    (Category::Stuck, r"(?i)\btimed? ?out\b"),
    (Category::Stuck, r"(?i)\bno output (?:for|in) \d+"),
    (Category::Stuck, r"(?i)\b(?:appears|seems) (?:to be )?(?:stuck|hung|frozen)\b"),
    (Category::Stuck, r"(?i)\bwaiting for (?:input|response)\b"),
];

/// What the rule engine recognized, with extracted details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "anomaly_type", rename_all = "snake_case")]
pub enum AnomalyKind {
    AgentLoop {
        tool_name: String,
        repeat_count: usize,
    },
    TestFailure {
        #[serde(skip_serializing_if = "Option::is_none")]
        test_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_count: Option<u64>,
    },
    Exception {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u64>,
    },
    CiFailure,
    PrCheckFailed,
    PushFailed,
    AgentStuck,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentLoop { .. } => "agent_loop",
            Self::TestFailure { .. } => "test_failure",
            Self::Exception { .. } => "exception",
            Self::CiFailure => "ci_failure",
            Self::PrCheckFailed => "pr_check_failed",
            Self::PushFailed => "push_failed",
            Self::AgentStuck => "agent_stuck",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::AgentLoop { .. } => "Agent Loop",
            Self::TestFailure { .. } => "Test Failure",
            Self::Exception { .. } => "Exception",
            Self::CiFailure => "CI Failure",
            Self::PrCheckFailed => "Pull Request Checks Failed",
            Self::PushFailed => "Push Failed",
            Self::AgentStuck => "Agent Stuck",
        }
    }
}

/// A classified blob of output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    #[serde(flatten)]
    pub kind: AnomalyKind,
    pub message: String,
    pub confidence: f64,
    /// First line that triggered the match, trimmed.
    pub excerpt: String,
    pub prompt: String,
    pub suggested_agent: String,
}

impl Anomaly {
    fn new(kind: AnomalyKind, message: String, confidence: f64, excerpt: String) -> Self {
        let suggested_agent = match kind {
            AnomalyKind::CiFailure | AnomalyKind::PrCheckFailed | AnomalyKind::PushFailed => {
                "deployment-engineer"
            }
            _ => "debugger",
        }
        .to_string();
        let mut anomaly = Self {
            kind,
            message,
            confidence,
            excerpt,
            prompt: String::new(),
            suggested_agent,
        };
        anomaly.prompt = anomaly.render_prompt();
        anomaly
    }

    pub fn anomaly_type(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn priority(&self) -> Priority {
        match self.kind {
            AnomalyKind::AgentLoop { .. }
            | AnomalyKind::TestFailure { .. }
            | AnomalyKind::Exception { .. }
            | AnomalyKind::CiFailure => Priority::High,
            AnomalyKind::PrCheckFailed | AnomalyKind::PushFailed | AnomalyKind::AgentStuck => {
                Priority::Medium
            }
        }
    }

    pub fn context(&self) -> BTreeMap<String, Value> {
        let mut ctx = BTreeMap::new();
        if let Ok(Value::Object(fields)) = serde_json::to_value(&self.kind) {
            for (k, v) in fields {
                if k != "anomaly_type" {
                    ctx.insert(k, v);
                }
            }
        }
        if !self.excerpt.is_empty() {
            ctx.insert("excerpt".to_string(), Value::String(self.excerpt.clone()));
        }
        ctx
    }

    pub fn signature(&self) -> String {
        signature(self.anomaly_type(), &self.message)
    }

    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            priority: self.priority(),
            source: "rule_engine".to_string(),
            anomaly_type: self.anomaly_type().to_string(),
            prompt: self.prompt.clone(),
            suggested_agent: self.suggested_agent.clone(),
            context: self.context(),
            report_path: None,
        }
    }

    fn render_prompt(&self) -> String {
        let mut out = format!("# {}\n\n{}\n\n## Details\n\n", self.kind.title(), self.message);
        let ctx = self.context();
        for (key, value) in ctx.iter().filter(|(k, _)| k.as_str() != "excerpt") {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("- {key}: {rendered}\n"));
        }
        if !self.excerpt.is_empty() {
            out.push_str(&format!("\n## Output\n\n```\n{}\n```\n", self.excerpt));
        }
        let action = match self.kind {
            AnomalyKind::AgentLoop { .. } => {
                "Stop calling the same tool; summarize what it returned and pick a different approach."
            }
            AnomalyKind::TestFailure { .. } => {
                "Run the failing test in isolation, find the root cause, and fix it."
            }
            AnomalyKind::Exception { .. } => {
                "Open the first stack frame, reproduce the error, and fix the root cause."
            }
            AnomalyKind::CiFailure => "Read the failing CI job log and fix the failing step.",
            AnomalyKind::PrCheckFailed => {
                "Inspect the failing pull request checks and push a fix."
            }
            AnomalyKind::PushFailed => {
                "Fetch and rebase onto the remote branch, then push again."
            }
            AnomalyKind::AgentStuck => {
                "Check what the agent is waiting on and unblock or restart it."
            }
        };
        out.push_str(&format!("\n## Suggested Action\n\n{action}\n"));
        out
    }
}

pub struct RuleEngine {
    set: RegexSet,
    patterns: Vec<(Category, Regex)>,
    fail_file: Regex,
    test_path: Regex,
    failed_count: Regex,
    error_line: Regex,
    frames: [Regex; 4],
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            set: RegexSet::new(RULES.iter().map(|(_, p)| ascii_boundaries(p))).unwrap(),
            patterns: RULES
                .iter()
                .map(|(c, p)| (*c, Regex::new(&ascii_boundaries(p)).unwrap()))
                .collect(),
            fail_file: Regex::new(r"(?m)^\s*FAIL\s+(\S+)").unwrap(),
            test_path: Regex::new(
                r"([\w./-]*(?:\.(?:test|spec)\.[cm]?[jt]sx?|_test\.(?:go|py|rs)|/test_[\w-]+\.py|tests/[\w/-]+\.rs))",
            )
            .unwrap(),
            failed_count: Regex::new(r"(?i)\b(\d+) (?:tests? )?failed\b").unwrap(),
            error_line: Regex::new(
                r"(?m)^\s*(?:Uncaught )?([A-Za-z_][\w.]*(?:Error|Exception)(?:: [^\n]*)?)$|(thread '[^']*' panicked at [^\n]*)",
            )
            .unwrap(),
            frames: [
                // JavaScript: "    at fn (src/a.ts:10:5)" or "    at src/a.ts:10:5"
                Regex::new(r"(?m)^\s+at (?:[^\n(]*\()?([^\s():]+):(\d+):\d+\)?$").unwrap(),
                // Python: '  File "app.py", line 12, in main'
                Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap(),
                // Rust panic: "panicked at src/main.rs:4:5"
                Regex::new(r"panicked at ([^\s:']+):(\d+):\d+").unwrap(),
                // Rust backtrace / compiler: "--> src/lib.rs:12:9"
                Regex::new(r"--> ([^\s:]+):(\d+):\d+").unwrap(),
            ],
        }
    }

    /// Process-wide engine; patterns compile on first use.
    pub fn shared() -> &'static RuleEngine {
        static ENGINE: OnceLock<RuleEngine> = OnceLock::new();
        ENGINE.get_or_init(RuleEngine::new)
    }

    /// Classify a blob. Pure; `None` when nothing matches.
    pub fn analyze(&self, text: &str) -> Option<Anomaly> {
        if let Some(anomaly) = detect_loop(text) {
            return Some(anomaly);
        }

        let matched = self.set.matches(text);
        let (category, index) = matched
            .iter()
            .map(|i| (self.patterns[i].0, i))
            .min()?;
        let excerpt = self.excerpt(text, index);

        Some(match category {
            Category::Test => self.test_failure(text, excerpt),
            Category::Exception => self.exception(text, excerpt),
            Category::Push => Anomaly::new(
                AnomalyKind::PushFailed,
                "Push to remote was rejected".to_string(),
                0.85,
                excerpt,
            ),
            Category::PullRequest => Anomaly::new(
                AnomalyKind::PrCheckFailed,
                "Pull request checks failed".to_string(),
                0.8,
                excerpt,
            ),
            Category::Ci => Anomaly::new(
                AnomalyKind::CiFailure,
                "CI pipeline failed".to_string(),
                0.85,
                excerpt,
            ),
            Category::Stuck => Anomaly::new(
                AnomalyKind::AgentStuck,
                format!("Agent appears stuck: {excerpt}"),
                0.7,
                excerpt,
            ),
        })
    }

    fn excerpt(&self, text: &str, index: usize) -> String {
        let Some(m) = self.patterns[index].1.find(text) else {
            return String::new();
        };
        let start = text[..m.start()].rfind('\n').map_or(0, |i| i + 1);
        let end = text[m.end()..].find('\n').map_or(text.len(), |i| m.end() + i);
        truncate(text[start..end].trim(), EXCERPT_LIMIT)
    }

    fn test_failure(&self, text: &str, excerpt: String) -> Anomaly {
        let test_file = self
            .fail_file
            .captures(text)
            .or_else(|| self.test_path.captures(text))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let failed_count = self
            .failed_count
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let message = match (&test_file, failed_count) {
            (Some(file), _) => format!("Test failure in {file}"),
            (None, Some(n)) => format!("{n} tests failed"),
            (None, None) => "Test failure detected".to_string(),
        };
        Anomaly::new(
            AnomalyKind::TestFailure {
                test_file,
                failed_count,
            },
            message,
            0.9,
            excerpt,
        )
    }

    fn exception(&self, text: &str, excerpt: String) -> Anomaly {
        let error = self
            .error_line
            .captures(text)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| truncate(m.as_str().trim(), EXCERPT_LIMIT));

        // First frame in the text wins, whichever format it is in.
        let frame = self
            .frames
            .iter()
            .filter_map(|re| re.captures(text))
            .filter_map(|c| {
                let whole = c.get(0)?;
                let file = c.get(1)?.as_str().to_string();
                let line = c.get(2)?.as_str().parse::<u64>().ok()?;
                Some((whole.start(), file, line))
            })
            .min_by_key(|(start, _, _)| *start);
        let (file, line) = match frame {
            Some((_, file, line)) => (Some(file), Some(line)),
            None => (None, None),
        };

        let headline = error.clone().unwrap_or_else(|| "Exception".to_string());
        let message = match (&file, line) {
            (Some(f), Some(l)) => format!("{headline} at {f}:{l}"),
            _ => headline,
        };
        Anomaly::new(
            AnomalyKind::Exception { error, file, line },
            message,
            0.85,
            excerpt,
        )
    }
}

/// Unicode `\b` makes the DFA give up on non-ASCII input (agent output is
/// full of box-drawing glyphs), so rule patterns use ASCII boundaries.
fn ascii_boundaries(pattern: &str) -> String {
    pattern.replace(r"\b", r"(?-u:\b)")
}

/// Longest run of identical action lines; other lines do not break a run.
fn detect_loop(text: &str) -> Option<Anomaly> {
    let mut previous: Option<&str> = None;
    let mut run = 0usize;
    let mut best: Option<(&str, usize)> = None;

    for line in text.lines() {
        let line = line.trim();
        if !ACTION_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        if previous == Some(line) {
            run += 1;
        } else {
            previous = Some(line);
            run = 1;
        }
        if run >= LOOP_REPEAT_THRESHOLD && best.is_none_or(|(_, n)| run > n) {
            best = Some((line, run));
        }
    }

    let (line, repeat_count) = best?;
    let tool_name = tool_name(line);
    Some(Anomaly::new(
        AnomalyKind::AgentLoop {
            tool_name: tool_name.clone(),
            repeat_count,
        },
        format!("Tool {tool_name} called {repeat_count} times in a row with identical input"),
        0.9,
        truncate(line, EXCERPT_LIMIT),
    ))
}

fn tool_name(line: &str) -> String {
    let rest = ACTION_PREFIXES
        .iter()
        .find_map(|p| line.strip_prefix(p))
        .unwrap_or(line)
        .trim_start_matches([':', ' ']);
    rest.split(|c: char| c.is_whitespace() || c == '(' || c == ':')
        .find(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let mut out: String = s.chars().take(limit).collect();
    out.push('…');
    out
}
