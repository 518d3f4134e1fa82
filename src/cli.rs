use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "sentinel",
    about = "Supervises autonomous development workflows from their activity log",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Tail the activity log and intervene until interrupted
    Watch {
        /// Override the configured monitoring mode
        #[arg(long, value_enum)]
        monitoring: Option<MonitoringArg>,
    },

    /// Analyze the whole activity log once and print the issues found
    Analyze {
        /// Read this log instead of the configured one
        #[arg(long)]
        log: Option<PathBuf>,

        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Classify tool or test output (a file, or stdin when omitted)
    Classify {
        file: Option<PathBuf>,

        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run the compliance rules once against the project
    Check {
        /// Feature currently in progress, for documentation checks
        #[arg(long)]
        feature: Option<String>,

        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Inspect and maintain the remediation task queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Append a structured entry to the activity log
    Emit {
        /// Command the entry belongs to, e.g. "/build"
        command: String,

        /// Event kind, e.g. START, MILESTONE, TEST_RESULT
        kind: String,

        /// Workflow phase
        #[arg(long)]
        phase: Option<String>,

        /// Payload field as key=value (value parsed as JSON when possible)
        #[arg(long = "payload", value_name = "KEY=VALUE")]
        payload: Vec<String>,

        /// Sub-agent role, requires --agent-id
        #[arg(long, requires = "agent_id")]
        agent_type: Option<String>,

        /// Sub-agent id, requires --agent-type
        #[arg(long, requires = "agent_type")]
        agent_id: Option<String>,

        /// Skip the human-readable mirror line
        #[arg(long, default_value_t = false)]
        no_mirror: bool,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// List queued tasks, highest priority first
    List {
        /// Include completed and failed tasks
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Show the task that would be picked next
    Next,
    /// Print one task in full
    Show { id: String },
    /// Mark a task completed
    Done { id: String },
    /// Mark a task failed
    Fail {
        id: String,
        #[arg(long)]
        error: Option<String>,
    },
    /// Delete a task
    Remove { id: String },
    /// Pending count and per-priority totals
    Stats,
    /// Move completed and failed tasks to the archive
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MonitoringArg {
    Continuous,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

/// `KEY=VALUE` pairs from `emit --payload`. Values that parse as JSON keep
/// their type, anything else is a string.
pub fn parse_payload(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut payload = BTreeMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("payload must be KEY=VALUE, got {pair:?}");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("payload key is empty in {pair:?}");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        payload.insert(key.to_string(), value);
    }
    Ok(payload)
}
