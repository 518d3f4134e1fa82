use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};

use sentinel::analyzer::WorkflowAnalyzer;
use sentinel::cli::{Cli, Command, MonitoringArg, QueueCommand, parse_payload};
use sentinel::compliance::{ComplianceHistory, ComplianceMonitor, GitProbe};
use sentinel::config::{MonitoringMode, ProjectConfig};
use sentinel::intervention::InterventionGenerator;
use sentinel::log::{EntryWriter, EventKind, LogEntry, LogReader};
use sentinel::paths::{SentinelPaths, project_root};
use sentinel::queue::{QueueManager, Task, TaskPatch, TaskStatus};
use sentinel::report;
use sentinel::rules::RuleEngine;
use sentinel::scheduler::{Clock, SystemClock, ThreadScheduler};
use sentinel::shell_completion;
use sentinel::store::JsonFileStore;
use sentinel::supervisor::{
    LogFileObserver, Supervisor, SupervisorConfig, SupervisorParts, TracingObserver,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if is_quiet_command => "sentinel=warn",
        0 => "sentinel=info",
        1 => "sentinel=debug",
        _ => "sentinel=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;
    match config_path {
        Some(ref p) => debug!("loaded config from {}", p.display()),
        None => debug!("no .sentinel/config.toml found, using defaults"),
    }

    let root = project_root(config_path.as_deref(), &cwd);
    let paths = SentinelPaths::resolve(&root, &config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Watch { monitoring } => watch(&config, &paths, monitoring, clock),
        Command::Analyze { log, json } => {
            let log = log.unwrap_or_else(|| paths.log_file.clone());
            let (entries, _) = LogReader::new(&log).read_all()?;
            let analyzer = WorkflowAnalyzer::new(config.analyzer.to_analyzer_config());
            let analysis = analyzer.analyze(&entries, clock.now());
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                let generator = InterventionGenerator::new(config.intervention.thresholds());
                print!("{}", report::render_analysis(&analysis, &generator));
            }
            Ok(())
        }
        Command::Classify { file, json } => {
            let text = match file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read stdin")?;
                    buf
                }
            };
            let anomaly = RuleEngine::shared().analyze(&text);
            if json {
                println!("{}", serde_json::to_string_pretty(&anomaly)?);
            } else {
                print!("{}", report::render_anomaly(anomaly.as_ref()));
            }
            Ok(())
        }
        Command::Check { feature, json } => {
            let policy = config.compliance.policy(&paths.root)?;
            let mut monitor =
                ComplianceMonitor::new(Box::new(GitProbe::new(&paths.root)), policy, clock)
                    .with_ignored_after(config.analyzer.iron_law_ignored_after)
                    .with_history(Box::new(JsonFileStore::<ComplianceHistory>::new(
                        paths.compliance_history(),
                    )))?;
            monitor.set_active_feature(feature);
            let violations = monitor.check();
            if json {
                println!("{}", serde_json::to_string_pretty(&violations)?);
            } else {
                print!("{}", report::render_violations(&violations));
            }
            Ok(())
        }
        Command::Queue { command } => queue_command(command, &config, &paths, clock),
        Command::Emit {
            command,
            kind,
            phase,
            payload,
            agent_type,
            agent_id,
            no_mirror,
        } => {
            let kind: EventKind = kind.parse()?;
            let mut entry = LogEntry::new(clock.now(), command, kind);
            if let Some(phase) = phase {
                entry = entry.with_phase(phase);
            }
            for (key, value) in parse_payload(&payload)? {
                entry = entry.with_payload(key, value);
            }
            if let (Some(agent_type), Some(agent_id)) = (agent_type, agent_id) {
                entry = entry.with_agent(agent_type, agent_id);
            }
            EntryWriter::new(&paths.log_file)?.append(&entry, !no_mirror)?;
            debug!(kind = kind.as_str(), log = %paths.log_file.display(), "entry appended");
            Ok(())
        }
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    report::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    report::render_config_human(&config, config_path.as_deref())
                );
            }
            Ok(())
        }
        Command::Completions { shell } => shell_completion::print(shell),
    }
}

fn watch(
    config: &ProjectConfig,
    paths: &SentinelPaths,
    monitoring: Option<MonitoringArg>,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    let mut settings = config.supervisor.clone();
    if let Some(monitoring) = monitoring {
        settings.monitoring = match monitoring {
            MonitoringArg::Continuous => MonitoringMode::Continuous,
            MonitoringArg::OnDemand => MonitoringMode::OnDemand,
        };
    }

    let parts = SupervisorParts::for_project(config, paths, Arc::new(ThreadScheduler), clock.clone())?;
    let mut supervisor = Supervisor::new(SupervisorConfig::from_settings(&settings), parts);
    supervisor.add_observer(Arc::new(TracingObserver));
    supervisor.add_observer(Arc::new(LogFileObserver::new(
        paths.notifications_log(),
        clock,
    )));

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();

    supervisor.start()?;
    info!(
        log = %paths.log_file.display(),
        monitoring = ?settings.monitoring,
        "watching activity log, Ctrl-C to stop"
    );
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("stopping");
    supervisor.stop()
}

fn queue_command(
    command: QueueCommand,
    config: &ProjectConfig,
    paths: &SentinelPaths,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    let queue = QueueManager::open_dir(&paths.state_dir, config.queue.capacity, clock.clone())
        .context("failed to open task queue")?;

    match command {
        QueueCommand::List { all } => {
            let mut tasks: Vec<Task> = queue
                .get_tasks()
                .into_iter()
                .filter(|task| all || !task.status.is_finished())
                .collect();
            tasks.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
            if tasks.is_empty() {
                println!("Queue is empty.");
            }
            for task in &tasks {
                println!("{}", report::render_task_line(task));
            }
        }
        QueueCommand::Next => match queue.get_next_task() {
            Some(task) => print!("{}", report::render_task(&task)),
            None => println!("No pending tasks."),
        },
        QueueCommand::Show { id } => {
            let task = queue
                .get_task(&id)
                .with_context(|| format!("task not found: {id}"))?;
            print!("{}", report::render_task(&task));
        }
        QueueCommand::Done { id } => {
            queue.update_task(
                &id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    completed_at: Some(clock.now()),
                    ..TaskPatch::default()
                },
            )?;
            println!("{id} completed");
        }
        QueueCommand::Fail { id, error } => {
            let task = queue
                .get_task(&id)
                .with_context(|| format!("task not found: {id}"))?;
            queue.update_task(
                &id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    attempts: Some(task.attempts + 1),
                    error,
                    completed_at: Some(clock.now()),
                },
            )?;
            println!("{id} failed");
        }
        QueueCommand::Remove { id } => match queue.remove_task(&id)? {
            Some(_) => println!("{id} removed"),
            None => bail!("task not found: {id}"),
        },
        QueueCommand::Stats => {
            print!(
                "{}",
                report::render_queue_stats(queue.get_pending_count(), &queue.get_count_by_priority())
            );
        }
        QueueCommand::Archive => {
            let archived = queue.archive_finished()?;
            println!("archived {archived} finished task(s)");
        }
    }
    Ok(())
}
