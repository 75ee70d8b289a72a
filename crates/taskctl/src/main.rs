use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use taskctl::{
    any_failed, monitor_task, render_cleanup, render_kill_outcome, render_output,
    render_resources, render_task_status, render_task_table, Controller, LoadReport,
    MonitorError, MonitorExit, MonitorOptions, ProcResourceSampler, ResourceSampler, TaskError,
};
use tm_core::config::{
    load_config_or_default, render_config, save_config, ConfigError, HomeLayout, TaskConfig,
};
use tm_core::state::TaskStatus;
use tm_core::types::{TaskId, TaskIdError, TaskSpec};
use tm_core::validation::{Validate, ValidationLevel};
use tm_notify::sink::NotificationDispatcher;
use tm_session::backend::TmuxBackend;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "task",
    version,
    about = "Run long-running commands in detached tmux sessions and keep track of them"
)]
struct Cli {
    /// Home directory holding tasks.json, config.toml and logs/.
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,
    /// More diagnostics on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a command in a new detached session.
    Run {
        name: String,
        command: String,
        /// Informational priority, 0-10.
        #[arg(default_value_t = 0)]
        priority: u8,
        /// Unbuffered output for interpreters that honour PYTHONUNBUFFERED.
        #[arg(short, long)]
        realtime: bool,
    },
    /// Stop running tasks.
    Kill {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<String>,
        /// Kill every running task.
        #[arg(long)]
        all: bool,
        /// Terminate the session immediately instead of interrupting it.
        #[arg(short, long)]
        force: bool,
    },
    /// Follow a task's output until it finishes.
    Monitor {
        id: String,
        #[arg(short = 'n', long)]
        lines: Option<usize>,
        /// Seconds between refreshes.
        #[arg(long)]
        refresh: Option<f64>,
    },
    /// List tasks in id order.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Append a host resource summary.
        #[arg(long)]
        resources: bool,
    },
    /// Show every recorded field of one task.
    Status { id: String },
    /// Recent output from the live session, or from the log once finished.
    Output {
        id: String,
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// Tail of the task's log file.
    Logs { id: String, lines: Option<usize> },
    /// Remove finished tasks and their files.
    Cleanup {
        /// Only tasks that ended at least this many hours ago.
        #[arg(short = 't', long = "time", value_name = "HOURS", conflicts_with = "ids")]
        hours: Option<u64>,
        ids: Vec<String>,
    },
    /// Show CPU, memory, disk and GPU usage.
    Resources,
    /// Manage config.toml.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    #[command(name = "_finalize", hide = true)]
    Finalize { id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Write the default configuration.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config at {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("config file already exists at {path}; pass --force to overwrite it")]
    ConfigExists { path: PathBuf },
    #[error(transparent)]
    TaskId(#[from] TaskIdError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("failed to install Ctrl+C handler: {0}")]
    Signal(#[source] io::Error),
    #[error("failed to sample resources: {0:#}")]
    Resources(anyhow::Error),
    #[error("invalid refresh interval {0}; expected a positive number of seconds")]
    Refresh(f64),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init();
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> Result<ExitCode, MainError> {
    let layout = HomeLayout::resolve(cli.home.as_deref())?;
    layout.ensure_layout()?;

    if let Command::Config { action } = &cli.command {
        return run_config(&layout, action);
    }

    let config = load_validated_config(&layout)?;
    let backend = TmuxBackend::new(&config.session.tmux_binary, config.session.shell.clone());
    let notifier = NotificationDispatcher::from_config(&config.notify);
    let controller = Controller::new(layout, config, &backend, &notifier)
        .with_finalize_program(env::current_exe().ok());

    if let Command::Finalize { id } = &cli.command {
        controller.finalize(&TaskId::parse(id)?)?;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = controller.reconcile()?;
    if let LoadReport::Corrupt { reason, backup } = &outcome.load {
        match backup {
            Some(path) => eprintln!(
                "warning: task store was unreadable ({reason}); moved to {} and started empty",
                path.display()
            ),
            None => eprintln!("warning: task store was unreadable ({reason}); started empty"),
        }
    }
    if let Some(reason) = &outcome.skipped {
        eprintln!("warning: cannot query sessions ({reason}); task states may be stale");
    }

    match cli.command {
        Command::Run {
            name,
            command,
            priority,
            realtime,
        } => {
            let task = controller.run(TaskSpec {
                name,
                command,
                priority,
                realtime,
            })?;
            println!(
                "started task {} ({}) in session {}",
                task.id, task.name, task.session_name
            );
            println!("log: {}", task.log_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Kill { ids, all, force } => {
            let (task_ids, mut failed) = parse_ids(&ids);
            let reports = if all {
                controller.kill_all(force)?
            } else {
                controller.kill(&task_ids, force)
            };
            if all && reports.is_empty() {
                println!("no running tasks");
            }
            for report in &reports {
                match (&report.outcome, render_kill_outcome(report)) {
                    (_, Some(line)) => println!("{line}"),
                    (Err(err), None) => eprintln!("error: {err}"),
                    (Ok(_), None) => {}
                }
            }
            failed |= any_failed(&reports);
            Ok(exit_code(failed))
        }
        Command::Monitor { id, lines, refresh } => {
            let task_id = TaskId::parse(&id)?;
            let refresh_secs = refresh.unwrap_or(controller.config().monitor.refresh_secs);
            if !refresh_secs.is_finite() || refresh_secs <= 0.0 {
                return Err(MainError::Refresh(refresh_secs));
            }
            let options = MonitorOptions {
                lines: lines.unwrap_or(controller.config().monitor.lines),
                refresh: Duration::from_secs_f64(refresh_secs),
                redraw: io::stdout().is_terminal(),
            };
            let stop = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
                .map_err(MainError::Signal)?;

            let stdout = io::stdout();
            let mut out = stdout.lock();
            match monitor_task(&controller, &task_id, &options, &stop, &mut out)? {
                MonitorExit::Finished(task) => Ok(exit_code(task.status != TaskStatus::Completed)),
                MonitorExit::Interrupted => Ok(ExitCode::SUCCESS),
            }
        }
        Command::List { status, resources } => {
            let tasks = controller.list(status)?;
            print!("{}", render_task_table(&tasks, Utc::now()));
            if resources {
                let sampler = ProcResourceSampler::new(&controller.layout().root);
                match sampler.sample() {
                    Ok(snapshot) => print!("\n{}", render_resources(&snapshot)),
                    Err(err) => eprintln!("warning: resource sampling failed: {err:#}"),
                }
            }
            io::stdout().flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { id } => {
            let task = controller.status(&TaskId::parse(&id)?)?;
            print!("{}", render_task_status(&task, Utc::now()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Output { id, lines } => {
            let lines = lines.unwrap_or(controller.config().output.lines);
            let view = controller.output(&TaskId::parse(&id)?, lines)?;
            print!("{}", render_output(&view));
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs { id, lines } => {
            let lines = lines.unwrap_or(controller.config().output.log_lines);
            for line in controller.logs(&TaskId::parse(&id)?, lines)? {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup { hours, ids } => {
            let (reports, failed) = if ids.is_empty() {
                let hours = hours.unwrap_or(controller.config().cleanup.older_than_hours);
                (controller.cleanup_older_than(hours)?, false)
            } else {
                let (task_ids, failed) = parse_ids(&ids);
                (controller.cleanup_ids(&task_ids), failed)
            };
            print!("{}", render_cleanup(&reports));
            Ok(exit_code(failed || any_failed(&reports)))
        }
        Command::Resources => {
            let snapshot = ProcResourceSampler::new(&controller.layout().root)
                .sample()
                .map_err(MainError::Resources)?;
            print!("{}", render_resources(&snapshot));
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { .. } | Command::Finalize { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Parses every id, reporting the malformed ones instead of stopping at the first.
fn parse_ids(raw: &[String]) -> (Vec<TaskId>, bool) {
    let mut failed = false;
    let mut ids = Vec::with_capacity(raw.len());
    for value in raw {
        match TaskId::parse(value) {
            Ok(id) => ids.push(id),
            Err(err) => {
                eprintln!("error: {err}");
                failed = true;
            }
        }
    }
    (ids, failed)
}

fn load_validated_config(layout: &HomeLayout) -> Result<TaskConfig, MainError> {
    let config = load_config_or_default(&layout.config_file)?;
    let issues = config.validate();
    let mut errors = Vec::new();
    for issue in issues {
        match issue.level {
            ValidationLevel::Error => errors.push(issue.message),
            ValidationLevel::Warning => eprintln!("warning: {}", issue.message),
        }
    }
    if !errors.is_empty() {
        return Err(MainError::InvalidConfig {
            path: layout.config_file.clone(),
            message: errors.join("; "),
        });
    }
    Ok(config)
}

fn run_config(layout: &HomeLayout, action: &ConfigAction) -> Result<ExitCode, MainError> {
    match action {
        ConfigAction::Init { force } => {
            if layout.config_file.exists() && !force {
                return Err(MainError::ConfigExists {
                    path: layout.config_file.clone(),
                });
            }
            save_config(&layout.config_file, &TaskConfig::default())?;
            println!("wrote {}", layout.config_file.display());
        }
        ConfigAction::Show => {
            let config = load_validated_config(layout)?;
            println!("# {}", layout.config_file.display());
            print!("{}", render_config(&layout.config_file, &config)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_optional_priority_and_realtime() {
        let cli = Cli::try_parse_from(["task", "run", "train", "python train.py", "7", "-r"])
            .expect("parse");
        match cli.command {
            Command::Run {
                name,
                command,
                priority,
                realtime,
            } => {
                assert_eq!(name, "train");
                assert_eq!(command, "python train.py");
                assert_eq!(priority, 7);
                assert!(realtime);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["task", "run", "a", "true"]).expect("parse");
        assert!(matches!(cli.command, Command::Run { priority: 0, realtime: false, .. }));
    }

    #[test]
    fn kill_requires_ids_or_all_but_not_both() {
        assert!(Cli::try_parse_from(["task", "kill"]).is_err());
        assert!(Cli::try_parse_from(["task", "kill", "1", "--all"]).is_err());
        let cli = Cli::try_parse_from(["task", "kill", "--all", "--force"]).expect("parse");
        assert!(matches!(cli.command, Command::Kill { all: true, force: true, .. }));
    }

    #[test]
    fn list_status_filter_is_validated() {
        let cli = Cli::try_parse_from(["task", "list", "--status", "failed"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(TaskStatus::Failed),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["task", "list", "--status", "done"]).is_err());
    }

    #[test]
    fn global_home_and_hidden_finalize() {
        let cli = Cli::try_parse_from(["task", "_finalize", "3", "--home", "/tmp/tm", "-vv"])
            .expect("parse");
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/tm")));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Finalize { ref id } if id == "3"));
    }

    #[test]
    fn cleanup_takes_hours_or_ids() {
        let cli = Cli::try_parse_from(["task", "cleanup", "-t", "48"]).expect("parse");
        assert!(matches!(cli.command, Command::Cleanup { hours: Some(48), .. }));
        assert!(Cli::try_parse_from(["task", "cleanup", "-t", "1", "5"]).is_err());
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = HomeLayout::new(dir.path());
        run_config(&layout, &ConfigAction::Init { force: false }).expect("init");
        let err = run_config(&layout, &ConfigAction::Init { force: false })
            .expect_err("existing config");
        assert!(matches!(err, MainError::ConfigExists { .. }));
        run_config(&layout, &ConfigAction::Init { force: true }).expect("forced init");
    }
}
