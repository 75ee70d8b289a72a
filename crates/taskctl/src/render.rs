//! Plain-text views printed by the CLI.

use chrono::{DateTime, Local, Utc};
use tm_core::types::{format_elapsed, TaskRecord};

use crate::controller::{CleanupOutcome, ItemReport, KillOutcome, OutputSource, OutputView};

const NAME_WIDTH: usize = 30;

fn truncate_name(name: &str) -> String {
    if name.chars().count() <= NAME_WIDTH {
        return name.to_string();
    }
    let mut short: String = name.chars().take(NAME_WIDTH - 3).collect();
    short.push_str("...");
    short
}

fn duration_cell(task: &TaskRecord, now: DateTime<Utc>) -> String {
    task.duration(now)
        .map(format_elapsed)
        .unwrap_or_else(|| "N/A".to_string())
}

fn local_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn render_task_table(tasks: &[TaskRecord], now: DateTime<Utc>) -> String {
    if tasks.is_empty() {
        return "no tasks found\n".to_string();
    }

    let mut out = format!(
        "{:<6} {:<30} {:<10} {:>8} {:>14}  {}\n",
        "ID", "Name", "Status", "Priority", "Duration", "Session"
    );
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for task in tasks {
        out.push_str(&format!(
            "{:<6} {:<30} {:<10} {:>8} {:>14}  {}\n",
            task.id.0,
            truncate_name(&task.name),
            task.status.as_str().to_uppercase(),
            task.priority,
            duration_cell(task, now),
            task.session_name
        ));
    }
    out
}

pub fn render_task_status(task: &TaskRecord, now: DateTime<Utc>) -> String {
    let rows = [
        ("ID", task.id.0.clone()),
        ("Name", task.name.clone()),
        ("Command", task.command.clone()),
        ("Status", task.status.as_str().to_uppercase()),
        ("Priority", task.priority.to_string()),
        ("Realtime", task.realtime.to_string()),
        ("Session", task.session_name.clone()),
        ("Created", local_time(Some(task.created_at))),
        ("Started", local_time(task.started_at)),
        ("Ended", local_time(task.ended_at)),
        ("Duration", duration_cell(task, now)),
        (
            "Exit code",
            task.exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("Log", task.log_path.display().to_string()),
        ("Error", task.error_message.clone().unwrap_or_else(|| "-".to_string())),
    ];
    rows.iter()
        .map(|(label, value)| format!("{:<10} {value}\n", format!("{label}:")))
        .collect()
}

pub fn render_output(view: &OutputView) -> String {
    let source = match view.source {
        OutputSource::Session => format!("session {}", view.task.session_name),
        OutputSource::Log => format!("log {}", view.task.log_path.display()),
    };
    let mut out = format!(
        "Output of task {} ({}) [{}] from {source}:\n",
        view.task.id,
        view.task.name,
        view.task.status.as_str().to_uppercase()
    );
    for line in &view.lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Line for one successful kill; failures are printed from the error itself.
pub fn render_kill_outcome(report: &ItemReport<KillOutcome>) -> Option<String> {
    let task_id = &report.task_id;
    match report.outcome.as_ref().ok()? {
        KillOutcome::Killed => Some(format!("killed task {task_id}")),
        KillOutcome::AlreadyFinished(status) => {
            Some(format!("task {task_id} already finished ({status})"))
        }
        KillOutcome::Settled(status) => {
            Some(format!("task {task_id} had already exited ({status})"))
        }
    }
}

/// Per-task lines followed by the `cleaned up X/Y task(s)` summary.
pub fn render_cleanup(reports: &[ItemReport<CleanupOutcome>]) -> String {
    let mut out = String::new();
    let mut removed = 0;
    let mut skipped = Vec::new();
    for report in reports {
        match &report.outcome {
            Ok(CleanupOutcome::Removed) => {
                removed += 1;
                out.push_str(&format!("removed task {}\n", report.task_id));
            }
            Ok(CleanupOutcome::Skipped { reason }) => {
                skipped.push(format!("  {} ({reason})\n", report.task_id));
            }
            Err(err) => out.push_str(&format!("error: {err}\n")),
        }
    }
    out.push_str(&format!("cleaned up {removed}/{} task(s)\n", reports.len()));
    if !skipped.is_empty() {
        out.push_str("skipped active tasks:\n");
        out.extend(skipped);
    }
    out
}
