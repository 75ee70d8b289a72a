//! Live view of one task's output until it finishes or the operator stops it.
//!
//! On a terminal the screen is redrawn in place whenever the frame changes.
//! Otherwise only lines not printed before are appended, so the stream can be
//! piped or redirected.

use chrono::Utc;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tm_core::state::TaskStatus;
use tm_core::types::{format_elapsed, TaskId, TaskRecord};

use crate::controller::{Controller, TaskError};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("failed to write monitor output: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorOptions {
    pub lines: usize,
    pub refresh: Duration,
    /// Redraw the whole screen instead of appending new lines.
    pub redraw: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Finished(TaskRecord),
    Interrupted,
}

pub fn monitor_task<W: Write>(
    controller: &Controller<'_>,
    task_id: &TaskId,
    options: &MonitorOptions,
    stop: &AtomicBool,
    out: &mut W,
) -> Result<MonitorExit, MonitorError> {
    let mut printed: Vec<String> = Vec::new();
    let mut last_frame: Option<String> = None;
    let mut last_status: Option<TaskStatus> = None;

    loop {
        if stop.load(Ordering::SeqCst) {
            writeln!(out, "\nStopped monitoring task {task_id}; the task keeps running.")?;
            return Ok(MonitorExit::Interrupted);
        }

        let task = controller.peek(task_id)?;
        let lines = match controller.output_for(task.clone(), options.lines) {
            Ok(view) => view.lines,
            // The session ended between the status check and the capture.
            Err(TaskError::Session { source, .. }) if source.is_not_found() => printed.clone(),
            Err(err) => return Err(err.into()),
        };

        if options.redraw {
            let frame = render_frame(&task, &lines);
            if last_frame.as_deref() != Some(frame.as_str()) {
                execute!(out, Clear(ClearType::All), MoveTo(0, 0))?;
                out.write_all(frame.as_bytes())?;
                out.flush()?;
                last_frame = Some(frame);
            }
        } else {
            if last_status != Some(task.status) {
                writeln!(out, "{}", header(&task))?;
                last_status = Some(task.status);
            }
            for line in new_lines(&printed, &lines) {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        printed = lines;

        if task.is_terminal() {
            writeln!(out, "{}", finished_line(&task))?;
            return Ok(MonitorExit::Finished(task));
        }

        sleep_unless_stopped(options.refresh, stop);
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn header(task: &TaskRecord) -> String {
    let elapsed = task
        .duration(Utc::now())
        .map(format_elapsed)
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "Monitoring task {} ({}) | status: {} | elapsed: {} | Ctrl+C to stop",
        task.id,
        task.name,
        task.status.as_str().to_uppercase(),
        elapsed
    )
}

fn render_frame(task: &TaskRecord, lines: &[String]) -> String {
    let mut frame = header(task);
    frame.push('\n');
    frame.push_str(&"-".repeat(80));
    frame.push('\n');
    for line in lines {
        frame.push_str(line);
        frame.push('\n');
    }
    frame
}

fn finished_line(task: &TaskRecord) -> String {
    match task.exit_code {
        Some(code) => format!("Task {} finished: {} (exit code {code})", task.id, task.status),
        None => format!("Task {} finished: {}", task.id, task.status),
    }
}

/// Lines of `current` not already shown in `previous`.
///
/// The captured window scrolls, so the longest suffix of `previous` that is
/// also a prefix of `current` is treated as already printed.
pub fn new_lines<'c>(previous: &[String], current: &'c [String]) -> &'c [String] {
    let max = previous.len().min(current.len());
    let overlap = (0..=max)
        .rev()
        .find(|&k| previous[previous.len() - k..] == current[..k])
        .unwrap_or(0);
    &current[overlap..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_core::config::{HomeLayout, TaskConfig};
    use tm_core::types::TaskSpec;
    use tm_notify::sink::NotificationDispatcher;
    use tm_session::backend::SessionBackend;
    use tm_session::memory::MemoryBackend;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn options(redraw: bool) -> MonitorOptions {
        MonitorOptions {
            lines: 20,
            refresh: Duration::from_millis(10),
            redraw,
        }
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            command: "python train.py".to_string(),
            priority: 0,
            realtime: true,
        }
    }

    #[test]
    fn new_lines_skips_overlap_with_previous_window() {
        let previous = strings(&["a", "b", "c"]);
        assert_eq!(new_lines(&previous, &strings(&["b", "c", "d"])), strings(&["d"]));
        assert_eq!(new_lines(&previous, &strings(&["a", "b", "c"])), Vec::<String>::new());
        assert_eq!(new_lines(&[], &strings(&["x"])), strings(&["x"]));
        assert_eq!(new_lines(&previous, &strings(&["x", "y"])), strings(&["x", "y"]));
        assert_eq!(
            new_lines(&strings(&["a", "a"]), &strings(&["a", "a", "b"])),
            strings(&["b"])
        );
    }

    #[test]
    fn monitor_returns_when_task_has_finished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = HomeLayout::new(dir.path());
        layout.ensure_layout().expect("layout");
        let backend = MemoryBackend::new();
        let notifier = NotificationDispatcher::disabled();
        let controller = Controller::new(layout, TaskConfig::default(), &backend, &notifier);

        let task = controller.run(spec("train")).expect("run");
        backend.finish(&task.session_name, 0).expect("finish");

        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        let exit = monitor_task(&controller, &task.id, &options(false), &stop, &mut out)
            .expect("monitor");

        let MonitorExit::Finished(done) = exit else {
            panic!("expected finished task");
        };
        assert_eq!(done.status, TaskStatus::Completed);
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("Monitoring task 00001 (train) | status: COMPLETED"));
        assert!(text.contains("Task started: train"));
        assert!(text.ends_with("Task 00001 finished: completed (exit code 0)\n"));
    }

    #[test]
    fn monitor_stops_on_interrupt_without_touching_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = HomeLayout::new(dir.path());
        layout.ensure_layout().expect("layout");
        let backend = MemoryBackend::new();
        let notifier = NotificationDispatcher::disabled();
        let controller = Controller::new(layout, TaskConfig::default(), &backend, &notifier);
        let task = controller.run(spec("train")).expect("run");

        let stop = AtomicBool::new(true);
        let mut out = Vec::new();
        let exit = monitor_task(&controller, &task.id, &options(false), &stop, &mut out)
            .expect("monitor");
        assert_eq!(exit, MonitorExit::Interrupted);
        assert_eq!(
            controller.status(&task.id).expect("status").status,
            TaskStatus::Running
        );
        assert!(backend.exists(&task.session_name).expect("exists"));
    }

    #[test]
    fn redraw_mode_clears_screen_and_shows_pane() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = HomeLayout::new(dir.path());
        layout.ensure_layout().expect("layout");
        let backend = MemoryBackend::new();
        let notifier = NotificationDispatcher::disabled();
        let controller = Controller::new(layout, TaskConfig::default(), &backend, &notifier);
        let task = controller.run(spec("train")).expect("run");
        backend.push_output(&task.session_name, "epoch 1/3");
        backend
            .write_exit_marker(&task.session_name, 2)
            .expect("marker");
        controller.finalize(&task.id).expect("finalize");

        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        monitor_task(&controller, &task.id, &options(true), &stop, &mut out).expect("monitor");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("\u{1b}[2J"));
        assert!(text.contains("status: FAILED"));
        assert!(text.contains("finished: failed (exit code 2)"));
    }

    #[test]
    fn monitor_of_unknown_task_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = HomeLayout::new(dir.path());
        let backend = MemoryBackend::new();
        let notifier = NotificationDispatcher::disabled();
        let controller = Controller::new(layout, TaskConfig::default(), &backend, &notifier);

        let stop = AtomicBool::new(false);
        let err = monitor_task(
            &controller,
            &TaskId::from_number(3),
            &options(false),
            &stop,
            &mut Vec::new(),
        )
        .expect_err("unknown task");
        assert!(matches!(
            err,
            MonitorError::Task(TaskError::TaskNotFound { .. })
        ));
    }
}
