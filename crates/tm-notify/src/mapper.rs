//! Map terminal task records to notifications.

use chrono::{DateTime, Utc};
use tm_core::state::TaskStatus;
use tm_core::types::{format_elapsed, TaskRecord};

use crate::types::{NotificationMessage, NotificationSeverity, NotificationTopic};

/// Builds the notification for a task that just reached a terminal state.
/// Returns `None` while the task is still pending or running.
pub fn notification_for_task(task: &TaskRecord, now: DateTime<Utc>) -> Option<NotificationMessage> {
    let (topic, severity, verb) = match task.status {
        TaskStatus::Completed => (
            NotificationTopic::TaskCompleted,
            NotificationSeverity::Info,
            "completed",
        ),
        TaskStatus::Failed => (
            NotificationTopic::TaskFailed,
            NotificationSeverity::Error,
            "failed",
        ),
        TaskStatus::Killed => (
            NotificationTopic::TaskKilled,
            NotificationSeverity::Warning,
            "was killed",
        ),
        TaskStatus::Pending | TaskStatus::Running => return None,
    };

    let duration = task
        .duration(now)
        .map(format_elapsed)
        .unwrap_or_else(|| "N/A".to_string());
    let exit_code = task
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let mut body = format!(
        "name: {}\ncommand: {}\nduration: {duration}\nexit code: {exit_code}\nlog: {}",
        task.name,
        task.command,
        task.log_path.display()
    );
    if let Some(reason) = &task.error_message {
        body.push_str(&format!("\nreason: {reason}"));
    }

    Some(NotificationMessage {
        at: now,
        topic,
        severity,
        title: format!("Task {} ({}) {verb}", task.id, task.name),
        body,
        task_id: Some(task.id.clone()),
        task_name: Some(task.name.clone()),
        status: Some(task.status),
        exit_code: task.exit_code,
    })
}
