use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tm_core::config::NotifySinkName;
use tm_core::state::TaskStatus;
use tm_core::types::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTopic {
    TaskCompleted,
    TaskFailed,
    TaskKilled,
}

impl NotificationTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationTopic::TaskCompleted => "task_completed",
            NotificationTopic::TaskFailed => "task_failed",
            NotificationTopic::TaskKilled => "task_killed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub at: DateTime<Utc>,
    pub topic: NotificationTopic,
    pub severity: NotificationSeverity,
    pub title: String,
    pub body: String,
    pub task_id: Option<TaskId>,
    pub task_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSinkKind {
    Stdout,
    Command,
    Webhook,
}

impl From<NotifySinkName> for NotificationSinkKind {
    fn from(name: NotifySinkName) -> Self {
        match name {
            NotifySinkName::Stdout => NotificationSinkKind::Stdout,
            NotifySinkName::Command => NotificationSinkKind::Command,
            NotifySinkName::Webhook => NotificationSinkKind::Webhook,
        }
    }
}
