//! Core types for the task manager.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::TaskStatus;

/// Number of digits in a rendered task id.
pub const TASK_ID_WIDTH: usize = 5;

/// Highest accepted priority value.
pub const MAX_PRIORITY: u8 = 10;

/// Prefix of every backend session owned by this tool.
pub const SESSION_PREFIX: &str = "task_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskIdError {
    #[error("invalid task id '{value}': expected a number such as 7 or 00007")]
    NotNumeric { value: String },
    #[error("invalid task id '{value}': ids start at 1")]
    Zero { value: String },
}

/// Fixed-width numeric task identifier, e.g. `00042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn from_number(number: u64) -> Self {
        Self(format!("{number:0width$}", width = TASK_ID_WIDTH))
    }

    /// Normalizes user input: `7`, `007` and `00007` all name the same task.
    pub fn parse(value: &str) -> Result<Self, TaskIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(TaskIdError::NotNumeric {
                value: value.to_string(),
            });
        }
        let number = trimmed
            .parse::<u64>()
            .map_err(|_| TaskIdError::NotNumeric {
                value: value.to_string(),
            })?;
        if number == 0 {
            return Err(TaskIdError::Zero {
                value: value.to_string(),
            });
        }
        Ok(Self::from_number(number))
    }

    pub fn number(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Backend session name derived from the id.
    pub fn session_name(&self) -> String {
        format!("{SESSION_PREFIX}{}", self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// What the operator asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub realtime: bool,
}

/// Durable per-task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub command: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub session_name: String,
    #[serde(default)]
    pub realtime: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskRecord {
    pub fn new(id: TaskId, spec: TaskSpec, log_path: PathBuf, created_at: DateTime<Utc>) -> Self {
        let session_name = id.session_name();
        Self {
            id,
            name: spec.name,
            command: spec.command,
            priority: spec.priority,
            status: TaskStatus::Pending,
            session_name,
            realtime: spec.realtime,
            created_at,
            started_at: None,
            ended_at: None,
            exit_code: None,
            log_path,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and end, or start and `now` while still running.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        Some((end - started).max(Duration::zero()))
    }
}

/// Renders an elapsed time as `HH:MM:SS`, prefixed with `Nd ` past one day.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
