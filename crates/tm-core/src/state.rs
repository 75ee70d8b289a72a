//! Task lifecycle states.
//!
//! A task moves `pending → running → {completed, failed, killed}`. The three
//! terminal states are final; a task only leaves them by being deleted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Record created, session not yet confirmed.
    Pending,
    /// Session started and believed alive.
    Running,
    /// Command exited with status 0.
    Completed,
    /// Command exited non-zero, or the session could not be started.
    Failed,
    /// Session terminated on request or vanished without an exit marker.
    Killed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Killed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
        }
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Killed
        )
    }

    /// Returns true if the task may own a live session.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Terminal status implied by a command exit code.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "killed" => Ok(TaskStatus::Killed),
            other => Err(format!(
                "invalid task status '{other}'. valid values: pending, running, completed, failed, killed"
            )),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        let decoded: TaskStatus = serde_json::from_str("\"killed\"").unwrap();
        assert_eq!(decoded, TaskStatus::Killed);
    }

    #[test]
    fn terminal_state_check() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Killed.is_terminal());
    }

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(TaskStatus::from_exit_code(0), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_exit_code(1), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_exit_code(130), TaskStatus::Failed);
    }

    #[test]
    fn parse_accepts_mixed_case_and_rejects_unknown() {
        assert_eq!("RUNNING".parse::<TaskStatus>(), Ok(TaskStatus::Running));
        assert_eq!(" failed ".parse::<TaskStatus>(), Ok(TaskStatus::Failed));
        let err = "done".parse::<TaskStatus>().expect_err("unknown status");
        assert!(err.contains("invalid task status 'done'"));
    }
}
