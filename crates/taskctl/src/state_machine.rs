//! Task status transitions.

use chrono::{DateTime, Utc};
use tm_core::state::TaskStatus;
use tm_core::types::{TaskId, TaskRecord};

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Moves `task` to `to`, maintaining the lifecycle timestamps.
///
/// `started_at` is set on entering `running`; `ended_at` is set exactly when
/// the new status is terminal.
pub fn transition_task(
    task: &mut TaskRecord,
    to: TaskStatus,
    at: DateTime<Utc>,
) -> Result<StateTransition, StateMachineError> {
    let from = task.status;
    if !is_transition_allowed(from, to) {
        return Err(StateMachineError::InvalidTransition {
            task_id: task.id.clone(),
            from,
            to,
        });
    }

    task.status = to;
    match to {
        TaskStatus::Running => {
            task.started_at.get_or_insert(at);
        }
        status if status.is_terminal() => {
            task.ended_at = Some(at);
        }
        _ => {}
    }

    Ok(StateTransition {
        task_id: task.id.clone(),
        from,
        to,
        at,
    })
}

/// ```text
/// pending -> running -> {completed, failed, killed}
///    \-> failed
/// ```
/// Terminal states are final and self-transitions are rejected.
pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Killed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tm_core::types::TaskSpec;

    fn mk_task(status: TaskStatus) -> TaskRecord {
        let mut task = TaskRecord::new(
            TaskId::from_number(1),
            TaskSpec {
                name: "job".to_string(),
                command: "true".to_string(),
                priority: 0,
                realtime: false,
            },
            PathBuf::from("/tmp/logs/00001.log"),
            Utc::now(),
        );
        task.status = status;
        task
    }

    #[test]
    fn allows_normal_flow_transitions() {
        assert!(is_transition_allowed(TaskStatus::Pending, TaskStatus::Running));
        assert!(is_transition_allowed(TaskStatus::Pending, TaskStatus::Failed));
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Killed] {
            assert!(is_transition_allowed(TaskStatus::Running, terminal));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Killed] {
            for to in TaskStatus::ALL {
                assert!(!is_transition_allowed(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn rejects_backwards_and_self_transitions() {
        assert!(!is_transition_allowed(TaskStatus::Running, TaskStatus::Pending));
        assert!(!is_transition_allowed(TaskStatus::Running, TaskStatus::Running));
        assert!(!is_transition_allowed(TaskStatus::Pending, TaskStatus::Completed));
        assert!(!is_transition_allowed(TaskStatus::Pending, TaskStatus::Killed));
    }

    #[test]
    fn transition_maintains_timestamps() {
        let mut task = mk_task(TaskStatus::Pending);
        let start = Utc::now();
        transition_task(&mut task, TaskStatus::Running, start).expect("start");
        assert_eq!(task.started_at, Some(start));
        assert!(task.ended_at.is_none());

        let end = start + chrono::Duration::seconds(5);
        let transition = transition_task(&mut task, TaskStatus::Completed, end).expect("finish");
        assert_eq!(task.started_at, Some(start));
        assert_eq!(task.ended_at, Some(end));
        assert_eq!(transition.from, TaskStatus::Running);
        assert!(transition.is_terminal());
    }

    #[test]
    fn failed_start_sets_end_without_start() {
        let mut task = mk_task(TaskStatus::Pending);
        transition_task(&mut task, TaskStatus::Failed, Utc::now()).expect("fail");
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn invalid_transition_leaves_task_untouched() {
        let mut task = mk_task(TaskStatus::Completed);
        let before = task.clone();
        let err = transition_task(&mut task, TaskStatus::Running, Utc::now())
            .expect_err("terminal task cannot restart");
        assert_eq!(
            err.to_string(),
            "invalid status transition for task 00001: completed -> running"
        );
        assert_eq!(task, before);
    }
}
