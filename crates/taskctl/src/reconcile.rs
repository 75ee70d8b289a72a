//! Brings recorded task state in line with the sessions that actually exist.
//!
//! Rules for one pass, given the set of live session names:
//!
//! - `running` with a live session: unchanged.
//! - `running` without a session: classified by the log's exit marker
//!   (exit 0 = completed, non-zero = failed, no marker = killed).
//! - `pending` with a live session: running (the creating invocation died
//!   before recording success).
//! - `pending` without a session, older than the pending timeout: failed.
//! - terminal: unchanged.
//!
//! A session that vanished without a marker is reported as killed. The true
//! cause (operator kill, crash, reboot) cannot be recovered; `killed` is the
//! classification for "did not reach its normal exit path".

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tm_core::state::TaskStatus;
use tm_core::types::TaskRecord;
use tm_session::script::ExitMarker;

use crate::state_machine::{transition_task, StateMachineError, StateTransition};
use crate::store::StoreSnapshot;

pub const NEVER_STARTED: &str = "session was never started";
pub const VANISHED: &str = "session ended without an exit status";

/// Settles a running task whose command has exited (or whose session is gone)
/// from what its log says.
pub fn settle_from_marker(
    task: &mut TaskRecord,
    marker: Option<ExitMarker>,
    now: DateTime<Utc>,
) -> Result<StateTransition, StateMachineError> {
    match marker {
        Some(marker) => {
            let to = TaskStatus::from_exit_code(marker.code);
            let at = marker
                .at
                .filter(|at| task.started_at.map_or(true, |started| *at >= started))
                .unwrap_or(now);
            let transition = transition_task(task, to, at)?;
            task.exit_code = Some(marker.code);
            if to == TaskStatus::Failed {
                task.error_message = Some(format!("exited with code {}", marker.code));
            }
            Ok(transition)
        }
        None => {
            let transition = transition_task(task, TaskStatus::Killed, now)?;
            task.error_message = Some(VANISHED.to_string());
            Ok(transition)
        }
    }
}

/// One reconciliation pass over `snapshot`. Idempotent: a second pass over
/// the result with the same inputs returns no transitions.
pub fn reconcile(
    snapshot: &mut StoreSnapshot,
    live: &BTreeSet<String>,
    marker_for: impl Fn(&TaskRecord) -> Option<ExitMarker>,
    now: DateTime<Utc>,
    pending_timeout: Duration,
) -> Vec<StateTransition> {
    let mut transitions = Vec::new();
    for task in snapshot.tasks.values_mut() {
        let alive = live.contains(&task.session_name);
        let result = match task.status {
            TaskStatus::Running if !alive => {
                let marker = marker_for(task);
                settle_from_marker(task, marker, now).map(Some)
            }
            TaskStatus::Pending if alive => {
                transition_task(task, TaskStatus::Running, now).map(Some)
            }
            TaskStatus::Pending if now - task.created_at >= pending_timeout => {
                let result = transition_task(task, TaskStatus::Failed, now);
                task.error_message = Some(NEVER_STARTED.to_string());
                result.map(Some)
            }
            _ => Ok(None),
        };

        match result {
            Ok(Some(transition)) => {
                tracing::info!(
                    task_id = %transition.task_id,
                    from = %transition.from,
                    to = %transition.to,
                    "reconciled task status"
                );
                transitions.push(transition);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "skipping task during reconciliation"),
        }
    }
    transitions
}
