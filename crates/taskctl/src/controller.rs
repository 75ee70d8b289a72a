//! Task lifecycle operations: run, kill, list, status, output, logs, cleanup.
//!
//! Every operation works from a freshly loaded store snapshot and writes back
//! through `TaskStore::update`, so nothing is cached between calls. Batch
//! operations report one outcome per task id.

use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration as StdDuration, Instant};
use tm_core::config::{HomeLayout, TaskConfig};
use tm_core::state::TaskStatus;
use tm_core::types::{TaskId, TaskIdError, TaskRecord, TaskSpec};
use tm_core::validation::{ValidationLevel, Validate};
use tm_notify::mapper::notification_for_task;
use tm_notify::sink::NotificationDispatcher;
use tm_session::backend::{SessionBackend, TerminateMode};
use tm_session::error::SessionError;
use tm_session::script::{shell_quote, shell_quote_path, LaunchSpec};

use crate::logfile;
use crate::reconcile::{reconcile, settle_from_marker};
use crate::state_machine::{transition_task, StateMachineError, StateTransition};
use crate::store::{LoadReport, StoreError, StoreSnapshot, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },
    #[error(transparent)]
    InvalidTaskId(#[from] TaskIdError),
    #[error("invalid task: {message}")]
    InvalidSpec { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error("task {task_id}: {source}")]
    Session {
        task_id: TaskId,
        #[source]
        source: SessionError,
    },
    #[error("task {task_id}: failed to access log {path}: {source}")]
    Log {
        task_id: TaskId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task {task_id} still has a live session ({session}); kill it first")]
    SessionLive { task_id: TaskId, session: String },
    #[error("task {task_id} is {status}, not running")]
    NotRunning { task_id: TaskId, status: TaskStatus },
    #[error("task {task_id} is still running after {waited_ms}ms; use --force to terminate it")]
    StillRunning { task_id: TaskId, waited_ms: u64 },
}

impl TaskError {
    fn session(task_id: &TaskId, source: SessionError) -> Self {
        TaskError::Session {
            task_id: task_id.clone(),
            source,
        }
    }

    fn log(task_id: &TaskId, path: &Path, source: std::io::Error) -> Self {
        TaskError::Log {
            task_id: task_id.clone(),
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome for one task id of a batch operation.
#[derive(Debug)]
pub struct ItemReport<T> {
    pub task_id: TaskId,
    pub outcome: Result<T, TaskError>,
}

impl<T> ItemReport<T> {
    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }
}

pub fn any_failed<T>(reports: &[ItemReport<T>]) -> bool {
    reports.iter().any(ItemReport::is_err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The session is confirmed gone and the task is now `killed`.
    Killed,
    /// The task had already reached this terminal state; nothing was done.
    AlreadyFinished(TaskStatus),
    /// The session was already gone; the task was classified from its log.
    Settled(TaskStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Session,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputView {
    pub task: TaskRecord,
    pub source: OutputSource,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub load: LoadReport,
    pub transitions: Vec<StateTransition>,
    /// Set when the pass was skipped because the backend could not be queried.
    pub skipped: Option<String>,
}

pub struct Controller<'a> {
    layout: HomeLayout,
    config: TaskConfig,
    store: TaskStore,
    backend: &'a dyn SessionBackend,
    notifier: &'a NotificationDispatcher,
    finalize_program: Option<PathBuf>,
}

impl<'a> Controller<'a> {
    pub fn new(
        layout: HomeLayout,
        config: TaskConfig,
        backend: &'a dyn SessionBackend,
        notifier: &'a NotificationDispatcher,
    ) -> Self {
        let store = TaskStore::for_layout(&layout);
        Self {
            layout,
            config,
            store,
            backend,
            notifier,
            finalize_program: None,
        }
    }

    /// Program the launch script calls back as `<program> _finalize <id>`.
    pub fn with_finalize_program(mut self, program: Option<PathBuf>) -> Self {
        self.finalize_program = program;
        self
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn pending_timeout(&self) -> Duration {
        Duration::seconds(clamp_i64(self.config.session.pending_timeout_secs, MAX_AGE_SECS))
    }

    fn reconcile_snapshot(
        &self,
        snapshot: &mut StoreSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateTransition>, SessionError> {
        let live = self.backend.list_live()?;
        Ok(reconcile(
            snapshot,
            &live,
            |task| logfile::read_exit_marker(&task.log_path, &task.session_name),
            now,
            self.pending_timeout(),
        ))
    }

    /// Repairs the persisted store against the live sessions and notifies
    /// about tasks that reached a terminal state.
    pub fn reconcile(&self) -> Result<ReconcileOutcome, TaskError> {
        let (mut snapshot, load) = self.store.load()?;
        let now = Utc::now();
        let transitions = match self.reconcile_snapshot(&mut snapshot, now) {
            Ok(transitions) => transitions,
            Err(err) => {
                tracing::warn!(error = %err, "session backend unavailable; skipping reconciliation");
                return Ok(ReconcileOutcome {
                    load,
                    transitions: Vec::new(),
                    skipped: Some(err.to_string()),
                });
            }
        };

        if !transitions.is_empty() {
            self.store.save(&snapshot)?;
            for transition in transitions.iter().filter(|t| t.is_terminal()) {
                if let Some(task) = snapshot.get(&transition.task_id) {
                    self.notify(task, now);
                }
            }
        }

        Ok(ReconcileOutcome {
            load,
            transitions,
            skipped: None,
        })
    }

    /// Reconciled view of one task that is never written back.
    pub fn peek(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let mut snapshot = self.store.snapshot()?;
        if let Err(err) = self.reconcile_snapshot(&mut snapshot, Utc::now()) {
            tracing::debug!(error = %err, "peek without reconciliation");
        }
        snapshot
            .tasks
            .remove(task_id)
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    fn notify(&self, task: &TaskRecord, now: DateTime<Utc>) {
        if let Some(message) = notification_for_task(task, now) {
            self.notifier.dispatch(&message);
        }
    }

    fn launch_spec(&self, task: &TaskRecord) -> LaunchSpec {
        let on_exit = self
            .finalize_program
            .as_ref()
            .filter(|_| self.config.session.finalize_hook)
            .map(|program| {
                format!(
                    "{} --home {} _finalize {}",
                    shell_quote_path(program),
                    shell_quote_path(&self.layout.root),
                    shell_quote(&task.id.0)
                )
            });
        LaunchSpec {
            session_name: task.session_name.clone(),
            command: task.command.clone(),
            realtime: task.realtime,
            log_path: task.log_path.clone(),
            script_path: self.layout.script_path(&task.id),
            on_exit,
            env: vec![("TASK_ID".to_string(), task.id.0.clone())],
        }
    }

    /// Records a new task, starts its session and marks it running.
    ///
    /// When the session cannot be created the task is persisted as `failed`
    /// and the session error is returned.
    pub fn run(&self, spec: TaskSpec) -> Result<TaskRecord, TaskError> {
        let errors: Vec<String> = spec
            .validate()
            .into_iter()
            .filter(|issue| issue.level == ValidationLevel::Error)
            .map(|issue| issue.message)
            .collect();
        if !errors.is_empty() {
            return Err(TaskError::InvalidSpec {
                message: errors.join("; "),
            });
        }

        let now = Utc::now();
        let task = self.store.update(|snapshot| {
            let task_id = self.store.allocate_id(snapshot)?;
            let task = TaskRecord::new(task_id.clone(), spec, self.layout.log_path(&task_id), now);
            snapshot.tasks.insert(task_id, task.clone());
            Ok::<_, TaskError>(task)
        })?;
        tracing::info!(task_id = %task.id, name = %task.name, "task created");

        if let Err(err) = logfile::write_header(&task.log_path, &task, now) {
            tracing::warn!(task_id = %task.id, error = %err, "failed to write log header");
        }

        match self.backend.create(&self.launch_spec(&task)) {
            Ok(()) => {
                let started = Utc::now();
                let record = self.store.update(|snapshot| {
                    let record = find_mut(snapshot, &task.id)?;
                    // A very short command may already have been finalized.
                    if record.status == TaskStatus::Pending {
                        transition_task(record, TaskStatus::Running, started)?;
                    }
                    Ok::<_, TaskError>(record.clone())
                })?;
                tracing::info!(task_id = %record.id, session = %record.session_name, "task started");
                Ok(record)
            }
            Err(source) => {
                let failed_at = Utc::now();
                let message = source.to_string();
                let record = self.store.update(|snapshot| {
                    let record = find_mut(snapshot, &task.id)?;
                    if record.status == TaskStatus::Pending {
                        transition_task(record, TaskStatus::Failed, failed_at)?;
                        record.error_message = Some(message);
                    }
                    Ok::<_, TaskError>(record.clone())
                })?;
                tracing::warn!(task_id = %record.id, error = %source, "failed to start task session");
                self.notify(&record, failed_at);
                Err(TaskError::session(&record.id, source))
            }
        }
    }

    pub fn kill(&self, task_ids: &[TaskId], force: bool) -> Vec<ItemReport<KillOutcome>> {
        task_ids
            .iter()
            .map(|task_id| ItemReport {
                task_id: task_id.clone(),
                outcome: self.kill_one(task_id, force),
            })
            .collect()
    }

    /// Kills every task that is currently running.
    pub fn kill_all(&self, force: bool) -> Result<Vec<ItemReport<KillOutcome>>, TaskError> {
        let running: Vec<TaskId> = self
            .store
            .snapshot()?
            .sorted()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Running)
            .map(|task| task.id.clone())
            .collect();
        Ok(self.kill(&running, force))
    }

    fn kill_one(&self, task_id: &TaskId, force: bool) -> Result<KillOutcome, TaskError> {
        let task = self.status(task_id)?;
        match task.status {
            status if status.is_terminal() => return Ok(KillOutcome::AlreadyFinished(status)),
            TaskStatus::Pending => {
                return Err(TaskError::NotRunning {
                    task_id: task_id.clone(),
                    status: TaskStatus::Pending,
                })
            }
            _ => {}
        }

        let session = task.session_name.as_str();
        let alive = self
            .backend
            .exists(session)
            .map_err(|source| TaskError::session(task_id, source))?;
        if !alive {
            return self.settle(task_id).map(KillOutcome::Settled);
        }

        let mode = if force {
            TerminateMode::Forced
        } else {
            TerminateMode::Graceful
        };
        match self.backend.terminate(session, mode) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return self.settle(task_id).map(KillOutcome::Settled);
            }
            Err(source) => return Err(TaskError::session(task_id, source)),
        }

        let started = Instant::now();
        if !self.wait_until_gone(task_id, session)? {
            return Err(TaskError::StillRunning {
                task_id: task_id.clone(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        self.mark_killed(task_id, mode)
    }

    /// Polls until the session is gone or the grace window is used up.
    fn wait_until_gone(&self, task_id: &TaskId, session: &str) -> Result<bool, TaskError> {
        let grace = StdDuration::from_millis(self.config.session.kill_grace_ms);
        let poll = StdDuration::from_millis(self.config.session.kill_poll_ms.max(1));
        let started = Instant::now();
        loop {
            let alive = self
                .backend
                .exists(session)
                .map_err(|source| TaskError::session(task_id, source))?;
            if !alive {
                return Ok(true);
            }
            if started.elapsed() >= grace {
                return Ok(false);
            }
            thread::sleep(poll);
        }
    }

    fn mark_killed(&self, task_id: &TaskId, mode: TerminateMode) -> Result<KillOutcome, TaskError> {
        let now = Utc::now();
        let (outcome, record) = self.store.update(|snapshot| {
            let record = find_mut(snapshot, task_id)?;
            if record.status.is_terminal() {
                return Ok::<_, TaskError>((KillOutcome::AlreadyFinished(record.status), None));
            }
            if record.status == TaskStatus::Pending {
                let created_at = record.created_at;
                transition_task(record, TaskStatus::Running, created_at)?;
            }
            transition_task(record, TaskStatus::Killed, now)?;
            record.exit_code =
                logfile::read_exit_marker(&record.log_path, &record.session_name).map(|m| m.code);
            record.error_message = Some(match mode {
                TerminateMode::Graceful => "killed by operator".to_string(),
                TerminateMode::Forced => "force-killed by operator".to_string(),
            });
            Ok((KillOutcome::Killed, Some(record.clone())))
        })?;
        if let Some(record) = record {
            tracing::info!(task_id = %record.id, ?mode, "task killed");
            self.notify(&record, now);
        }
        Ok(outcome)
    }

    /// Classifies an active task whose session is gone from its log.
    fn settle(&self, task_id: &TaskId) -> Result<TaskStatus, TaskError> {
        let now = Utc::now();
        let (status, record) = self.store.update(|snapshot| {
            let record = find_mut(snapshot, task_id)?;
            if record.status.is_terminal() {
                return Ok::<_, TaskError>((record.status, None));
            }
            if record.status == TaskStatus::Pending {
                let created_at = record.created_at;
                transition_task(record, TaskStatus::Running, created_at)?;
            }
            let marker = logfile::read_exit_marker(&record.log_path, &record.session_name);
            settle_from_marker(record, marker, now)?;
            Ok((record.status, Some(record.clone())))
        })?;
        if let Some(record) = record {
            self.notify(&record, now);
        }
        Ok(status)
    }

    /// Tasks in ascending id order, optionally restricted to one status.
    pub fn list(&self, filter: Option<TaskStatus>) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self
            .store
            .snapshot()?
            .sorted()
            .into_iter()
            .filter(|task| filter.map_or(true, |status| task.status == status))
            .cloned()
            .collect())
    }

    pub fn status(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.store
            .snapshot()?
            .tasks
            .remove(task_id)
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    /// Last `lines` lines of a task's output: the live pane while running,
    /// the log file otherwise.
    pub fn output(&self, task_id: &TaskId, lines: usize) -> Result<OutputView, TaskError> {
        let task = self.status(task_id)?;
        self.output_for(task, lines)
    }

    pub fn output_for(&self, task: TaskRecord, lines: usize) -> Result<OutputView, TaskError> {
        if task.status == TaskStatus::Running {
            let captured = self
                .backend
                .capture(&task.session_name, lines)
                .map_err(|source| TaskError::session(&task.id, source))?;
            return Ok(OutputView {
                task,
                source: OutputSource::Session,
                lines: captured,
            });
        }

        let tail = logfile::read_tail(&task.log_path, lines)
            .map_err(|source| TaskError::log(&task.id, &task.log_path, source))?;
        Ok(OutputView {
            task,
            source: OutputSource::Log,
            lines: tail,
        })
    }

    /// Last `lines` lines of the task's log file, whatever its status.
    pub fn logs(&self, task_id: &TaskId, lines: usize) -> Result<Vec<String>, TaskError> {
        let task = self.status(task_id)?;
        logfile::read_tail(&task.log_path, lines)
            .map_err(|source| TaskError::log(&task.id, &task.log_path, source))
    }

    /// Removes the named tasks. A task whose session is still live is refused.
    pub fn cleanup_ids(&self, task_ids: &[TaskId]) -> Vec<ItemReport<CleanupOutcome>> {
        task_ids
            .iter()
            .map(|task_id| ItemReport {
                task_id: task_id.clone(),
                outcome: self.cleanup_one(task_id),
            })
            .collect()
    }

    fn cleanup_one(&self, task_id: &TaskId) -> Result<CleanupOutcome, TaskError> {
        let task = self.status(task_id)?;
        if !task.is_terminal() {
            let alive = self
                .backend
                .exists(&task.session_name)
                .map_err(|source| TaskError::session(task_id, source))?;
            if alive {
                return Err(TaskError::SessionLive {
                    task_id: task_id.clone(),
                    session: task.session_name,
                });
            }
        }
        self.remove_task(&task)?;
        Ok(CleanupOutcome::Removed)
    }

    /// Removes terminal tasks that ended at least `hours` ago. Active tasks
    /// are reported as skipped and left alone.
    pub fn cleanup_older_than(
        &self,
        hours: u64,
    ) -> Result<Vec<ItemReport<CleanupOutcome>>, TaskError> {
        let now = Utc::now();
        let cutoff = now - Duration::hours(clamp_i64(hours, MAX_AGE_SECS / 3_600));
        let snapshot = self.store.snapshot()?;

        let mut reports = Vec::new();
        for task in snapshot.sorted() {
            if task.status.is_active() {
                reports.push(ItemReport {
                    task_id: task.id.clone(),
                    outcome: Ok(CleanupOutcome::Skipped {
                        reason: format!("task is {}", task.status),
                    }),
                });
                continue;
            }
            let ended = task.ended_at.unwrap_or(task.created_at);
            if ended > cutoff {
                continue;
            }
            reports.push(ItemReport {
                task_id: task.id.clone(),
                outcome: self.remove_task(task).map(|()| CleanupOutcome::Removed),
            });
        }
        Ok(reports)
    }

    /// Files go first; the record is only dropped once nothing is left behind.
    fn remove_task(&self, task: &TaskRecord) -> Result<(), TaskError> {
        for path in [task.log_path.clone(), self.layout.script_path(&task.id)] {
            logfile::remove_if_present(&path)
                .map_err(|source| TaskError::log(&task.id, &path, source))?;
        }
        self.store.update(|snapshot| {
            snapshot.tasks.remove(&task.id);
            Ok::<_, TaskError>(())
        })?;
        tracing::info!(task_id = %task.id, "task removed");
        Ok(())
    }

    /// Called by the launch script once the command has exited: settles the
    /// task from its exit marker right away. A no-op when the task is already
    /// terminal or the marker is not there.
    pub fn finalize(&self, task_id: &TaskId) -> Result<Option<StateTransition>, TaskError> {
        let task = self.status(task_id)?;
        if !task.status.is_active() {
            return Ok(None);
        }
        let Some(marker) = logfile::read_exit_marker(&task.log_path, &task.session_name) else {
            return Ok(None);
        };

        let now = Utc::now();
        let settled = self.store.update(|snapshot| {
            let record = find_mut(snapshot, task_id)?;
            if !record.status.is_active() {
                return Ok::<_, TaskError>(None);
            }
            if record.status == TaskStatus::Pending {
                let created_at = record.created_at;
                transition_task(record, TaskStatus::Running, created_at)?;
            }
            let transition = settle_from_marker(record, Some(marker), now)?;
            Ok(Some((transition, record.clone())))
        })?;

        Ok(settled.map(|(transition, record)| {
            tracing::info!(task_id = %record.id, status = %record.status, "task finalized");
            self.notify(&record, now);
            transition
        }))
    }
}

/// Upper bound for configured ages; keeps chrono durations in range.
const MAX_AGE_SECS: i64 = 100 * 365 * 24 * 3_600;

fn clamp_i64(value: u64, max: i64) -> i64 {
    i64::try_from(value).map_or(max, |value| value.min(max))
}

fn find_mut<'s>(
    snapshot: &'s mut StoreSnapshot,
    task_id: &TaskId,
) -> Result<&'s mut TaskRecord, TaskError> {
    snapshot
        .get_mut(task_id)
        .ok_or_else(|| TaskError::TaskNotFound {
            task_id: task_id.clone(),
        })
}
