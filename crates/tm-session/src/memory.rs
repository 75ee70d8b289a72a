//! In-process session backend.
//!
//! Sessions are plain map entries; nothing is executed. Tests drive the
//! lifecycle from outside (`finish`, `vanish`, `push_output`) the same way an
//! operator or the command itself would affect a real tmux session.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::backend::{SessionBackend, TerminateMode};
use crate::error::SessionError;
use crate::script::{format_exit_marker, LaunchSpec};

#[derive(Debug, Clone, Default)]
struct MemorySession {
    spec: Option<LaunchSpec>,
    output: Vec<String>,
    ignore_interrupt: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<String, MemorySession>,
    unavailable: bool,
    fail_next_create: Option<SessionError>,
    created: Vec<LaunchSpec>,
    terminations: Vec<(String, TerminateMode)>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent call fail as if the tmux binary were missing.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// The next `create` fails with `err` instead of starting a session.
    pub fn fail_next_create(&self, err: SessionError) {
        self.lock().fail_next_create = Some(err);
    }

    /// Registers a live session that was not started through `create`.
    pub fn insert_live(&self, session: &str) {
        self.lock()
            .sessions
            .insert(session.to_string(), MemorySession::default());
    }

    /// Graceful termination requests are swallowed for `session`.
    pub fn set_ignore_interrupt(&self, session: &str, ignore: bool) {
        if let Some(entry) = self.lock().sessions.get_mut(session) {
            entry.ignore_interrupt = ignore;
        }
    }

    pub fn push_output(&self, session: &str, line: impl Into<String>) {
        if let Some(entry) = self.lock().sessions.get_mut(session) {
            entry.output.push(line.into());
        }
    }

    /// Appends an exit marker to the session's log without ending the session.
    pub fn write_exit_marker(&self, session: &str, code: i32) -> io::Result<()> {
        let spec = self
            .lock()
            .sessions
            .get(session)
            .and_then(|entry| entry.spec.clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no launch spec for {session}"))
            })?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        writeln!(log, "{}", format_exit_marker(session, code, Utc::now()))
    }

    /// The command exits with `code`: marker written, session gone.
    pub fn finish(&self, session: &str, code: i32) -> io::Result<()> {
        self.write_exit_marker(session, code)?;
        self.vanish(session);
        Ok(())
    }

    /// The session disappears without its command reaching the exit path.
    pub fn vanish(&self, session: &str) {
        self.lock().sessions.remove(session);
    }

    pub fn created(&self) -> Vec<LaunchSpec> {
        self.lock().created.clone()
    }

    pub fn terminations(&self) -> Vec<(String, TerminateMode)> {
        self.lock().terminations.clone()
    }

    fn check_available(state: &MemoryState, command: &str) -> Result<(), SessionError> {
        if state.unavailable {
            return Err(SessionError::Unavailable {
                command: format!("memory {command}"),
                source: io::Error::new(io::ErrorKind::NotFound, "backend marked unavailable"),
            });
        }
        Ok(())
    }
}

impl SessionBackend for MemoryBackend {
    fn create(&self, spec: &LaunchSpec) -> Result<(), SessionError> {
        let mut state = self.lock();
        Self::check_available(&state, "create")?;
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        if state.sessions.contains_key(&spec.session_name) {
            return Err(SessionError::AlreadyExists {
                session: spec.session_name.clone(),
            });
        }
        state.sessions.insert(
            spec.session_name.clone(),
            MemorySession {
                spec: Some(spec.clone()),
                ..MemorySession::default()
            },
        );
        state.created.push(spec.clone());
        Ok(())
    }

    fn exists(&self, session: &str) -> Result<bool, SessionError> {
        let state = self.lock();
        Self::check_available(&state, "exists")?;
        Ok(state.sessions.contains_key(session))
    }

    fn capture(&self, session: &str, lines: usize) -> Result<Vec<String>, SessionError> {
        let state = self.lock();
        Self::check_available(&state, "capture")?;
        let entry = state
            .sessions
            .get(session)
            .ok_or_else(|| SessionError::NotFound {
                session: session.to_string(),
            })?;
        let skip = if lines == 0 {
            0
        } else {
            entry.output.len().saturating_sub(lines)
        };
        Ok(entry.output[skip..].to_vec())
    }

    fn terminate(&self, session: &str, mode: TerminateMode) -> Result<(), SessionError> {
        let mut state = self.lock();
        Self::check_available(&state, "terminate")?;
        let ignore_interrupt = state
            .sessions
            .get(session)
            .map(|entry| entry.ignore_interrupt)
            .ok_or_else(|| SessionError::NotFound {
                session: session.to_string(),
            })?;
        state.terminations.push((session.to_string(), mode));
        if mode == TerminateMode::Forced || !ignore_interrupt {
            state.sessions.remove(session);
        }
        Ok(())
    }

    fn list_live(&self) -> Result<BTreeSet<String>, SessionError> {
        let state = self.lock();
        Self::check_available(&state, "list_live")?;
        Ok(state.sessions.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::find_exit_marker;
    use std::path::Path;

    fn spec(dir: &Path, session: &str) -> LaunchSpec {
        LaunchSpec {
            session_name: session.to_string(),
            command: "sleep 100".to_string(),
            realtime: false,
            log_path: dir.join(format!("{session}.log")),
            script_path: dir.join(format!("{session}.sh")),
            on_exit: None,
            env: Vec::new(),
        }
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = MemoryBackend::new();
        backend.create(&spec(dir.path(), "task_00001")).expect("create");
        let err = backend
            .create(&spec(dir.path(), "task_00001"))
            .expect_err("duplicate");
        assert!(matches!(err, SessionError::AlreadyExists { .. }));
        assert_eq!(backend.created().len(), 1);
    }

    #[test]
    fn capture_returns_most_recent_lines_last() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = MemoryBackend::new();
        backend.create(&spec(dir.path(), "task_00001")).expect("create");
        for line in ["a", "b", "c"] {
            backend.push_output("task_00001", line);
        }
        assert_eq!(backend.capture("task_00001", 2).expect("capture"), vec!["b", "c"]);
        assert_eq!(backend.capture("task_00001", 0).expect("capture").len(), 3);
        assert!(backend
            .capture("task_00002", 5)
            .expect_err("missing")
            .is_not_found());
    }

    #[test]
    fn graceful_termination_can_be_ignored_but_forced_cannot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = MemoryBackend::new();
        backend.create(&spec(dir.path(), "task_00001")).expect("create");
        backend.set_ignore_interrupt("task_00001", true);

        backend
            .terminate("task_00001", TerminateMode::Graceful)
            .expect("graceful");
        assert!(backend.exists("task_00001").expect("exists"));

        backend
            .terminate("task_00001", TerminateMode::Forced)
            .expect("forced");
        assert!(!backend.exists("task_00001").expect("exists"));
        assert_eq!(backend.terminations().len(), 2);
        assert!(backend
            .terminate("task_00001", TerminateMode::Forced)
            .expect_err("gone")
            .is_not_found());
    }

    #[test]
    fn finish_writes_marker_and_ends_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = MemoryBackend::new();
        let launch = spec(dir.path(), "task_00003");
        backend.create(&launch).expect("create");

        backend.finish("task_00003", 3).expect("finish");
        assert!(backend.list_live().expect("list").is_empty());
        let log = std::fs::read_to_string(&launch.log_path).expect("log");
        let marker = find_exit_marker(log.lines(), "task_00003").expect("marker");
        assert_eq!(marker.code, 3);
        assert!(marker.at.is_some());
    }

    #[test]
    fn unavailable_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.insert_live("task_00001");
        backend.set_unavailable(true);
        assert!(matches!(
            backend.list_live(),
            Err(SessionError::Unavailable { .. })
        ));
        assert!(backend.exists("task_00001").is_err());
        backend.set_unavailable(false);
        assert!(backend.exists("task_00001").expect("exists"));
    }
}
