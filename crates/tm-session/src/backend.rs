//! Session backend: named, detached execution contexts observed from outside.
//!
//! A session is not a child process of the caller. It may outlive the
//! invocation that created it or be killed by someone else, so every
//! operation addresses it by name and re-checks liveness.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use crate::command::TmuxCli;
use crate::error::SessionError;
use crate::script::{render_launch_script, shell_quote_path, LaunchSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Interrupt the foreground command and let it exit on its own.
    Graceful,
    /// Destroy the session immediately.
    Forced,
}

pub trait SessionBackend {
    /// Starts a detached session running the launch script for `spec`.
    fn create(&self, spec: &LaunchSpec) -> Result<(), SessionError>;
    fn exists(&self, session: &str) -> Result<bool, SessionError>;
    /// Last `lines` lines of the session's screen and scrollback, most recent last.
    /// `lines == 0` returns everything available.
    fn capture(&self, session: &str, lines: usize) -> Result<Vec<String>, SessionError>;
    fn terminate(&self, session: &str, mode: TerminateMode) -> Result<(), SessionError>;
    fn list_live(&self) -> Result<BTreeSet<String>, SessionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxBackend {
    pub cli: TmuxCli,
    /// Shell used to interpret launch scripts.
    pub shell: String,
    pub width: u16,
    pub height: u16,
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self {
            cli: TmuxCli::default(),
            shell: "sh".to_string(),
            width: 200,
            height: 50,
        }
    }
}

impl TmuxBackend {
    pub fn new(binary: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            cli: TmuxCli::new(binary),
            shell: shell.into(),
            ..Self::default()
        }
    }
}

/// Exact-match session target; avoids tmux prefix matching `task_0001` to `task_00010`.
fn session_target(session: &str) -> String {
    format!("={session}")
}

fn pane_target(session: &str) -> String {
    format!("={session}:")
}

impl SessionBackend for TmuxBackend {
    fn create(&self, spec: &LaunchSpec) -> Result<(), SessionError> {
        if self.exists(&spec.session_name)? {
            return Err(SessionError::AlreadyExists {
                session: spec.session_name.clone(),
            });
        }

        fs::write(&spec.script_path, render_launch_script(spec)).map_err(|source| {
            SessionError::Script {
                path: spec.script_path.clone(),
                source,
            }
        })?;

        let launcher = format!("{} {}", self.shell, shell_quote_path(&spec.script_path));
        let width = self.width.to_string();
        let height = self.height.to_string();
        self.cli
            .run([
                "new-session",
                "-d",
                "-s",
                spec.session_name.as_str(),
                "-x",
                width.as_str(),
                "-y",
                height.as_str(),
                launcher.as_str(),
            ])
            .map_err(|err| match err {
                SessionError::CommandFailed { stderr, .. } if stderr.contains("duplicate") => {
                    SessionError::AlreadyExists {
                        session: spec.session_name.clone(),
                    }
                }
                other => other,
            })?;
        tracing::info!(session = %spec.session_name, "session created");
        Ok(())
    }

    fn exists(&self, session: &str) -> Result<bool, SessionError> {
        let target = session_target(session);
        match self.cli.run(["has-session", "-t", target.as_str()]) {
            Ok(_) => Ok(true),
            Err(SessionError::CommandFailed { ref stderr, .. }) if !server_unreachable(stderr) => {
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    fn capture(&self, session: &str, lines: usize) -> Result<Vec<String>, SessionError> {
        if !self.exists(session)? {
            return Err(SessionError::NotFound {
                session: session.to_string(),
            });
        }

        let start = if lines == 0 {
            "-".to_string()
        } else {
            format!("-{lines}")
        };
        let target = pane_target(session);
        let output = self
            .cli
            .run([
                "capture-pane",
                "-p",
                "-J",
                "-t",
                target.as_str(),
                "-S",
                start.as_str(),
            ])
            .map_err(|err| not_found_if_gone(err, session))?;

        Ok(tail_lines(&output.stdout, lines))
    }

    fn terminate(&self, session: &str, mode: TerminateMode) -> Result<(), SessionError> {
        if !self.exists(session)? {
            return Err(SessionError::NotFound {
                session: session.to_string(),
            });
        }

        let result = match mode {
            TerminateMode::Graceful => {
                let target = pane_target(session);
                self.cli.run(["send-keys", "-t", target.as_str(), "C-c"])
            }
            TerminateMode::Forced => {
                let target = session_target(session);
                self.cli.run(["kill-session", "-t", target.as_str()])
            }
        };
        result.map_err(|err| not_found_if_gone(err, session))?;
        tracing::info!(session, ?mode, "termination requested");
        Ok(())
    }

    fn list_live(&self) -> Result<BTreeSet<String>, SessionError> {
        match self.cli.run(["list-sessions", "-F", "#{session_name}"]) {
            Ok(output) => Ok(output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(SessionError::CommandFailed { ref stderr, .. }) if no_server_running(stderr) => {
                tracing::debug!(%stderr, "no tmux server, no sessions");
                Ok(BTreeSet::new())
            }
            Err(other) => Err(other),
        }
    }
}

/// tmux stderr for a server that simply is not started (no socket file).
fn no_server_running(stderr: &str) -> bool {
    stderr.contains("no server running")
        || (stderr.contains("error connecting to") && stderr.contains("No such file or directory"))
}

/// A socket exists but cannot be used, e.g. wrong permissions.
fn server_unreachable(stderr: &str) -> bool {
    stderr.contains("error connecting to") && !no_server_running(stderr)
}

fn not_found_if_gone(err: SessionError, session: &str) -> SessionError {
    match err {
        SessionError::CommandFailed { ref stderr, .. }
            if stderr.contains("can't find") || stderr.contains("no server running") =>
        {
            SessionError::NotFound {
                session: session.to_string(),
            }
        }
        other => other,
    }
}

/// Drops the blank padding tmux appends below the cursor and keeps the last `lines`.
pub fn tail_lines(text: &str, lines: usize) -> Vec<String> {
    let mut all: Vec<String> = text.lines().map(|line| line.trim_end().to_string()).collect();
    while all.last().is_some_and(|line| line.is_empty()) {
        all.pop();
    }
    if lines > 0 && all.len() > lines {
        all.drain(..all.len() - lines);
    }
    all
}
