//! Launch scripts executed inside a session, and the exit marker they leave
//! behind in the task log.
//!
//! The script runs the task command under `sh -c` with stderr merged into
//! stdout, tees everything into the log, and appends one marker line once the
//! command returns:
//!
//! ```text
//! __TASK_EXIT__ <session name> <code> <utc timestamp>
//! ```
//!
//! Marker lines carrying another session's name are ignored, so output that
//! merely looks like a marker does not settle the task.
//!
//! A log without a marker means the command never reached its normal exit
//! path (interrupted, session killed, machine rebooted).

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

pub const EXIT_MARKER: &str = "__TASK_EXIT__";

/// Everything a backend needs to start one task session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub session_name: String,
    pub command: String,
    /// Line-buffer the command's output instead of letting it batch.
    pub realtime: bool,
    pub log_path: PathBuf,
    pub script_path: PathBuf,
    /// Shell command run after the marker is written, e.g. `task _finalize 00001`.
    pub on_exit: Option<String>,
    /// Extra environment exported at the top of the script.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitMarker {
    pub code: i32,
    pub at: Option<DateTime<Utc>>,
}

/// Quotes `value` for POSIX `sh` using single quotes.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

pub fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

pub fn render_launch_script(spec: &LaunchSpec) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("# launch script for {}\n", spec.session_name));
    for (key, value) in &spec.env {
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    if spec.realtime {
        script.push_str("export PYTHONUNBUFFERED=1\n");
    }

    // The command is quoted so a syntax error in it fails the inner shell
    // with status 2 instead of breaking the script itself.
    let quoted = shell_quote(&spec.command);
    script.push_str("{\n");
    if spec.realtime {
        script.push_str("  if command -v stdbuf >/dev/null 2>&1; then\n");
        script.push_str(&format!("    stdbuf -oL -eL sh -c {quoted}\n"));
        script.push_str("  else\n");
        script.push_str(&format!("    sh -c {quoted}\n"));
        script.push_str("  fi\n");
    } else {
        script.push_str(&format!("  sh -c {quoted}\n"));
    }
    script.push_str(&format!(
        "  printf '\\n%s %s %s %s\\n' '{EXIT_MARKER}' {} \"$?\" \"$(date -u '+%Y-%m-%dT%H:%M:%SZ')\"\n",
        shell_quote(&spec.session_name)
    ));
    script.push_str(&format!(
        "}} 2>&1 | tee -a {}\n",
        shell_quote_path(&spec.log_path)
    ));

    if let Some(hook) = &spec.on_exit {
        script.push_str(&format!("{hook} >/dev/null 2>&1 || true\n"));
    }
    script
}

/// Renders the marker line the launch script writes for `session`.
pub fn format_exit_marker(session: &str, code: i32, at: DateTime<Utc>) -> String {
    format!(
        "{EXIT_MARKER} {session} {code} {}",
        at.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

/// Parses a single log line as the exit marker of `session`.
pub fn parse_exit_marker(line: &str, session: &str) -> Option<ExitMarker> {
    let mut parts = line.split_whitespace();
    if parts.next()? != EXIT_MARKER || parts.next()? != session {
        return None;
    }
    let code = parts.next()?.parse::<i32>().ok()?;
    let at = parts.next().and_then(parse_marker_time);
    Some(ExitMarker { code, at })
}

/// Finds the last exit marker of `session` in a sequence of log lines.
pub fn find_exit_marker<'a, I>(lines: I, session: &str) -> Option<ExitMarker>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_exit_marker(line, session))
        .last()
}

fn parse_marker_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}
