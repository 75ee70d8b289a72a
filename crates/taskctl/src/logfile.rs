//! Per-task log files: header, tail reads and exit-marker lookup.

use chrono::{DateTime, Local, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tm_core::types::TaskRecord;
use tm_session::backend::tail_lines;
use tm_session::script::{find_exit_marker, ExitMarker};

/// Bytes read from the end of a log when looking for the exit marker.
const MARKER_SCAN_BYTES: u64 = 64 * 1024;

pub fn write_header(path: &Path, task: &TaskRecord, now: DateTime<Utc>) -> io::Result<()> {
    let mut log = OpenOptions::new().create(true).append(true).open(path)?;
    let stamp = now.with_timezone(&Local).format("%Y-%m-%dT%H:%M:%S");
    writeln!(log, "[{stamp}] Task started: {}", task.name)?;
    writeln!(log, "[{stamp}] Command: {}", task.command)?;
    writeln!(log, "[{stamp}] Session: {}", task.session_name)?;
    writeln!(log, "{}", "=".repeat(80))?;
    Ok(())
}

/// Last `lines` lines of the log (`0` = all of it).
pub fn read_tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let bytes = fs::read(path)?;
    Ok(tail_lines(&String::from_utf8_lossy(&bytes), lines))
}

/// The last exit marker `session` left in the log, if its command reached
/// the exit path.
pub fn read_exit_marker(path: &Path, session: &str) -> Option<ExitMarker> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(MARKER_SCAN_BYTES)))
        .ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    find_exit_marker(String::from_utf8_lossy(&bytes).lines(), session)
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
