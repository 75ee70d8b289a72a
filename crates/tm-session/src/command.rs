use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Thin runner for the `tmux` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxCli {
    pub binary: PathBuf,
}

impl Default for TmuxCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tmux"),
        }
    }
}

impl TmuxCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn run<I, S>(&self, args: I) -> Result<TmuxOutput, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        for arg in &owned_args {
            command.arg(arg);
        }

        let rendered = render_command(&self.binary, &owned_args);
        tracing::debug!(command = %rendered, "running tmux");
        let output = command.output().map_err(|source| SessionError::Unavailable {
            command: rendered.clone(),
            source,
        })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| SessionError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            })?;
        let stderr =
            String::from_utf8(output.stderr).map_err(|source| SessionError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            })?;

        if !output.status.success() {
            return Err(SessionError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(TmuxOutput { stdout, stderr })
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

/// Returns true if `binary` resolves to an executable on `PATH` (or is a path that exists).
pub fn command_in_path(binary: &str) -> bool {
    if binary.contains('/') {
        return Path::new(binary).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{command_in_path, TmuxCli};
    use crate::error::SessionError;

    #[test]
    fn run_classifies_missing_binary_as_unavailable() {
        let tmux = TmuxCli::new("/definitely/missing/tmux-binary");

        let err = tmux
            .run(["list-sessions"])
            .expect_err("missing binary should fail");
        match err {
            SessionError::Unavailable { command, source } => {
                assert!(command.contains("/definitely/missing/tmux-binary list-sessions"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn run_classifies_non_zero_exit_as_command_failed() {
        // `sh -c 'exit 3'` stands in for a failing tmux invocation.
        let cli = TmuxCli::new("sh");
        let err = cli
            .run(["-c", "echo oops >&2; exit 3"])
            .expect_err("non-zero exit should fail");
        match err {
            SessionError::CommandFailed {
                command,
                status,
                stderr,
                ..
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn run_returns_stdout_for_successful_command() {
        let cli = TmuxCli::new("sh");
        let output = cli.run(["-c", "printf 'a\\nb\\n'"]).expect("sh should succeed");
        assert_eq!(output.stdout, "a\nb\n");
    }

    #[test]
    fn command_in_path_finds_sh_but_not_garbage() {
        assert!(command_in_path("sh"));
        assert!(!command_in_path("definitely-not-a-real-binary-name"));
        assert!(!command_in_path("/definitely/missing/binary"));
    }
}
