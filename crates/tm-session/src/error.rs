use std::path::PathBuf;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session backend unavailable ({command}): {source}")]
    Unavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session already exists: {session}")]
    AlreadyExists { session: String },
    #[error("session not found: {session}")]
    NotFound { session: String },
    #[error("tmux command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("tmux command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("failed to write launch script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// True for the failures `create` reports as a session-create error.
    pub fn is_create_error(&self) -> bool {
        matches!(
            self,
            SessionError::Unavailable { .. } | SessionError::AlreadyExists { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::SessionError;
    use std::error::Error;
    use std::path::PathBuf;

    #[test]
    fn unavailable_variant_includes_command_and_io_message() {
        let err = SessionError::Unavailable {
            command: "tmux list-sessions".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("session backend unavailable (tmux list-sessions)"));
        assert!(rendered.contains("missing binary"));
        assert!(err.source().is_some());
        assert!(err.is_create_error());
    }

    #[test]
    fn command_failed_variant_mentions_command_status_and_stderr() {
        let err = SessionError::CommandFailed {
            command: "tmux kill-session -t =task_00001".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "can't find session".to_string(),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("(tmux kill-session -t =task_00001)"));
        assert!(rendered.contains("status=Some(1)"));
        assert!(rendered.contains("can't find session"));
        assert!(!err.is_create_error());
    }

    #[test]
    fn not_found_and_exists_variants_name_the_session() {
        let err = SessionError::NotFound {
            session: "task_00002".to_string(),
        };
        assert_eq!(err.to_string(), "session not found: task_00002");
        assert!(err.is_not_found());

        let err = SessionError::AlreadyExists {
            session: "task_00002".to_string(),
        };
        assert_eq!(err.to_string(), "session already exists: task_00002");
        assert!(err.is_create_error());
    }

    #[test]
    fn script_variant_has_source() {
        let err = SessionError::Script {
            path: PathBuf::from("/tmp/logs/00001.sh"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err
            .to_string()
            .contains("failed to write launch script /tmp/logs/00001.sh"));
        assert!(err.source().is_some());
    }
}
