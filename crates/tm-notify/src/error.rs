#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification sink is disabled: {sink}")]
    SinkDisabled { sink: String },
    #[error("notification sink failed: {message}")]
    SinkFailed { message: String },
}

#[cfg(test)]
mod tests {
    use super::NotifyError;

    #[test]
    fn sink_disabled_formats_sink_name() {
        let err = NotifyError::SinkDisabled {
            sink: "command".to_string(),
        };

        assert_eq!(err.to_string(), "notification sink is disabled: command");
        assert!(matches!(err, NotifyError::SinkDisabled { ref sink } if sink == "command"));
    }

    #[test]
    fn sink_failed_formats_failure_message() {
        let err = NotifyError::SinkFailed {
            message: "curl exited with 7".to_string(),
        };

        assert_eq!(err.to_string(), "notification sink failed: curl exited with 7");
    }
}
