use crate::error::NotifyError;
use crate::types::{NotificationMessage, NotificationSinkKind};
use std::process::Command;
use tm_core::config::{NotifyConfig, NotifySinkName};

pub trait NotificationSink: Send + Sync {
    fn kind(&self) -> NotificationSinkKind;
    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Default)]
pub struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Stdout
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        println!("[{}] {}", message.topic.as_str(), message.title);
        Ok(())
    }
}

/// Runs a user command through `sh -c`, describing the task in `TASK_*` variables.
#[derive(Debug, Clone)]
pub struct CommandSink {
    pub command: String,
}

impl CommandSink {
    pub fn env_for(message: &NotificationMessage) -> Vec<(&'static str, String)> {
        vec![
            (
                "TASK_ID",
                message
                    .task_id
                    .as_ref()
                    .map(|id| id.0.clone())
                    .unwrap_or_default(),
            ),
            ("TASK_NAME", message.task_name.clone().unwrap_or_default()),
            (
                "TASK_STATUS",
                message
                    .status
                    .map(|status| status.as_str().to_string())
                    .unwrap_or_default(),
            ),
            (
                "TASK_EXIT_CODE",
                message
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_default(),
            ),
            ("TASK_TOPIC", message.topic.as_str().to_string()),
            ("TASK_TITLE", message.title.clone()),
            ("TASK_BODY", message.body.clone()),
        ]
    }
}

impl NotificationSink for CommandSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Command
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(Self::env_for(message))
            .output()
            .map_err(|e| NotifyError::SinkFailed {
                message: format!("failed to execute notification command: {e}"),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NotifyError::SinkFailed {
            message: format!(
                "notification command failed (status {:?}): {}",
                output.status.code(),
                stderr.trim()
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    pub url: String,
    pub timeout_secs: u64,
}

impl WebhookSink {
    pub fn payload(message: &NotificationMessage) -> serde_json::Value {
        serde_json::json!({
            "topic": message.topic,
            "severity": message.severity,
            "title": &message.title,
            "body": &message.body,
            "task_id": message
                .task_id
                .as_ref()
                .map(|task_id| task_id.0.clone())
                .unwrap_or_default(),
            "status": message.status,
            "exit_code": message.exit_code,
            "at": message.at.to_rfc3339(),
        })
    }
}

impl NotificationSink for WebhookSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Webhook
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(&Self::payload(message)).map_err(|e| NotifyError::SinkFailed {
                message: format!("failed to encode webhook payload: {e}"),
            })?;

        let output = Command::new("curl")
            .arg("-sS")
            .arg("-f")
            .arg("-m")
            .arg(self.timeout_secs.to_string())
            .arg("-X")
            .arg("POST")
            .arg("-H")
            .arg("Content-Type: application/json")
            .arg("-d")
            .arg(payload)
            .arg(&self.url)
            .output()
            .map_err(|e| NotifyError::SinkFailed {
                message: format!("failed to execute curl for webhook sink: {e}"),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NotifyError::SinkFailed {
            message: format!(
                "webhook sink request failed (status {:?}): {}",
                output.status.code(),
                stderr.trim()
            ),
        })
    }
}

/// Fans a message out to every configured sink, once, without retries.
pub struct NotificationDispatcher {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// A dispatcher with no sinks; every message is dropped.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut sinks: Vec<Box<dyn NotificationSink>> = Vec::new();
        for sink in &config.enabled_sinks {
            match sink {
                NotifySinkName::Stdout => sinks.push(Box::new(StdoutSink)),
                NotifySinkName::Command => match &config.command {
                    Some(command) => sinks.push(Box::new(CommandSink {
                        command: command.clone(),
                    })),
                    None => tracing::warn!("command sink enabled without notify.command"),
                },
                NotifySinkName::Webhook => match &config.webhook_url {
                    Some(url) => sinks.push(Box::new(WebhookSink {
                        url: url.clone(),
                        timeout_secs: config.timeout_secs,
                    })),
                    None => tracing::warn!("webhook sink enabled without notify.webhook_url"),
                },
            }
        }
        Self { sinks }
    }

    pub fn sink_kinds(&self) -> Vec<NotificationSinkKind> {
        self.sinks.iter().map(|sink| sink.kind()).collect()
    }

    pub fn dispatch(
        &self,
        message: &NotificationMessage,
    ) -> Vec<(NotificationSinkKind, Result<(), NotifyError>)> {
        let mut out = Vec::new();
        for sink in &self.sinks {
            let result = sink.send(message);
            if let Err(err) = &result {
                tracing::warn!(
                    sink = ?sink.kind(),
                    topic = message.topic.as_str(),
                    error = %err,
                    "notification delivery failed"
                );
            }
            out.push((sink.kind(), result));
        }
        out
    }
}
