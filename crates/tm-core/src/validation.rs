//! Validation for task manager configuration and task specs.

use serde::{Deserialize, Serialize};

use crate::config::{NotifySinkName, TaskConfig};
use crate::types::{TaskSpec, MAX_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for TaskConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.session.tmux_binary.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "session.tmux_binary.empty",
                message: "tmux_binary must not be empty".to_string(),
            });
        }

        if self.session.shell.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "session.shell.empty",
                message: "shell must not be empty".to_string(),
            });
        }

        if self.session.kill_poll_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "session.kill_poll.zero",
                message: "kill_poll_ms must be greater than zero".to_string(),
            });
        }

        if self.session.kill_grace_ms < self.session.kill_poll_ms {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "session.kill_grace.short",
                message: format!(
                    "kill_grace_ms ({}) is shorter than kill_poll_ms ({}); graceful kills will only be checked once",
                    self.session.kill_grace_ms, self.session.kill_poll_ms
                ),
            });
        }

        if !(self.monitor.refresh_secs > 0.0) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "monitor.refresh.not_positive",
                message: "monitor refresh_secs must be greater than zero".to_string(),
            });
        }

        if self.notify.enabled_sinks.contains(&NotifySinkName::Command)
            && self
                .notify
                .command
                .as_deref()
                .map_or(true, |cmd| cmd.trim().is_empty())
        {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "notify.command.missing",
                message: "command sink is enabled but notify.command is not set".to_string(),
            });
        }

        if self.notify.enabled_sinks.contains(&NotifySinkName::Webhook) {
            match &self.notify.webhook_url {
                None => issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "notify.webhook_url.missing",
                    message: "webhook sink is enabled but notify.webhook_url is not set"
                        .to_string(),
                }),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Warning,
                        code: "notify.webhook_url.invalid",
                        message: "webhook URL should start with http:// or https://".to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        issues
    }
}

impl Validate for TaskSpec {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "task.name.empty",
                message: "task name must not be empty".to_string(),
            });
        }

        if self.command.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "task.command.empty",
                message: "task command must not be empty".to_string(),
            });
        }

        if self.priority > MAX_PRIORITY {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "task.priority.range",
                message: format!(
                    "priority {} is out of range (0-{MAX_PRIORITY})",
                    self.priority
                ),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, priority: u8) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            command: command.to_string(),
            priority,
            realtime: false,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TaskConfig::default().validate().is_empty());
    }

    #[test]
    fn zero_poll_and_refresh_are_errors() {
        let mut config = TaskConfig::default();
        config.session.kill_poll_ms = 0;
        config.monitor.refresh_secs = 0.0;

        let issues = config.validate();
        assert!(has_errors(&issues));
        assert!(issues.iter().any(|i| i.code == "session.kill_poll.zero"));
        assert!(issues.iter().any(|i| i.code == "monitor.refresh.not_positive"));
    }

    #[test]
    fn enabled_sinks_without_targets_warn() {
        let mut config = TaskConfig::default();
        config.notify.enabled_sinks = vec![NotifySinkName::Command, NotifySinkName::Webhook];

        let issues = config.validate();
        assert!(!has_errors(&issues));
        assert!(issues.iter().any(|i| i.code == "notify.command.missing"));
        assert!(issues.iter().any(|i| i.code == "notify.webhook_url.missing"));

        config.notify.webhook_url = Some("ftp://example.com".to_string());
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.code == "notify.webhook_url.invalid"));
    }

    #[test]
    fn task_spec_requires_name_command_and_priority_range() {
        assert!(spec("train", "python train.py", 10).validate().is_empty());

        let issues = spec(" ", "", 11).validate();
        let codes: Vec<_> = issues.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec!["task.name.empty", "task.command.empty", "task.priority.range"]
        );
    }
}
