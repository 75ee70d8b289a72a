//! Configuration and on-disk layout of the task manager home directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::TaskId;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "TASK_MANAGER_HOME";
const DEFAULT_HOME_DIR: &str = ".task_manager";
const STORE_FILE: &str = "tasks.json";
const CONFIG_FILE: &str = "config.toml";
const LOGS_DIR: &str = "logs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot determine a home directory; set {HOME_ENV} or pass --home")]
    NoHomeDir,
}

/// Settings read from `config.toml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskConfig {
    pub session: SessionConfig,
    pub output: OutputConfig,
    pub monitor: MonitorConfig,
    pub cleanup: CleanupConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tmux_binary: String,
    /// Shell used to interpret generated launch scripts.
    pub shell: String,
    /// Bounded wait for a graceful termination to take effect.
    pub kill_grace_ms: u64,
    pub kill_poll_ms: u64,
    /// A pending task older than this with no session is marked failed.
    pub pending_timeout_secs: u64,
    /// Launch scripts call back into `task _finalize <id>` when the command exits.
    pub finalize_hook: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tmux_binary: "tmux".to_string(),
            shell: "sh".to_string(),
            kill_grace_ms: 3000,
            kill_poll_ms: 200,
            pending_timeout_secs: 60,
            finalize_hook: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub lines: usize,
    pub log_lines: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            lines: 50,
            log_lines: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub lines: usize,
    pub refresh_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            lines: 50,
            refresh_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub older_than_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            older_than_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifySinkName {
    Stdout,
    Command,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled_sinks: Vec<NotifySinkName>,
    /// Shell command run for every notification (`command` sink).
    pub command: Option<String>,
    /// URL receiving a JSON POST (`webhook` sink).
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled_sinks: vec![NotifySinkName::Stdout],
            command: None,
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

/// Paths inside the home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    pub root: PathBuf,
    pub store_file: PathBuf,
    pub config_file: PathBuf,
    pub logs_dir: PathBuf,
}

impl HomeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store_file: root.join(STORE_FILE),
            config_file: root.join(CONFIG_FILE),
            logs_dir: root.join(LOGS_DIR),
            root,
        }
    }

    /// Resolves the home directory: explicit override, then `$TASK_MANAGER_HOME`,
    /// then `~/.task_manager`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        if let Some(value) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::new(PathBuf::from(value)));
        }
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(Self::new(home.join(DEFAULT_HOME_DIR)))
    }

    pub fn ensure_layout(&self) -> Result<(), ConfigError> {
        for dir in [&self.root, &self.logs_dir] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn log_path(&self, task_id: &TaskId) -> PathBuf {
        self.logs_dir.join(format!("{}.log", task_id.0))
    }

    pub fn script_path(&self, task_id: &TaskId) -> PathBuf {
        self.logs_dir.join(format!("{}.sh", task_id.0))
    }
}

pub fn parse_config(contents: &str) -> Result<TaskConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<TaskConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<TaskConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(TaskConfig::default());
    }
    load_config(path_ref)
}

pub fn render_config(path: &Path, config: &TaskConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_config(path: impl AsRef<Path>, config: &TaskConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    let parent = path_ref.parent().map(Path::to_path_buf);
    if let Some(parent_dir) = parent {
        fs::create_dir_all(&parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir,
            source,
        })?;
    }

    let body = render_config(path_ref, config)?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
