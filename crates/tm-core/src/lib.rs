pub mod config;
pub mod state;
pub mod types;
pub mod validation;

pub use config::*;
pub use state::*;
pub use types::*;
pub use validation::*;

#[cfg(test)]
mod tests {
    use super::{parse_config, TaskId, TaskRecord, TaskStatus, Validate};
    use std::any::TypeId;

    #[test]
    fn crate_root_reexports_core_types() {
        let _ = TypeId::of::<TaskId>();
        let _ = TypeId::of::<TaskStatus>();
        let _ = TypeId::of::<TaskRecord>();
    }

    #[test]
    fn crate_root_reexports_parse_and_validate_helpers() {
        let mut config = parse_config(
            r#"
[session]
tmux_binary = "/usr/bin/tmux"
kill_grace_ms = 2000

[monitor]
refresh_secs = 1.5
"#,
        )
        .expect("parse config");

        assert!(config.validate().is_empty());

        config.session.kill_poll_ms = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.code == "session.kill_poll.zero"));
    }
}
