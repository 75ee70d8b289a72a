//! JSON task store: one document holding every task record and the id counter.
//!
//! Every save goes through a temp file in the same directory followed by an
//! atomic rename, so readers see either the previous or the new document.
//! There is no cross-process lock; concurrent writers race on the whole
//! document and the last one wins. `update` reloads right before mutating to
//! keep that window small.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tm_core::config::HomeLayout;
use tm_core::types::{TaskId, TaskRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read task store at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write task store at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize task store: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to claim task id via {path}: {source}")]
    ClaimId {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn default_next_id() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default = "default_next_id")]
    pub next_id: u64,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            next_id: default_next_id(),
            tasks: BTreeMap::new(),
        }
    }
}

impl StoreSnapshot {
    pub fn get(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(task_id)
    }

    /// Records in ascending numeric id order.
    pub fn sorted(&self) -> Vec<&TaskRecord> {
        let mut records: Vec<&TaskRecord> = self.tasks.values().collect();
        records.sort_by_key(|record| (record.id.number().unwrap_or(u64::MAX), record.id.0.clone()));
        records
    }

    /// Keeps the counter ahead of every stored id, so ids are never handed out twice.
    fn repair_counter(&mut self) {
        let highest = self.tasks.keys().filter_map(TaskId::number).max().unwrap_or(0);
        self.next_id = self.next_id.max(highest + 1).max(1);
    }
}

/// How `load` obtained its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReport {
    Loaded,
    /// No store file yet; the snapshot is empty.
    Missing,
    /// The file could not be parsed. It was moved to `backup` (when the move
    /// succeeded) and an empty snapshot was returned.
    Corrupt {
        reason: String,
        backup: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    logs_dir: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn for_layout(layout: &HomeLayout) -> Self {
        Self::new(&layout.store_file, &layout.logs_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<(StoreSnapshot, LoadReport), StoreError> {
        let body = match fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok((StoreSnapshot::default(), LoadReport::Missing));
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if body.trim().is_empty() {
            return Ok((StoreSnapshot::default(), LoadReport::Loaded));
        }

        match serde_json::from_str::<StoreSnapshot>(&body) {
            Ok(mut snapshot) => {
                snapshot.repair_counter();
                Ok((snapshot, LoadReport::Loaded))
            }
            Err(err) => {
                let backup = self.quarantine();
                tracing::warn!(
                    path = %self.path.display(),
                    backup = ?backup,
                    error = %err,
                    "task store is corrupt; continuing with an empty store"
                );
                Ok((
                    StoreSnapshot::default(),
                    LoadReport::Corrupt {
                        reason: err.to_string(),
                        backup,
                    },
                ))
            }
        }
    }

    /// Loads the snapshot, ignoring how it was obtained.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        self.load().map(|(snapshot, _)| snapshot)
    }

    fn quarantine(&self) -> Option<PathBuf> {
        let file_name = self.path.file_name()?.to_string_lossy().into_owned();
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let backup = self.path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
        match fs::rename(&self.path, &backup) {
            Ok(()) => Some(backup),
            Err(err) => {
                tracing::warn!(error = %err, "failed to move corrupt task store aside");
                None
            }
        }
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| StoreError::Serialize { source })?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&body).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|err| write_err(err.error))?;
        tracing::debug!(path = %self.path.display(), tasks = snapshot.tasks.len(), "task store saved");
        Ok(())
    }

    /// Reload, mutate, save. Nothing is written when `mutate` fails.
    pub fn update<T, E>(
        &self,
        mutate: impl FnOnce(&mut StoreSnapshot) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut snapshot = self.snapshot()?;
        let value = mutate(&mut snapshot)?;
        self.save(&snapshot)?;
        Ok(value)
    }

    /// Claims the next free id by exclusively creating its log file.
    ///
    /// The exclusive create is what keeps ids distinct between invocations
    /// racing on the same store; ids whose log already exists are skipped.
    pub fn allocate_id(&self, snapshot: &mut StoreSnapshot) -> Result<TaskId, StoreError> {
        fs::create_dir_all(&self.logs_dir).map_err(|source| StoreError::CreateDir {
            path: self.logs_dir.clone(),
            source,
        })?;

        snapshot.repair_counter();
        let mut candidate = snapshot.next_id;
        loop {
            let task_id = TaskId::from_number(candidate);
            if snapshot.tasks.contains_key(&task_id) {
                candidate += 1;
                continue;
            }
            let log_path = self.logs_dir.join(format!("{}.log", task_id.0));
            match OpenOptions::new().write(true).create_new(true).open(&log_path) {
                Ok(_) => {
                    snapshot.next_id = candidate + 1;
                    tracing::debug!(task_id = %task_id, "task id claimed");
                    return Ok(task_id);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    candidate += 1;
                }
                Err(source) => {
                    return Err(StoreError::ClaimId {
                        path: log_path,
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tm_core::state::TaskStatus;
    use tm_core::types::TaskSpec;

    fn mk_store(dir: &Path) -> TaskStore {
        TaskStore::new(dir.join("tasks.json"), dir.join("logs"))
    }

    fn mk_record(store: &TaskStore, id: &TaskId) -> TaskRecord {
        TaskRecord::new(
            id.clone(),
            TaskSpec {
                name: format!("job {id}"),
                command: "echo hi".to_string(),
                priority: 1,
                realtime: false,
            },
            store.logs_dir.join(format!("{id}.log")),
            Utc::now(),
        )
    }

    #[test]
    fn missing_file_loads_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let (snapshot, report) = store.load().expect("load");
        assert_eq!(report, LoadReport::Missing);
        assert_eq!(snapshot, StoreSnapshot::default());
        assert_eq!(snapshot.next_id, 1);
    }

    #[test]
    fn save_then_load_preserves_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let mut snapshot = StoreSnapshot::default();
        let id = store.allocate_id(&mut snapshot).expect("allocate");
        let mut record = mk_record(&store, &id);
        record.status = TaskStatus::Failed;
        record.started_at = Some(Utc::now());
        record.ended_at = Some(Utc::now());
        record.exit_code = Some(3);
        record.error_message = Some("exited with code 3".to_string());
        snapshot.tasks.insert(id.clone(), record);

        store.save(&snapshot).expect("save");
        let (loaded, report) = store.load().expect("load");
        assert_eq!(report, LoadReport::Loaded);
        assert_eq!(loaded, snapshot);

        store.save(&loaded).expect("save again");
        assert_eq!(store.snapshot().expect("reload"), snapshot);
    }

    #[test]
    fn document_uses_id_keys_and_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let mut snapshot = StoreSnapshot::default();
        let id = store.allocate_id(&mut snapshot).expect("allocate");
        snapshot.tasks.insert(id.clone(), mk_record(&store, &id));
        store.save(&snapshot).expect("save");

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).expect("read")).expect("json");
        assert_eq!(raw["next_id"], 2);
        assert_eq!(raw["tasks"]["00001"]["status"], "pending");
        assert_eq!(raw["tasks"]["00001"]["session_name"], "task_00001");
    }

    #[test]
    fn corrupt_store_is_quarantined_and_loaded_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        fs::write(store.path(), "{\"tasks\": [not json").expect("write garbage");

        let (snapshot, report) = store.load().expect("load");
        assert!(snapshot.tasks.is_empty());
        let backup = match report {
            LoadReport::Corrupt { backup, .. } => backup.expect("backup path"),
            other => panic!("expected corrupt report, got {other:?}"),
        };
        assert!(backup
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .starts_with("tasks.json.corrupt-"));
        assert_eq!(
            fs::read_to_string(&backup).expect("read backup"),
            "{\"tasks\": [not json"
        );
        assert!(!store.path().exists());
    }

    #[test]
    fn allocated_ids_are_distinct_and_never_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());

        // Two invocations that both loaded the same empty snapshot.
        let mut first = StoreSnapshot::default();
        let mut second = StoreSnapshot::default();
        let a = store.allocate_id(&mut first).expect("allocate a");
        let b = store.allocate_id(&mut second).expect("allocate b");
        assert_ne!(a, b);

        // Deleting a record does not free its id.
        let mut snapshot = StoreSnapshot::default();
        let c = store.allocate_id(&mut snapshot).expect("allocate c");
        snapshot.tasks.insert(c.clone(), mk_record(&store, &c));
        snapshot.tasks.remove(&c);
        let d = store.allocate_id(&mut snapshot).expect("allocate d");

        let ids: BTreeSet<TaskId> = [a, b, c, d].into_iter().collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn allocation_skips_leftover_log_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        fs::create_dir_all(&store.logs_dir).expect("logs dir");
        fs::write(store.logs_dir.join("00001.log"), "old").expect("leftover log");

        let mut snapshot = StoreSnapshot::default();
        assert_eq!(
            store.allocate_id(&mut snapshot).expect("allocate"),
            TaskId::from_number(2)
        );
        assert_eq!(snapshot.next_id, 3);
    }

    #[test]
    fn counter_is_repaired_from_existing_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let id = TaskId::from_number(41);
        let body = serde_json::json!({
            "next_id": 2,
            "tasks": { "00041": mk_record(&store, &id) }
        });
        fs::write(store.path(), body.to_string()).expect("write store");

        let snapshot = store.snapshot().expect("load");
        assert_eq!(snapshot.next_id, 42);
    }

    #[test]
    fn update_does_not_save_when_mutation_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let result: Result<(), StoreError> = store.update(|snapshot| {
            snapshot.next_id = 99;
            Err(StoreError::Serialize {
                source: serde_json::from_str::<u8>("x").expect_err("bad json"),
            })
        });
        assert!(result.is_err());
        assert!(!store.path().exists());

        store
            .update(|snapshot| {
                snapshot.next_id = 7;
                Ok::<_, StoreError>(())
            })
            .expect("update");
        assert_eq!(store.snapshot().expect("load").next_id, 7);
    }

    #[test]
    fn sorted_orders_by_numeric_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = mk_store(dir.path());
        let mut snapshot = StoreSnapshot::default();
        for number in [100_000, 3, 20] {
            let id = TaskId::from_number(number);
            snapshot.tasks.insert(id.clone(), mk_record(&store, &id));
        }
        let ids: Vec<String> = snapshot.sorted().iter().map(|r| r.id.0.clone()).collect();
        assert_eq!(ids, vec!["00003", "00020", "100000"]);
    }
}
