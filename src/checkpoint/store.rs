//! Checkpoint store for resumable submission runs.
//!
//! Foundation:
//! - K_i: The store maps RowKey → entry and only ever grows
//! - K_i: The whole map is rewritten after each success (write-then-rename)
//! - B_i: Checkpoint file may not exist → empty map
//! - B_i: Checkpoint file may be corrupt → empty map, corrupt file kept aside
//! - B_i: Single entries may be incomplete → kept verbatim, file still loads

use crate::models::{PledgeError, Result, Row, RowKey};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Status of a checkpointed row.
///
/// K_i: Read and written as the bare status string, so statuses written by
/// other tools survive a load/save cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntryStatus {
    /// Submitted and confirmed
    Success,
    /// Any other status; never counts as done
    Other(String),
}

impl From<String> for EntryStatus {
    fn from(status: String) -> Self {
        if status == "success" {
            EntryStatus::Success
        } else {
            EntryStatus::Other(status)
        }
    }
}

impl From<EntryStatus> for String {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Success => "success".to_string(),
            EntryStatus::Other(status) => status,
        }
    }
}

/// Checkpoint entry for a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    /// Processing-order serial number
    pub serial_no: u64,
    /// Current status
    pub status: EntryStatus,
    /// ISO-8601 time of success
    pub timestamp: String,
    /// Phone of the submitted row
    pub phone: String,
    /// Fields this tool does not know, kept as read
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CheckpointEntry {
    pub fn success(serial_no: u64, phone: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            serial_no,
            status: EntryStatus::Success,
            timestamp: timestamp.into(),
            phone: phone.into(),
            extra: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EntryStatus::Success
    }
}

/// One value of the persisted map.
///
/// B_i: Entries are usually complete → `Entry`; anything else in an
/// otherwise valid file is kept verbatim as `Partial` rather than failing
/// the whole load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredEntry {
    Entry(CheckpointEntry),
    Partial(Value),
}

impl StoredEntry {
    /// Status is success, whatever else the entry holds.
    pub fn is_success(&self) -> bool {
        match self {
            StoredEntry::Entry(entry) => entry.is_success(),
            StoredEntry::Partial(value) => {
                value.get("status").and_then(Value::as_str) == Some("success")
            }
        }
    }

    pub fn serial_no(&self) -> Option<u64> {
        match self {
            StoredEntry::Entry(entry) => Some(entry.serial_no),
            StoredEntry::Partial(value) => value.get("serialNo").and_then(Value::as_u64),
        }
    }

    pub fn as_entry(&self) -> Option<&CheckpointEntry> {
        match self {
            StoredEntry::Entry(entry) => Some(entry),
            StoredEntry::Partial(_) => None,
        }
    }
}

impl From<CheckpointEntry> for StoredEntry {
    fn from(entry: CheckpointEntry) -> Self {
        StoredEntry::Entry(entry)
    }
}

/// The persisted mapping.
pub type CheckpointMap = BTreeMap<RowKey, StoredEntry>;

/// Current local time as an ISO-8601 string.
pub fn timestamp_now() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Checkpoint store backed by a single JSON file.
#[derive(Debug)]
pub struct CheckpointStore {
    /// Path to the checkpoint file
    path: PathBuf,
    /// In-memory copy of the whole file
    entries: CheckpointMap,
}

impl CheckpointStore {
    /// Open the store at `path`, loading whatever is there.
    pub fn open(path: &Path) -> Self {
        let entries = Self::load(path);
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// Load a checkpoint map from disk.
    ///
    /// Never fails: a missing file is an empty store, and a corrupt file is
    /// moved to `<file>.corrupt` and treated as empty.
    pub fn load(path: &Path) -> CheckpointMap {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No checkpoint yet, starting empty");
                return CheckpointMap::new();
            }
            Err(e) => {
                let err = PledgeError::StoreCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Unreadable checkpoint, starting empty");
                return CheckpointMap::new();
            }
        };

        match serde_json::from_str::<CheckpointMap>(&content) {
            Ok(entries) => {
                info!(path = %path.display(), entries = entries.len(), "Loaded checkpoint");
                entries
            }
            Err(e) => {
                let err = PledgeError::StoreCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                };
                let aside = sibling(path, ".corrupt");
                match fs::rename(path, &aside) {
                    Ok(()) => warn!(
                        error = %err,
                        moved_to = %aside.display(),
                        "Corrupt checkpoint, starting empty"
                    ),
                    Err(rename_err) => warn!(
                        error = %err,
                        rename_error = %rename_err,
                        "Corrupt checkpoint, starting empty"
                    ),
                }
                CheckpointMap::new()
            }
        }
    }

    /// Save the whole map to disk, replacing the previous file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| PledgeError::io("creating checkpoint dir", e))?;
        }

        let temp_path = sibling(&self.path, ".tmp");
        {
            let file = File::create(&temp_path)
                .map_err(|e| PledgeError::io("creating temp checkpoint", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &self.entries)
                .map_err(|e| PledgeError::Internal(format!("Serializing checkpoint: {e}")))?;
            writer
                .flush()
                .map_err(|e| PledgeError::io("flushing temp checkpoint", e))?;
        }

        fs::rename(&temp_path, &self.path)
            .map_err(|e| PledgeError::io("renaming checkpoint", e))?;

        debug!(entries = self.entries.len(), "Checkpoint saved");
        Ok(())
    }

    /// True iff the key is present and marked success.
    pub fn is_done(&self, key: &RowKey) -> bool {
        self.entries.get(key).is_some_and(StoredEntry::is_success)
    }

    /// Serial number the next recorded row receives.
    pub fn next_serial(&self) -> u64 {
        self.entries
            .values()
            .filter_map(StoredEntry::serial_no)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// Record a row as submitted and persist immediately.
    ///
    /// An existing success entry is left untouched and returned as is.
    pub fn record_success(&mut self, row: &Row) -> Result<CheckpointEntry> {
        let key = row.key();
        if let Some(existing) = self.entries.get(&key).filter(|e| e.is_success()) {
            // A partial entry stays as stored; callers get a best-effort view.
            return Ok(existing.as_entry().cloned().unwrap_or_else(|| {
                CheckpointEntry::success(existing.serial_no().unwrap_or_default(), &row.phone, "")
            }));
        }

        let entry = CheckpointEntry::success(self.next_serial(), &row.phone, timestamp_now());
        self.entries.insert(key, entry.clone().into());
        self.save()?;
        Ok(entry)
    }

    /// Insert or replace an entry without saving.
    pub fn insert(&mut self, key: RowKey, entry: CheckpointEntry) {
        self.entries.insert(key, entry.into());
    }

    /// The complete entry for `key`, if there is one.
    pub fn get(&self, key: &RowKey) -> Option<&CheckpointEntry> {
        self.entries.get(key).and_then(StoredEntry::as_entry)
    }

    pub fn entries(&self) -> &CheckpointMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("checkpoint"));
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(&temp_dir.path().join("processed.json"));
        assert!(store.is_empty());
        assert_eq!(store.next_serial(), 1);
    }

    #[test]
    fn test_corrupt_file_is_empty_and_kept_aside() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        fs::write(&path, "{ not json").unwrap();

        let store = CheckpointStore::open(&path);
        assert!(store.is_empty());
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("processed.json.corrupt")).unwrap(),
            "{ not json"
        );
    }

    #[test]
    fn test_reads_existing_file_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        fs::write(
            &path,
            r#"{
  "555-0100::I pledge X": {
    "serialNo": 7,
    "status": "success",
    "timestamp": "2024-05-01T10:00:00.000001",
    "phone": "555-0100"
  },
  "555-0101::I pledge Y": {
    "serialNo": 8,
    "status": "pending",
    "timestamp": "2024-05-01T10:00:01.000001",
    "phone": "555-0101"
  }
}"#,
        )
        .unwrap();

        let store = CheckpointStore::open(&path);
        assert_eq!(store.len(), 2);
        assert!(store.is_done(&RowKey::new("555-0100", "I pledge X")));
        assert!(!store.is_done(&RowKey::new("555-0101", "I pledge Y")));
        assert!(!store.is_done(&RowKey::new("555-0102", "I pledge Z")));
        assert_eq!(store.next_serial(), 9);
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("processed.json");

        let mut store = CheckpointStore::open(&path);
        store.record_success(&Row::new(1, "555-0100", "I pledge X")).unwrap();
        store.record_success(&Row::new(2, "555-0101", "I pledge Y")).unwrap();

        let first = fs::read_to_string(&path).unwrap();
        let reloaded = CheckpointStore::open(&path);
        assert_eq!(reloaded.entries(), store.entries());

        reloaded.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
        assert!(!sibling(&path, ".tmp").exists());
    }

    #[test]
    fn test_record_success_never_mutates_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let row = Row::new(1, "555-0100", "I pledge X");

        let mut store = CheckpointStore::open(&path);
        let first = store.record_success(&row).unwrap();
        let second = store.record_success(&row).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.serial_no, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_incomplete_entry_does_not_discard_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        fs::write(
            &path,
            r#"{
  "555-0100::I pledge X": {
    "serialNo": 1,
    "status": "success",
    "timestamp": "2024-05-01T10:00:00.000001",
    "phone": "555-0100"
  },
  "555-0101::I pledge Y": {
    "status": "success",
    "phone": "555-0101"
  }
}"#,
        )
        .unwrap();

        let mut store = CheckpointStore::open(&path);
        assert!(path.exists());
        assert_eq!(store.len(), 2);
        assert!(store.is_done(&RowKey::new("555-0100", "I pledge X")));
        assert!(store.is_done(&RowKey::new("555-0101", "I pledge Y")));
        assert!(store.get(&RowKey::new("555-0101", "I pledge Y")).is_none());
        assert_eq!(store.next_serial(), 2);

        // Recording an already-done partial row leaves it as stored.
        let before = store.entries().clone();
        store
            .record_success(&Row::new(2, "555-0101", "I pledge Y"))
            .unwrap();
        assert_eq!(store.entries(), &before);
    }

    #[test]
    fn test_foreign_statuses_and_fields_survive_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let original = serde_json::json!({
            "555-0100::I pledge X": {
                "serialNo": 8,
                "status": "pending",
                "timestamp": "2024-05-01T10:00:01.000001",
                "phone": "555-0100",
                "note": "manual"
            },
            "555-0101::I pledge Y": {"status": "failed"}
        });
        fs::write(&path, serde_json::to_string_pretty(&original).unwrap()).unwrap();

        let store = CheckpointStore::open(&path);
        assert!(!store.is_done(&RowKey::new("555-0100", "I pledge X")));
        assert_eq!(
            store.get(&RowKey::new("555-0100", "I pledge X")).map(|e| &e.status),
            Some(&EntryStatus::Other("pending".to_string()))
        );
        store.save().unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, original);
    }

    #[test]
    fn test_next_serial_saturates() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(&temp_dir.path().join("processed.json"));
        store.insert(
            RowKey::new("555-0100", "I pledge X"),
            CheckpointEntry::success(u64::MAX, "555-0100", timestamp_now()),
        );
        assert_eq!(store.next_serial(), u64::MAX);
    }
}
