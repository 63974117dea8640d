/// Shutdown record: the JSON file describing how the process last exited.
///
/// Uses atomic write pattern: write to a temp file in the same directory,
/// fsync, then rename over the canonical path. Readers see either the old
/// record, the new one, or nothing.
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Reason written by a completed shutdown sequence.
pub const REASON_GRACEFUL: &str = "graceful_shutdown";
/// Reason treated as evidence of an abrupt exit.
pub const REASON_KILLED: &str = "SIGKILL";

/// The JSON payload written to `shutdown_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRecord {
    /// ISO-8601 time the record was produced.
    pub timestamp: String,
    pub reason: String,
    /// Per-service payloads, opaque to this crate.
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
}

impl ShutdownRecord {
    /// A record stamped with the current time.
    pub fn now(reason: impl Into<String>, services: BTreeMap<String, Value>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            reason: reason.into(),
            services,
        }
    }

    /// Presumptive record written at boot. A graceful shutdown overwrites it;
    /// if it survives to the next boot the process never got the chance.
    pub fn crash_marker() -> Self {
        Self::now(REASON_KILLED, BTreeMap::new())
    }

    pub fn is_graceful(&self) -> bool {
        self.reason == REASON_GRACEFUL
    }

    /// Parse `timestamp`. Accepts RFC 3339 as well as offset-less ISO-8601,
    /// which is read as UTC.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Reads and writes the shutdown record at a fixed path.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replace the record on disk.
    pub fn write(&self, record: &ShutdownRecord) -> Result<(), RecordError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RecordError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let prefix = temp_prefix(&self.path);
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| RecordError::Write {
                path: dir.to_path_buf(),
                source: e,
            })?;

        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| RecordError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;

        // An unpersisted NamedTempFile deletes itself on drop, so a failed
        // rename leaves nothing behind.
        tmp.persist(&self.path).map_err(|e| RecordError::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;

        tracing::debug!(path = %self.path.display(), reason = %record.reason, "wrote shutdown record");
        Ok(())
    }

    /// Load the record. A missing file is `Ok(None)`; anything unreadable is an error.
    pub fn load(&self) -> Result<Option<ShutdownRecord>, RecordError> {
        let Some(value) = self.load_value()? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RecordError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Load the record as untyped JSON, for callers that must read a field
    /// from a record that may not match [`ShutdownRecord`].
    pub fn load_value(&self) -> Result<Option<Value>, RecordError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RecordError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| RecordError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }
}

/// Hidden sibling name for the temp file, e.g. `.shutdown_state.json.` for
/// `shutdown_state.json`.
fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shutdown_record".to_string());
    format!(".{name}.")
}

/// Errors from shutdown record operations.
#[derive(Debug)]
pub enum RecordError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Serialize { source } => {
                write!(f, "failed to serialize shutdown record: {source}")
            }
            RecordError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp record file in {}: {source}",
                    path.display()
                )
            }
            RecordError::Persist { path, source } => {
                write!(f, "failed to rename temp record to {}: {source}", path.display())
            }
            RecordError::Read { path, source } => {
                write!(f, "failed to read shutdown record {}: {source}", path.display())
            }
            RecordError::Parse { path, source } => {
                write!(f, "corrupt shutdown record {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Serialize { source } => Some(source),
            RecordError::Write { source, .. } => Some(source),
            RecordError::Persist { source, .. } => Some(source),
            RecordError::Read { source, .. } => Some(source),
            RecordError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> ShutdownRecord {
        let mut services = BTreeMap::new();
        services.insert("voting".to_string(), json!({"active_votes": 2}));
        services.insert(
            "agent".to_string(),
            json!({"last_run": "2024-01-01T00:00:00"}),
        );
        ShutdownRecord::now(REASON_GRACEFUL, services)
    }

    #[test]
    fn test_write_is_atomic_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shutdown_state.json");
        let store = RecordStore::new(&path);
        let record = sample();

        store.write(&record).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: ShutdownRecord = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, record);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("shutdown_state.json")]);
    }

    #[test]
    fn test_temp_name_follows_target_file() {
        assert_eq!(
            temp_prefix(Path::new("/data/agent/exit.json")),
            ".exit.json."
        );
        assert_eq!(temp_prefix(Path::new("state")), ".state.");

        let dir = tempdir().unwrap();
        let path = dir.path().join("exit.json");
        RecordStore::new(&path).write(&sample()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("exit.json")]);
    }

    #[test]
    fn test_wire_format_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shutdown_state.json");
        RecordStore::new(&path).write(&sample()).unwrap();

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["reason"], "graceful_shutdown");
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["services"]["voting"]["active_votes"], 2);
        assert_eq!(parsed.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_overwrite_replaces_previous_record() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("shutdown_state.json"));

        store.write(&ShutdownRecord::crash_marker()).unwrap();
        store.write(&sample()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.is_graceful());
        assert_eq!(loaded.services.len(), 2);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("shutdown_state.json"));
        assert!(!store.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shutdown_state.json");
        std::fs::write(&path, "{\"timestamp\": \"2024-01-").unwrap();

        let err = RecordStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RecordError::Parse { .. }));
        assert!(err.to_string().contains("corrupt shutdown record"));
    }

    #[test]
    fn test_load_tolerates_missing_services() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shutdown_state.json");
        std::fs::write(&path, r#"{"timestamp":"2024-01-01T00:00:00","reason":"SIGKILL"}"#).unwrap();

        let record = RecordStore::new(&path).load().unwrap().unwrap();
        assert_eq!(record.reason, REASON_KILLED);
        assert!(record.services.is_empty());
    }

    #[test]
    fn test_write_to_nonexistent_dir_fails() {
        let store = RecordStore::new("/nonexistent/dir/shutdown_state.json");
        let err = store.write(&sample()).unwrap_err();
        assert!(matches!(err, RecordError::Write { .. }));
    }

    #[test]
    fn test_timestamp_parsing() {
        let mut record = ShutdownRecord::crash_marker();
        assert!(record.timestamp_utc().is_some());

        record.timestamp = "2024-01-01T00:00:00".to_string();
        let ts = record.timestamp_utc().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        record.timestamp = "2024-01-01T02:00:00.250+02:00".to_string();
        let ts = record.timestamp_utc().unwrap();
        assert_eq!(ts.to_rfc3339_opts(SecondsFormat::Millis, true), "2024-01-01T00:00:00.250Z");

        record.timestamp = "yesterday".to_string();
        assert!(record.timestamp_utc().is_none());
    }
}
