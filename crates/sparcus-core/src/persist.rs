//! Snapshot and restore of the store and event log.
//!
//! The document layout is:
//!
//! ```json
//! {
//!   "values": { "<key>": { "numbers": [..], "text": "..", "timestamp": ".." } },
//!   "events": [ { "uri": "..", "script": "..", "timestamp": "..", "stdout": "..", "stderr": ".." } ]
//! }
//! ```
//!
//! Writes go to a temp file that is renamed into place. Restores are
//! best-effort: a missing or unreadable file means a cold start, and
//! individual malformed entries are skipped.

use serde::{Deserialize, Serialize};
use sparcus_common::ReadingKey;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{Event, EventLog};
use crate::store::{SeriesEntry, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub values: BTreeMap<ReadingKey, SeriesEntry>,
    pub events: Vec<Event>,
}

impl PersistedState {
    /// Capture the current store and log.
    pub fn capture(store: &TimeSeriesStore, log: &EventLog) -> Self {
        Self {
            values: store.snapshot(),
            events: log.all(),
        }
    }

    /// Parse a document, skipping entries that do not decode.
    ///
    /// Returns the state and the number of skipped entries. Only a
    /// document that is not JSON at all is an error.
    pub fn parse_lenient(text: &str) -> Result<(Self, usize), serde_json::Error> {
        let doc: serde_json::Value = serde_json::from_str(text)?;
        let mut state = Self::default();
        let mut skipped = 0;

        if let Some(values) = doc.get("values").and_then(|v| v.as_object()) {
            for (raw_key, raw_entry) in values {
                let parsed = ReadingKey::parse(raw_key)
                    .map_err(|e| e.to_string())
                    .and_then(|key| {
                        serde_json::from_value::<SeriesEntry>(raw_entry.clone())
                            .map(|entry| (key, entry))
                            .map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok((key, entry)) => {
                        state.values.insert(key, entry);
                    }
                    Err(e) => {
                        warn!(key = %raw_key, error = %e, "skipping malformed stored value");
                        skipped += 1;
                    }
                }
            }
        }

        if let Some(events) = doc.get("events").and_then(|v| v.as_array()) {
            for (index, raw_event) in events.iter().enumerate() {
                match serde_json::from_value::<Event>(raw_event.clone()) {
                    Ok(event) => state.events.push(event),
                    Err(e) => {
                        warn!(index, error = %e, "skipping malformed stored event");
                        skipped += 1;
                    }
                }
            }
        }

        Ok((state, skipped))
    }
}

/// What a restore brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub keys: usize,
    pub events: usize,
    pub skipped: usize,
}

/// Reads and writes the state file.
#[derive(Debug, Clone)]
pub struct PersistenceGateway {
    path: PathBuf,
}

impl PersistenceGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current store and log atomically.
    pub fn save(&self, store: &TimeSeriesStore, log: &EventLog) -> Result<(), PersistError> {
        let state = PersistedState::capture(store, log);
        self.write(&state)?;
        info!(
            path = %self.path.display(),
            keys = state.values.len(),
            events = state.events.len(),
            "state saved"
        );
        Ok(())
    }

    /// Write `state` to a temp file, then rename it over the target.
    pub fn write(&self, state: &PersistedState) -> Result<(), PersistError> {
        let io_err = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_vec_pretty(state).map_err(|source| PersistError::Encode {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(io_err)?;
            file.write_all(&json).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Read the state file. Never fails: a missing, unreadable or corrupt
    /// file yields an empty state.
    pub fn load(&self) -> (PersistedState, usize) {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved state, starting empty");
                return (PersistedState::default(), 0);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read saved state, starting empty");
                return (PersistedState::default(), 0);
            }
        };

        match PersistedState::parse_lenient(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "saved state is not valid JSON, starting empty");
                (PersistedState::default(), 0)
            }
        }
    }

    /// Load the state file into `store` and `log`.
    pub fn restore(&self, store: &TimeSeriesStore, log: &EventLog) -> RestoreSummary {
        let (state, skipped) = self.load();
        let summary = RestoreSummary {
            keys: state.values.len(),
            events: state.events.len(),
            skipped,
        };
        store.restore(state.values);
        log.restore(state.events);
        debug!(?summary, "state restored");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(raw: &str) -> ReadingKey {
        ReadingKey::parse(raw).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let gateway = PersistenceGateway::new(dir.path().join("data.json"));

        let store = TimeSeriesStore::new();
        let log = EventLog::new(10);
        for v in ["1", "2", "3"] {
            store.update(&key("sensors/temp"), v);
        }
        store.update(&key("door"), "open");
        let mut event = Event::started("sensors.temp", "/h/a.sh");
        event.stdout = "ok\n".to_string();
        event.exit_code = Some(0);
        log.append(event);
        log.append(Event::started("door", "/h/b.sh"));

        gateway.save(&store, &log).unwrap();

        let store2 = TimeSeriesStore::new();
        let log2 = EventLog::new(10);
        let summary = gateway.restore(&store2, &log2);

        assert_eq!(summary, RestoreSummary { keys: 2, events: 2, skipped: 0 });
        assert_eq!(store2.snapshot(), store.snapshot());
        assert_eq!(log2.all(), log.all());
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let gateway = PersistenceGateway::new(dir.path().join("absent.json"));
        let store = TimeSeriesStore::new();
        let log = EventLog::default();
        assert_eq!(gateway.restore(&store, &log), RestoreSummary::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{not json").unwrap();
        let gateway = PersistenceGateway::new(&path);
        let (state, skipped) = gateway.load();
        assert_eq!(state, PersistedState::default());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let text = r#"{
            "values": {
                "good": {"numbers": [1.5], "text": "", "timestamp": "2024-01-01T00:00:00Z"},
                "bad": {"numbers": "nope", "timestamp": "2024-01-01T00:00:00Z"},
                "": {"numbers": [], "text": "", "timestamp": "2024-01-01T00:00:00Z"}
            },
            "events": [
                {"uri": "good", "script": "/h/x", "timestamp": "2024-01-01T00:00:00Z", "stdout": "", "stderr": ""},
                {"uri": 5}
            ]
        }"#;
        let (state, skipped) = PersistedState::parse_lenient(text).unwrap();
        assert_eq!(skipped, 3);
        assert_eq!(state.values.len(), 1);
        assert_eq!(state.values[&key("good")].numbers.back(), Some(&1.5));
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn test_null_collections_tolerated() {
        let text = r#"{"values": {"t": {"numbers": null, "text": "hi", "timestamp": "2024-01-01T00:00:00Z"}}, "events": null}"#;
        let (state, skipped) = PersistedState::parse_lenient(text).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(state.values[&key("t")].text.as_deref(), Some("hi"));
        assert!(state.events.is_empty());
    }

    #[test]
    fn test_write_is_atomic_replace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/data.json");
        let gateway = PersistenceGateway::new(&path);
        gateway.write(&PersistedState::default()).unwrap();
        gateway.write(&PersistedState::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let text = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(doc["values"].is_object());
        assert!(doc["events"].is_array());
    }
}
