//! Keyed sliding-window storage of readings.
//!
//! Each key holds either a numeric series (the last [`WINDOW_SIZE`] samples,
//! oldest evicted first) or a last text value, plus the time of the most
//! recent write. The latest write's type decides which branch `latest`
//! answers from.
//!
//! All access goes through one store-wide mutex, so a reader always sees a
//! key's window either before or after an append, never in between.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparcus_common::{Error, ReadingKey, ReadingValue, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Maximum number of numeric samples kept per key.
pub const WINDOW_SIZE: usize = 10;

/// Stored state for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    /// Most recent numeric samples, oldest first.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub numbers: VecDeque<f64>,
    /// Last text value; serialized as `""` when absent.
    #[serde(default, with = "text_field")]
    pub text: Option<String>,
    /// Time of the most recent write.
    pub timestamp: DateTime<Utc>,
}

impl SeriesEntry {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            numbers: VecDeque::with_capacity(WINDOW_SIZE),
            text: None,
            timestamp: now,
        }
    }

    /// Drop samples beyond the window, keeping the newest.
    fn trim(&mut self) {
        while self.numbers.len() > WINDOW_SIZE {
            self.numbers.pop_front();
        }
    }

    fn latest(&self) -> Option<ReadingValue> {
        if let Some(text) = &self.text {
            return Some(ReadingValue::Text(text.clone()));
        }
        self.numbers.back().map(|n| ReadingValue::Number(*n))
    }

    /// Sum of the last `min(count, len)` samples divided by `count`.
    ///
    /// Dividing by the requested count (not the available count) dilutes
    /// short windows toward zero. Downstream consumers rely on this output.
    fn average(&self, count: usize) -> Option<f64> {
        if self.numbers.is_empty() {
            return None;
        }
        let take = count.min(self.numbers.len());
        let sum: f64 = self.numbers.iter().rev().take(take).sum();
        Some(sum / count as f64)
    }
}

/// What kind of write an update turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Numeric,
    Text,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Numeric => "numeric",
            UpdateKind::Text => "text",
        }
    }
}

/// Parse a raw submitted value as a finite number.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Process-wide reading store.
#[derive(Debug, Default)]
pub struct TimeSeriesStore {
    entries: Mutex<HashMap<ReadingKey, SeriesEntry>>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ReadingKey, SeriesEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a raw submitted value for `key`.
    ///
    /// Finite numbers are appended to the key's window; anything else is
    /// kept verbatim as the key's text value. Never fails.
    pub fn update(&self, key: &ReadingKey, raw: &str) -> UpdateKind {
        let now = Utc::now();
        let mut entries = self.entries();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| SeriesEntry::empty(now));

        entry.timestamp = entry.timestamp.max(now);

        match parse_number(raw) {
            Some(value) => {
                entry.numbers.push_back(value);
                entry.trim();
                entry.text = None;
                trace!(key = %key, value, window = entry.numbers.len(), "numeric sample stored");
                UpdateKind::Numeric
            }
            None => {
                debug!(key = %key, value = %raw, "non-numeric value stored as text");
                entry.text = Some(raw.to_string());
                UpdateKind::Text
            }
        }
    }

    /// Latest value: the text value if the last write was text, otherwise
    /// the newest numeric sample.
    pub fn latest(&self, key: &ReadingKey) -> Result<ReadingValue> {
        self.entries()
            .get(key)
            .and_then(SeriesEntry::latest)
            .ok_or_else(|| Error::not_found(key.as_str()))
    }

    /// Average over the last `count` numeric samples (see [`SeriesEntry`]
    /// for the dilution rule).
    pub fn average(&self, key: &ReadingKey, count: usize) -> Result<f64> {
        if count == 0 {
            return Err(Error::InvalidInput(
                "average window must be at least 1".to_string(),
            ));
        }
        self.entries()
            .get(key)
            .and_then(|e| e.average(count))
            .ok_or_else(|| Error::not_found(key.as_str()))
    }

    /// Time of the most recent write to `key`.
    pub fn timestamp(&self, key: &ReadingKey) -> Result<DateTime<Utc>> {
        self.entries()
            .get(key)
            .map(|e| e.timestamp)
            .ok_or_else(|| Error::not_found(key.as_str()))
    }

    /// Read a value and its timestamp under a single lock.
    ///
    /// `average = None` reads the latest value.
    pub fn read(
        &self,
        key: &ReadingKey,
        average: Option<usize>,
    ) -> Result<(ReadingValue, DateTime<Utc>)> {
        if average == Some(0) {
            return Err(Error::InvalidInput(
                "average window must be at least 1".to_string(),
            ));
        }
        let entries = self.entries();
        let entry = entries
            .get(key)
            .ok_or_else(|| Error::not_found(key.as_str()))?;
        let value = match average {
            None => entry.latest(),
            Some(count) => entry.average(count).map(ReadingValue::Number),
        };
        value
            .map(|v| (v, entry.timestamp))
            .ok_or_else(|| Error::not_found(key.as_str()))
    }

    /// Number of keys ever written.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Full copy of the store, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<ReadingKey, SeriesEntry> {
        self.entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the store's contents. Windows longer than [`WINDOW_SIZE`]
    /// are trimmed to their newest samples.
    pub fn restore(&self, snapshot: BTreeMap<ReadingKey, SeriesEntry>) {
        let mut entries = self.entries();
        entries.clear();
        for (key, mut entry) in snapshot {
            entry.trim();
            entries.insert(key, entry);
        }
    }
}

/// Files written by older releases store `null` for a key with no samples.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<VecDeque<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<VecDeque<f64>>::deserialize(deserializer)?.unwrap_or_default())
}

mod text_field {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(text: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(text.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Option::<String>::deserialize(deserializer)?;
        Ok(text.filter(|t| !t.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn key(raw: &str) -> ReadingKey {
        ReadingKey::parse(raw).unwrap()
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let store = TimeSeriesStore::new();
        let k = key("nothing/here");
        assert!(matches!(store.latest(&k), Err(Error::NotFound { .. })));
        assert!(matches!(store.average(&k, 3), Err(Error::NotFound { .. })));
        assert!(matches!(store.timestamp(&k), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_latest_numeric_formatting() {
        let store = TimeSeriesStore::new();
        let k = key("sensors/temp");
        assert_eq!(store.update(&k, "21.5"), UpdateKind::Numeric);
        assert_eq!(store.latest(&k).unwrap().to_string(), "21.500000");
    }

    #[test]
    fn test_window_keeps_newest_ten() {
        let store = TimeSeriesStore::new();
        let k = key("w");
        for i in 0..15 {
            store.update(&k, &i.to_string());
        }
        let snap = store.snapshot();
        let numbers: Vec<f64> = snap[&k].numbers.iter().copied().collect();
        assert_eq!(numbers, (5..15).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_average_divides_by_requested_count() {
        let store = TimeSeriesStore::new();
        let k = key("avg");
        for v in ["1", "2", "3"] {
            store.update(&k, v);
        }
        assert!((store.average(&k, 5).unwrap() - 1.2).abs() < 1e-12);
        assert!((store.average(&k, 3).unwrap() - 2.0).abs() < 1e-12);
        assert!((store.average(&k, 2).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_average_zero_window_is_invalid() {
        let store = TimeSeriesStore::new();
        let k = key("avg");
        store.update(&k, "4");
        assert!(matches!(store.average(&k, 0), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_average_without_numbers_is_not_found() {
        let store = TimeSeriesStore::new();
        let k = key("door");
        store.update(&k, "open");
        assert!(matches!(store.average(&k, 3), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_text_then_numeric_latest_follows_last_write() {
        let store = TimeSeriesStore::new();
        let k = key("mixed");
        assert_eq!(store.update(&k, "open"), UpdateKind::Text);
        assert_eq!(store.latest(&k).unwrap(), ReadingValue::Text("open".into()));

        store.update(&k, "3");
        assert_eq!(store.latest(&k).unwrap(), ReadingValue::Number(3.0));

        store.update(&k, "closed");
        assert_eq!(store.latest(&k).unwrap().to_string(), "closed");
    }

    #[test]
    fn test_non_finite_values_are_text() {
        let store = TimeSeriesStore::new();
        let k = key("weird");
        assert_eq!(store.update(&k, "NaN"), UpdateKind::Text);
        assert_eq!(store.update(&k, "inf"), UpdateKind::Text);
        assert_eq!(store.latest(&k).unwrap().to_string(), "inf");
    }

    #[test]
    fn test_timestamp_non_decreasing() {
        let store = TimeSeriesStore::new();
        let k = key("ts");
        store.update(&k, "1");
        let first = store.timestamp(&k).unwrap();
        store.update(&k, "2");
        let second = store.timestamp(&k).unwrap();
        assert!(second >= first);
    }

    #[test]
    fn test_read_returns_value_and_timestamp_together() {
        let store = TimeSeriesStore::new();
        let k = key("r");
        store.update(&k, "10");
        store.update(&k, "20");
        let (value, ts) = store.read(&k, Some(2)).unwrap();
        assert_eq!(value, ReadingValue::Number(15.0));
        assert_eq!(ts, store.timestamp(&k).unwrap());
        assert!(store.read(&k, Some(0)).is_err());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = TimeSeriesStore::new();
        store.update(&key("a"), "1");
        store.update(&key("a"), "2");
        store.update(&key("b"), "hello");

        let snap = store.snapshot();
        let restored = TimeSeriesStore::new();
        restored.restore(snap.clone());
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.latest(&key("b")).unwrap().to_string(), "hello");
    }

    #[test]
    fn test_restore_trims_oversized_window() {
        let mut snap = BTreeMap::new();
        snap.insert(
            key("big"),
            SeriesEntry {
                numbers: (0..25).map(|i| i as f64).collect(),
                text: None,
                timestamp: Utc::now(),
            },
        );
        let store = TimeSeriesStore::new();
        store.restore(snap);
        let entry = &store.snapshot()[&key("big")];
        assert_eq!(entry.numbers.len(), WINDOW_SIZE);
        assert_eq!(entry.numbers.front(), Some(&15.0));
    }

    #[test]
    fn test_entry_json_layout() {
        let entry = SeriesEntry {
            numbers: VecDeque::from(vec![1.0, 2.5]),
            text: None,
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["numbers"], serde_json::json!([1.0, 2.5]));
        assert_eq!(json["text"], serde_json::json!(""));

        let back: SeriesEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_entry_null_numbers_and_offset_timestamp() {
        let json = r#"{"numbers":null,"text":"open","timestamp":"2024-05-01T14:00:00.5+02:00"}"#;
        let entry: SeriesEntry = serde_json::from_str(json).unwrap();
        assert!(entry.numbers.is_empty());
        assert_eq!(entry.text.as_deref(), Some("open"));
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-05-01T12:00:00.500+00:00");
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        let store = Arc::new(TimeSeriesStore::new());
        let shared = key("busy");
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let own = key(&format!("writer{t}"));
                    let mut numeric = 0;
                    for i in 0..50 {
                        let raw = format!("{}", t * 100 + i);
                        if store.update(&shared, &raw) == UpdateKind::Numeric {
                            numeric += 1;
                        }
                        store.update(&own, &raw);
                        let len = store.snapshot()[&shared].numbers.len();
                        assert!(len <= WINDOW_SIZE);
                    }
                    numeric
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 8 * 50);

        let snapshot = store.snapshot();

        // Each writer's own key holds exactly its last ten writes.
        for t in 0..8 {
            let expected: Vec<f64> = (40..50).map(|i| (t * 100 + i) as f64).collect();
            let window: Vec<f64> = snapshot[&key(&format!("writer{t}"))]
                .numbers
                .iter()
                .copied()
                .collect();
            assert_eq!(window, expected);
        }

        // On the shared key, each writer's samples keep their write order.
        let window = &snapshot[&shared].numbers;
        assert_eq!(window.len(), WINDOW_SIZE);
        for t in 0..8 {
            let mine: Vec<f64> = window
                .iter()
                .copied()
                .filter(|v| (*v as i64) / 100 == t)
                .collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }

    proptest! {
        #[test]
        fn prop_window_holds_most_recent(values in proptest::collection::vec(-1e6f64..1e6, 1..40)) {
            let store = TimeSeriesStore::new();
            let k = key("prop");
            for v in &values {
                store.update(&k, &v.to_string());
            }
            let kept: Vec<f64> = store.snapshot()[&k].numbers.iter().copied().collect();
            let expected_len = values.len().min(WINDOW_SIZE);
            prop_assert_eq!(kept.len(), expected_len);
            prop_assert_eq!(&kept[..], &values[values.len() - expected_len..]);
        }

        #[test]
        fn prop_average_uses_requested_count(
            values in proptest::collection::vec(-1e3f64..1e3, 1..15),
            count in 1usize..20,
        ) {
            let store = TimeSeriesStore::new();
            let k = key("prop/avg");
            for v in &values {
                store.update(&k, &v.to_string());
            }
            let window: Vec<f64> = store.snapshot()[&k].numbers.iter().copied().collect();
            let take = count.min(window.len());
            let expected: f64 = window[window.len() - take..].iter().sum::<f64>() / count as f64;
            let got = store.average(&k, count).unwrap();
            prop_assert!((got - expected).abs() < 1e-9);
        }
    }
}
