//! Bounded history of handler executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of events retained.
pub const DEFAULT_MAX_EVENTS: usize = 250;

/// Record of one handler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dotted key of the write that fired the handler.
    pub uri: String,
    /// Full path of the handler executable.
    pub script: String,
    /// Start time.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Exit status; `None` when the handler never ran or was killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    /// Output was cut at the capture limit.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub duration_ms: u64,
    /// Launch or capture failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// A fresh event for `script` firing on `uri`, with no outcome yet.
    pub fn started(uri: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            script: script.into(),
            timestamp: Utc::now(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
            truncated: false,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Append-only ring of the most recent events.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an event at the tail, evicting the oldest when full.
    pub fn append(&self, event: Event) {
        let mut events = self.events();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// All retained events, oldest first.
    pub fn all(&self) -> Vec<Event> {
        self.events().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Replace the log's contents, keeping the newest `capacity` events.
    pub fn restore(&self, restored: Vec<Event>) {
        let skip = restored.len().saturating_sub(self.capacity);
        let mut events = self.events();
        events.clear();
        events.extend(restored.into_iter().skip(skip));
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(n: usize) -> Event {
        Event::started(format!("key.{n}"), format!("/handlers/h{n}"))
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let log = EventLog::new(DEFAULT_MAX_EVENTS);
        for n in 0..=DEFAULT_MAX_EVENTS {
            log.append(event(n));
        }
        let all = log.all();
        assert_eq!(all.len(), DEFAULT_MAX_EVENTS);
        assert_eq!(all[0].uri, "key.1");
        assert_eq!(all.last().unwrap().uri, format!("key.{DEFAULT_MAX_EVENTS}"));
        assert!(all.iter().all(|e| e.uri != "key.0"));
    }

    #[test]
    fn test_all_is_oldest_first() {
        let log = EventLog::new(5);
        for n in 0..3 {
            log.append(event(n));
        }
        let uris: Vec<_> = log.all().into_iter().map(|e| e.uri).collect();
        assert_eq!(uris, vec!["key.0", "key.1", "key.2"]);
    }

    #[test]
    fn test_restore_keeps_newest() {
        let log = EventLog::new(3);
        log.restore((0..5).map(event).collect());
        let uris: Vec<_> = log.all().into_iter().map(|e| e.uri).collect();
        assert_eq!(uris, vec!["key.2", "key.3", "key.4"]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let log = EventLog::new(0);
        log.append(event(1));
        log.append(event(2));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_legacy_event_json_defaults() {
        let json = r#"{"uri":"a.b","script":"/h/x","timestamp":"2024-01-01T00:00:00Z","stdout":"hi\n","stderr":""}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.stdout, "hi\n");
        assert_eq!(event.exit_code, None);
        assert!(!event.timed_out);
        assert!(!event.truncated);
        assert!(event.error.is_none());
    }

    #[test]
    fn test_concurrent_appends_stay_bounded() {
        let log = Arc::new(EventLog::new(50));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for n in 0..100 {
                        log.append(event(t * 1000 + n));
                        assert!(log.len() <= 50);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }
}
