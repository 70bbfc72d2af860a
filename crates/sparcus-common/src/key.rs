//! Reading identity types.
//!
//! A request addresses a reading by a slash-separated hierarchical path
//! (`sensors/kitchen/temp`). The store indexes readings by the dotted,
//! case-folded form of that path (`sensors.kitchen.temp`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Lower-cased, slash-separated request path with the route prefix removed.
///
/// This is the "un-normalized" form handed to handlers as `EVENT_PATH` and
/// used for pub/sub topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestPath(String);

impl RequestPath {
    /// Parse a raw path (route prefix already stripped).
    ///
    /// Leading and trailing slashes are dropped and the path is case-folded.
    /// An empty path is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let path = raw.trim_matches('/').to_lowercase();
        if path.is_empty() {
            return Err(Error::InvalidInput("empty reading path".to_string()));
        }
        Ok(RequestPath(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments usable for directory matching.
    ///
    /// Empty, `.` and `..` segments are skipped so the result can never
    /// climb out of the directory it is joined onto.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
    }

    /// The dotted store key for this path.
    pub fn key(&self) -> ReadingKey {
        ReadingKey(self.0.replace('/', "."))
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized, dotted reading key (`sensors.kitchen.temp`).
///
/// Keys are opaque to the store; the hierarchy only matters for handler
/// matching, which works on [`RequestPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingKey(String);

impl ReadingKey {
    /// Normalize a raw slash-separated path into a key.
    pub fn parse(raw: &str) -> Result<Self> {
        RequestPath::parse(raw).map(|p| p.key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ReadingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
