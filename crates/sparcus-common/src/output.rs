//! Reading values and the response formats of the `/get` route.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places used whenever a numeric reading is rendered as text.
pub const NUMBER_PRECISION: usize = 6;

/// Format a numeric sample with the fixed reading precision.
pub fn format_number(value: f64) -> String {
    format!("{:.*}", NUMBER_PRECISION, value)
}

/// A value read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Number(n) => write!(f, "{}", format_number(*n)),
            ReadingValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Supported response formats for `/get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Bare value (default)
    #[default]
    Text,

    /// `{"value": <v>, "timestamp": <unix>}`
    Json,

    /// `<unix>,<v>`
    Csv,

    /// `<unix>|<v>`
    Pipe,
}

impl OutputFormat {
    /// Resolve the `format` query parameter. Unknown names fall back to text.
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("json") => OutputFormat::Json,
            Some("csv") => OutputFormat::Csv,
            Some("pipe") => OutputFormat::Pipe,
            _ => OutputFormat::Text,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Csv => "text/csv",
            OutputFormat::Text | OutputFormat::Pipe => "text/plain",
        }
    }

    /// Render a reading and its unix timestamp in this format.
    pub fn render(&self, value: &ReadingValue, timestamp: i64) -> String {
        match self {
            OutputFormat::Json => {
                let rendered = match value {
                    ReadingValue::Number(n) => format_number(*n),
                    ReadingValue::Text(s) => {
                        serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
                    }
                };
                format!(r#"{{"value": {}, "timestamp": {}}}"#, rendered, timestamp)
            }
            OutputFormat::Csv => format!("{},{}", timestamp, value),
            OutputFormat::Pipe => format!("{}|{}", timestamp, value),
            OutputFormat::Text => value.to_string(),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Pipe => write!(f, "pipe"),
        }
    }
}
