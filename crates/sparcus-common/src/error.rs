//! Error types for Sparcus.
//!
//! These are the errors a caller can see on the request path. Handler,
//! persistence and forwarding failures never reach a caller; they have
//! their own types in `sparcus-core`.
//!
//! Codes are stable and grouped by category:
//! - 10-19: invalid input
//! - 20-29: lookup failures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for Sparcus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown key on read.
    NotFound,
    /// Malformed request parameters.
    InvalidInput,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::InvalidInput => write!(f, "invalid_input"),
        }
    }
}

/// Unified error type for Sparcus.
#[derive(Error, Debug)]
pub enum Error {
    // Invalid input (10-19)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Lookup (20-29)
    #[error("key not found: {key}")]
    NotFound { key: String },
}

impl Error {
    /// Shorthand for a lookup failure on `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Returns the stable error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidInput(_) => 10,
            Error::NotFound { .. } => 20,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidInput(_) => ErrorCategory::InvalidInput,
            Error::NotFound { .. } => ErrorCategory::NotFound,
        }
    }

    /// HTTP status code used when this error reaches a caller.
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::NotFound => 404,
            ErrorCategory::InvalidInput => 400,
        }
    }
}

/// Structured error body for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Additional structured context (e.g. the key that was looked up).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();
        if let Error::NotFound { key } = err {
            context.insert("key".to_string(), serde_json::json!(key));
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_grouped_by_category() {
        assert_eq!(Error::InvalidInput("x".into()).code(), 10);
        assert_eq!(Error::not_found("a.b").code(), 20);
        assert_eq!(
            Error::InvalidInput("x".into()).category(),
            ErrorCategory::InvalidInput
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::not_found("k").http_status(), 404);
        assert_eq!(Error::InvalidInput("average".into()).http_status(), 400);
    }

    #[test]
    fn test_not_found_message_names_key() {
        let err = Error::not_found("sensors.kitchen.temp");
        assert_eq!(err.to_string(), "key not found: sensors.kitchen.temp");
    }

    #[test]
    fn test_structured_error_context() {
        let err = Error::not_found("sensors.temp");
        let structured = StructuredError::from(&err).with_context("route", "get");
        assert_eq!(structured.code, 20);
        assert_eq!(structured.category, ErrorCategory::NotFound);
        assert_eq!(structured.context["key"], serde_json::json!("sensors.temp"));

        let json = structured.to_json();
        assert!(json.contains("\"category\":\"not_found\""));
        assert!(json.contains("\"route\":\"get\""));
    }
}
