//! Sparcus common types and errors.
//!
//! This crate provides foundational types shared across sparcus-core modules:
//! - Reading identity (request paths and dotted keys)
//! - The unified error taxonomy
//! - Reading values and `/get` output formats

pub mod error;
pub mod key;
pub mod output;

pub use error::{Error, ErrorCategory, Result, StructuredError};
pub use key::{ReadingKey, RequestPath};
pub use output::{format_number, OutputFormat, ReadingValue};
