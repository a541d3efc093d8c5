// error.rs — Error types for record loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating a configuration record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record file could not be read.
    #[error("failed to read record at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record is not valid JSON (or not a JSON object).
    #[error("record at '{source_path}' is not a valid JSON document: {reason}")]
    Malformed { source_path: String, reason: String },

    /// The `$schema` tag is missing or names a different record type.
    #[error("record at '{source_path}' has schema '{found}', expected '{expected}'")]
    SchemaMismatch {
        source_path: String,
        expected: &'static str,
        found: String,
    },

    /// A field required by presence semantics is missing or empty.
    #[error("record at '{source_path}' is missing required field '{field}'")]
    MissingField { source_path: String, field: String },
}
