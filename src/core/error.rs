//! Error types shared across layers.

use thiserror::Error;

/// Errors produced while encoding or decoding records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Input shorter than the record's fixed header.
    #[error("malformed record: need {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length for the schema.
        expected: usize,
        /// Length actually supplied.
        actual: usize,
    },

    /// Field name not present in the schema.
    #[error("unknown field: {0}")]
    UnknownField(&'static str),

    /// Value does not fit the field's width or signedness.
    #[error("value {value} out of range for field {field}")]
    FieldOutOfRange {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: i64,
    },

    /// Record too large for a single cluster entry.
    #[error("cluster entry of {0} bytes exceeds 255")]
    EntryTooLarge(usize),
}

/// Result alias for record operations.
pub type RecordResult<T> = Result<T, RecordError>;
