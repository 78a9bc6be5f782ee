//! Error types for the streaming pipeline.
//!
//! Stream-level failures ([`ParseError`], I/O) terminate the phase that hit
//! them. Row-level failures ([`RowCoercionError`]) are reported per record
//! and recovered by the caller. Soft warnings are not errors at all; see
//! [`Warning`](crate::models::Warning).

use std::io;

use thiserror::Error;

/// A record whose quoting could not be parsed.
///
/// The record source stops at the first parse error instead of trying to
/// resynchronize, since skipping forward would guess at record boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}: {reason} (record: {raw:?})")]
pub struct ParseError {
    /// 1-based line where the offending record starts.
    pub line: u64,
    /// Raw text of the record as read so far.
    pub raw: String,
    pub reason: String,
}

/// Failure of a streaming read or write.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<csv::Error> for StreamError {
    fn from(err: csv::Error) -> Self {
        Self::Io(io::Error::from(err))
    }
}

/// A transformed row that does not fit the store's column types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: column '{column}' rejected value {value:?}: {reason}")]
pub struct RowCoercionError {
    pub line: u64,
    pub column: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// An invalid threshold table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("threshold table '{0}' has no bands")]
    Empty(String),

    #[error("threshold table '{0}' must start at 0")]
    DoesNotStartAtZero(String),

    #[error("threshold table '{table}': band '{label}' starts at {min}, outside 0..=100 or not ascending")]
    BadBound {
        table: String,
        label: String,
        min: String,
    },

    #[error("threshold table '{table}': label {label:?} is empty, repeated, or reserved")]
    BadLabel { table: String, label: String },
}
