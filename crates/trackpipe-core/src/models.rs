//! Core data models used throughout trackpipe.
//!
//! These types represent the records that flow through the transform
//! pipeline (raw → canonical → derived) and the rows that the batch loader
//! hands to a [`Store`](crate::store::Store).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

/// One record as read from a delimited-text stream, before normalization.
///
/// Labels are shared by every record of a stream; values are positional.
/// A record may carry fewer values than there are labels (short rows).
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based physical line on which the record starts.
    pub line: u64,
    labels: Arc<[String]>,
    values: Vec<String>,
}

impl RawRecord {
    pub fn new(line: u64, labels: Arc<[String]>, values: Vec<String>) -> Self {
        Self {
            line,
            labels,
            values,
        }
    }

    /// Value for an exact column label, if the record has it.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// Iterate `(label, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels
            .iter()
            .zip(self.values.iter())
            .map(|(l, v)| (l.as_str(), v.as_str()))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A record mapped onto the fixed canonical schema.
///
/// Every field is populated. Numeric fields are kept as trimmed text: the
/// normalizer never parses, so malformed values reach the feature engine
/// (which degrades them with a warning) and the loader (which rejects them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub track_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub genre: String,
    pub duration: String,
    pub popularity: String,
    pub danceability: String,
    pub energy: String,
    pub explicit: String,
    /// Columns not covered by the synonym table, keyed by original label.
    pub passthrough: BTreeMap<String, String>,
}

/// Explicit-content label derived from the source's explicit indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContentLabel {
    Explicit,
    Clean,
}

impl ContentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "Explicit",
            Self::Clean => "Clean",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Explicit" => Some(Self::Explicit),
            "Clean" => Some(Self::Clean),
            _ => None,
        }
    }
}

/// Attributes computed from a [`CanonicalRecord`] by the feature engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFields {
    pub duration_seconds: i64,
    pub popularity_tier: String,
    pub danceability_label: String,
    pub energy_label: String,
    pub content_label: ContentLabel,
}

/// A lossy default applied while deriving a record's fields.
///
/// Warnings never reject a row; they travel with the record so the caller
/// can log, count, or ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Canonical field the warning is about (e.g. `"duration"`).
    pub field: &'static str,
    /// The offending raw value.
    pub value: String,
    pub message: String,
}

/// A fully coerced row, ready to be written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRow {
    pub track_id: String,
    pub title: String,
    pub artists: String,
    pub album: String,
    pub genre: String,
    pub duration_seconds: i64,
    pub popularity: f64,
    pub popularity_tier: String,
    pub danceability: f64,
    pub danceability_label: String,
    pub energy: f64,
    pub energy_label: String,
    pub content_label: ContentLabel,
    /// Passthrough columns serialized as a JSON object.
    pub extra_json: String,
}

/// An ordered group of rows committed in a single transaction.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 0-based position of the batch within its source stream.
    pub index: u64,
    pub rows: Vec<TrackRow>,
}

/// Durable load progress for one source object.
///
/// Written in the same transaction as the batch it describes, so the
/// checkpoint never runs ahead of (or behind) the committed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCheckpoint {
    pub source_key: String,
    pub batch_size: u64,
    /// First batch index not yet committed.
    pub next_batch: u64,
    pub rows_committed: u64,
    pub completed: bool,
    pub updated_at: i64,
}

/// One flat result row of an analytical query, in column order.
pub type QueryRow = serde_json::Map<String, serde_json::Value>;

/// Ordered result rows of an analytical query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
