//! Transform driver: record source → normalizer → feature engine → sink.
//!
//! One streaming pass. Only the current record is held in memory; the sink
//! flushes on its own interval. Soft warnings are logged at debug level and
//! counted per field in the returned [`TransformSummary`].
//!
//! `delimiter` applies to the input only. Output is always comma-delimited,
//! which is what the loader reads.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::features::FeatureEngine;
use crate::models::Warning;
use crate::normalize::Normalizer;
use crate::sink::{RecordSink, SinkOptions};
use crate::source::RecordSource;

/// Field delimiter of transformed output.
pub const OUTPUT_DELIMITER: u8 = b',';

#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    /// Input field delimiter.
    pub delimiter: u8,
    pub flush_rows: usize,
    /// Log a progress line every this many rows (0 disables).
    pub progress_every: u64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            flush_rows: 500,
            progress_every: 50_000,
        }
    }
}

/// Outcome of a transform pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub rows: u64,
    pub warnings: u64,
    pub warnings_by_field: BTreeMap<String, u64>,
}

/// Stream `reader` through the pipeline into `writer`.
///
/// Returns the summary and the writer once every row has been flushed. A
/// parse or I/O error aborts the pass; rows already handed to the sink may
/// have reached `writer`, so callers must discard partial output.
pub fn transform_stream<R: BufRead, W: Write>(
    reader: R,
    writer: W,
    normalizer: &Normalizer,
    engine: &FeatureEngine,
    options: &TransformOptions,
) -> Result<(TransformSummary, W), StreamError> {
    let source = RecordSource::with_delimiter(reader, options.delimiter)?;
    let passthrough = normalizer.passthrough_labels(source.labels());
    debug!(
        columns = source.labels().len(),
        passthrough = passthrough.len(),
        "transform header read"
    );

    let mut sink = RecordSink::new(
        writer,
        passthrough,
        SinkOptions {
            delimiter: OUTPUT_DELIMITER,
            flush_rows: options.flush_rows,
        },
    )?;
    let mut summary = TransformSummary::default();

    for raw in source {
        let raw = raw?;
        let record = normalizer.normalize(&raw);
        let mut derivation = engine.derive(&record);
        if let Some(warning) = unplaced_fields(&record.passthrough, sink.passthrough()) {
            derivation.warnings.push(warning);
        }

        for warning in &derivation.warnings {
            debug!(
                line = raw.line,
                field = warning.field,
                value = %warning.value,
                "{}",
                warning.message
            );
            *summary
                .warnings_by_field
                .entry(warning.field.to_string())
                .or_insert(0) += 1;
        }
        summary.warnings += derivation.warnings.len() as u64;

        sink.write(&record, &derivation.fields)?;
        summary.rows += 1;

        if options.progress_every > 0 && summary.rows % options.progress_every == 0 {
            info!(rows = summary.rows, warnings = summary.warnings, "transform progress");
        }
    }

    let writer = sink.finish()?;
    info!(rows = summary.rows, warnings = summary.warnings, "transform finished");
    Ok((summary, writer))
}

/// Warning for non-empty fields with no output column, i.e. values past the
/// end of the header. `columns` is sorted.
fn unplaced_fields(passthrough: &BTreeMap<String, String>, columns: &[String]) -> Option<Warning> {
    let dropped: Vec<&str> = passthrough
        .iter()
        .filter(|&(label, value)| !value.is_empty() && columns.binary_search(label).is_err())
        .map(|(_, value)| value.as_str())
        .collect();
    if dropped.is_empty() {
        return None;
    }
    Some(Warning {
        field: "row",
        value: dropped.join(","),
        message: format!("{} field(s) beyond the header dropped", dropped.len()),
    })
}
