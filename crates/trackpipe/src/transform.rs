//! Transform command: raw object → transformed object.
//!
//! The raw object is downloaded to an anonymous temp file, streamed through
//! [`transform_stream`] into a named temp file, and uploaded to the
//! transformed bucket under [`transformed_key`]. All of it runs on the
//! blocking pool; nothing is uploaded unless the pass completes.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use trackpipe_core::features::FeatureEngine;
use trackpipe_core::normalize::{Normalizer, SynonymTable};
use trackpipe_core::transform::{transform_stream, TransformOptions};

use crate::config::Config;
use crate::event::transformed_key;
use crate::object_store::{ObjectRef, ObjectStore};

/// Result of one transform invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub status: &'static str,
    pub input_bucket: String,
    pub input_key: String,
    pub output_bucket: String,
    pub output_key: String,
    pub rows: u64,
    pub warnings: u64,
    pub warnings_by_field: BTreeMap<String, u64>,
}

pub async fn run_transform(
    config: &Config,
    objects: Arc<dyn ObjectStore>,
    input: ObjectRef,
) -> Result<TransformReport> {
    let engine = FeatureEngine::new(config.features.tables()?);
    let normalizer = Normalizer::new(SynonymTable::default());
    let options = TransformOptions {
        delimiter: config.transform.delimiter_byte(),
        flush_rows: config.transform.flush_rows,
        ..TransformOptions::default()
    };
    let output = ObjectRef::new(
        config.objects.transformed_bucket.clone(),
        transformed_key(&input.key),
    );

    info!(%input, %output, "transform started");
    tokio::task::spawn_blocking(move || -> Result<TransformReport> {
        let mut raw = tempfile::tempfile().context("Failed to create temp file")?;
        let bytes = objects.download(&input, &mut raw)?;
        raw.seek(SeekFrom::Start(0))?;
        info!(%input, bytes, "raw object downloaded");

        let staged = tempfile::NamedTempFile::new().context("Failed to create temp file")?;
        let (summary, mut writer) = transform_stream(
            BufReader::new(raw),
            BufWriter::new(staged.as_file()),
            &normalizer,
            &engine,
            &options,
        )
        .with_context(|| format!("Failed to transform {input}"))?;
        writer.flush()?;
        drop(writer);

        let uploaded = objects.upload(&output, staged.path())?;
        info!(
            %output,
            rows = summary.rows,
            warnings = summary.warnings,
            bytes = uploaded,
            "transform completed"
        );

        Ok(TransformReport {
            status: "ok",
            input_bucket: input.bucket,
            input_key: input.key,
            output_bucket: output.bucket,
            output_key: output.key,
            rows: summary.rows,
            warnings: summary.warnings,
            warnings_by_field: summary.warnings_by_field,
        })
    })
    .await
    .context("transform task panicked")?
}
