//! Record sink: canonical + derived records → delimited text.
//!
//! The output has a fixed column order:
//!
//! 1. canonical fields ([`CANONICAL_COLUMNS`]),
//! 2. derived fields ([`DERIVED_COLUMNS`]),
//! 3. passthrough fields, sorted by original label.
//!
//! The passthrough set is fixed when the sink is created (it comes from the
//! input header), so every row has the same shape. Rows are flushed to the
//! underlying writer every `flush_rows` rows; a failed write or flush is
//! returned to the caller, since a truncated file would otherwise look
//! complete.

use std::io::Write;

use crate::error::StreamError;
use crate::models::{CanonicalRecord, DerivedFields};

pub const CANONICAL_COLUMNS: [&str; 10] = [
    "track_id",
    "title",
    "artists",
    "album",
    "genre",
    "duration",
    "popularity",
    "danceability",
    "energy",
    "explicit",
];

pub const DERIVED_COLUMNS: [&str; 5] = [
    "duration_seconds",
    "popularity_tier",
    "danceability_label",
    "energy_label",
    "content_label",
];

/// Sink tuning.
#[derive(Debug, Clone, Copy)]
pub struct SinkOptions {
    pub delimiter: u8,
    /// Rows written between flushes of the underlying writer.
    pub flush_rows: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            flush_rows: 500,
        }
    }
}

/// Incremental writer of transformed records.
pub struct RecordSink<W: Write> {
    writer: csv::Writer<W>,
    passthrough: Vec<String>,
    flush_rows: usize,
    pending: usize,
    rows_written: u64,
}

impl<W: Write> RecordSink<W> {
    /// Create a sink and write the header row.
    pub fn new(inner: W, passthrough: Vec<String>, options: SinkOptions) -> Result<Self, StreamError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(options.delimiter)
            .from_writer(inner);

        writer.write_record(
            CANONICAL_COLUMNS
                .iter()
                .chain(DERIVED_COLUMNS.iter())
                .copied()
                .chain(passthrough.iter().map(String::as_str)),
        )?;

        Ok(Self {
            writer,
            passthrough,
            flush_rows: options.flush_rows.max(1),
            pending: 0,
            rows_written: 0,
        })
    }

    pub fn write(&mut self, record: &CanonicalRecord, derived: &DerivedFields) -> Result<(), StreamError> {
        let artists = record.artists.join(";");
        let seconds = derived.duration_seconds.to_string();
        let fixed: [&str; 15] = [
            &record.track_id,
            &record.title,
            &artists,
            &record.album,
            &record.genre,
            &record.duration,
            &record.popularity,
            &record.danceability,
            &record.energy,
            &record.explicit,
            &seconds,
            &derived.popularity_tier,
            &derived.danceability_label,
            &derived.energy_label,
            derived.content_label.as_str(),
        ];

        let passthrough = self
            .passthrough
            .iter()
            .map(|label| record.passthrough.get(label).map_or("", String::as_str));
        self.writer.write_record(fixed.iter().copied().chain(passthrough))?;

        self.rows_written += 1;
        self.pending += 1;
        if self.pending >= self.flush_rows {
            self.writer.flush()?;
            self.pending = 0;
        }
        Ok(())
    }

    /// Passthrough columns, in output order.
    pub fn passthrough(&self) -> &[String] {
        &self.passthrough
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush everything and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W, StreamError> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| StreamError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentLabel;
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::io;
    use std::rc::Rc;

    fn sample() -> (CanonicalRecord, DerivedFields) {
        let mut passthrough = BTreeMap::new();
        passthrough.insert("tempo".to_string(), "120".to_string());
        passthrough.insert("Key".to_string(), "C#".to_string());
        (
            CanonicalRecord {
                track_id: "t1".to_string(),
                title: "Hello, World".to_string(),
                artists: vec!["A".to_string(), "B".to_string()],
                album: "Alb".to_string(),
                genre: "pop".to_string(),
                duration: "3:45".to_string(),
                popularity: "80".to_string(),
                danceability: "0.5".to_string(),
                energy: "70".to_string(),
                explicit: "true".to_string(),
                passthrough,
            },
            DerivedFields {
                duration_seconds: 225,
                popularity_tier: "High".to_string(),
                danceability_label: "Danceable".to_string(),
                energy_label: "High".to_string(),
                content_label: ContentLabel::Explicit,
            },
        )
    }

    #[test]
    fn test_column_order_and_quoting() {
        let (record, derived) = sample();
        let mut sink = RecordSink::new(
            Vec::new(),
            vec!["Key".to_string(), "tempo".to_string()],
            SinkOptions::default(),
        )
        .unwrap();
        sink.write(&record, &derived).unwrap();
        assert_eq!(sink.rows_written(), 1);
        let out = String::from_utf8(sink.finish().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "track_id,title,artists,album,genre,duration,popularity,danceability,energy,explicit,\
             duration_seconds,popularity_tier,danceability_label,energy_label,content_label,Key,tempo"
        );
        assert_eq!(
            lines[1],
            "t1,\"Hello, World\",A;B,Alb,pop,3:45,80,0.5,70,true,225,High,Danceable,High,Explicit,C#,120"
        );
    }

    #[test]
    fn test_missing_passthrough_written_empty() {
        let (mut record, derived) = sample();
        record.passthrough.clear();
        let mut sink = RecordSink::new(Vec::new(), vec!["tempo".to_string()], SinkOptions::default())
            .unwrap();
        sink.write(&record, &derived).unwrap();
        let out = String::from_utf8(sink.finish().unwrap()).unwrap();
        assert!(out.lines().nth(1).unwrap().ends_with("Explicit,"));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_propagates() {
        let (record, derived) = sample();
        let options = SinkOptions {
            flush_rows: 1,
            ..SinkOptions::default()
        };
        // The header only reaches the writer on the first flush.
        let mut sink = RecordSink::new(FailingWriter, Vec::new(), options).unwrap();
        match sink.write(&record, &derived) {
            Err(StreamError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected I/O error, got {:?}", other.map(|_| ())),
        }
    }

    #[derive(Clone, Default)]
    struct CountingWriter {
        flushes: Rc<Cell<usize>>,
        bytes: Rc<Cell<usize>>,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.set(self.bytes.get() + buf.len());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_flushes_every_flush_rows() {
        let (record, derived) = sample();
        let counter = CountingWriter::default();
        let options = SinkOptions {
            flush_rows: 2,
            ..SinkOptions::default()
        };
        let mut sink = RecordSink::new(counter.clone(), Vec::new(), options).unwrap();
        let base = counter.flushes.get();

        sink.write(&record, &derived).unwrap();
        assert_eq!(counter.flushes.get(), base);
        assert_eq!(counter.bytes.get(), 0);

        sink.write(&record, &derived).unwrap();
        assert_eq!(counter.flushes.get(), base + 1);
        let after_two = counter.bytes.get();
        assert!(after_two > 0);

        sink.write(&record, &derived).unwrap();
        assert_eq!(counter.flushes.get(), base + 1);
        assert_eq!(counter.bytes.get(), after_two);

        sink.finish().unwrap();
        assert_eq!(counter.flushes.get(), base + 2);
        assert!(counter.bytes.get() > after_two);
    }
}
