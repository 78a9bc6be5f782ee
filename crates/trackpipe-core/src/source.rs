//! Record source: lazy, strict parsing of delimited text.
//!
//! [`RecordSource`] wraps any [`BufRead`] and yields one [`RawRecord`] per
//! logical row. It reads one physical line at a time and only keeps the
//! current record in memory, so memory use is bounded by the longest record,
//! not by the size of the stream.
//!
//! # Format
//!
//! - The first non-blank line is the header; a UTF-8 BOM on it is dropped.
//! - Fields are separated by a single-byte delimiter (default `,`).
//! - A field that starts with `"` is quoted: it may contain the delimiter,
//!   line breaks, and doubled quotes (`""` → `"`).
//! - `\n` and `\r\n` line endings are accepted; the final line may lack one.
//! - Blank lines between records are skipped.
//!
//! # Errors
//!
//! An unterminated quoted field, or anything other than a delimiter or line
//! end after a closing quote, yields a [`ParseError`] carrying the line where
//! the record started and its raw text. The iterator is fused after any
//! error: there is no attempt to find the next record boundary.
//!
//! ```rust
//! use trackpipe_core::source::RecordSource;
//!
//! let input = "name,artist\n\"Hello, World\",Someone\n";
//! let mut source = RecordSource::new(input.as_bytes()).unwrap();
//! let record = source.next().unwrap().unwrap();
//! assert_eq!(record.get("name"), Some("Hello, World"));
//! assert!(source.next().is_none());
//! ```

use std::io::BufRead;
use std::sync::Arc;

use crate::error::{ParseError, StreamError};
use crate::models::RawRecord;

const BOM: char = '\u{feff}';

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldState {
    /// At the first character of a field.
    Start,
    Unquoted,
    Quoted,
    /// Just read a `"` inside a quoted field.
    QuoteSeen,
}

/// Lazy iterator of [`RawRecord`]s over a delimited-text stream.
pub struct RecordSource<R> {
    reader: R,
    delimiter: char,
    labels: Arc<[String]>,
    /// Physical lines consumed so far.
    line: u64,
    buf: String,
    finished: bool,
}

impl<R: BufRead> RecordSource<R> {
    /// Create a comma-delimited source and read its header row.
    pub fn new(reader: R) -> Result<Self, StreamError> {
        Self::with_delimiter(reader, b',')
    }

    /// Create a source with a custom single-byte delimiter.
    ///
    /// An empty stream produces a source with no labels and no records.
    pub fn with_delimiter(reader: R, delimiter: u8) -> Result<Self, StreamError> {
        let mut source = Self {
            reader,
            delimiter: char::from(delimiter),
            labels: Arc::from(Vec::new()),
            line: 0,
            buf: String::new(),
            finished: false,
        };

        match source.read_fields()? {
            Some((_, mut header)) => {
                if let Some(first) = header.first_mut() {
                    if first.starts_with(BOM) {
                        first.remove(0);
                    }
                }
                source.labels = Arc::from(header);
            }
            None => source.finished = true,
        }

        Ok(source)
    }

    /// Column labels from the header row.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Read the next logical record as `(start_line, fields)`.
    fn read_fields(&mut self) -> Result<Option<(u64, Vec<String>)>, StreamError> {
        // Skip blank lines.
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            if !split_terminator(&self.buf).0.is_empty() {
                break;
            }
        }

        let start_line = self.line;
        let mut raw = String::new();
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut state = FieldState::Start;

        loop {
            let (content, terminator) = split_terminator(&self.buf);
            raw.push_str(content);

            for c in content.chars() {
                state = match state {
                    FieldState::Start if c == '"' => FieldState::Quoted,
                    FieldState::Start | FieldState::Unquoted if c == self.delimiter => {
                        fields.push(std::mem::take(&mut field));
                        FieldState::Start
                    }
                    FieldState::Start | FieldState::Unquoted => {
                        field.push(c);
                        FieldState::Unquoted
                    }
                    FieldState::Quoted if c == '"' => FieldState::QuoteSeen,
                    FieldState::Quoted => {
                        field.push(c);
                        FieldState::Quoted
                    }
                    FieldState::QuoteSeen if c == '"' => {
                        field.push('"');
                        FieldState::Quoted
                    }
                    FieldState::QuoteSeen if c == self.delimiter => {
                        fields.push(std::mem::take(&mut field));
                        FieldState::Start
                    }
                    FieldState::QuoteSeen => {
                        return Err(ParseError {
                            line: start_line,
                            raw,
                            reason: format!("unexpected character {:?} after closing quote", c),
                        }
                        .into());
                    }
                };
            }

            if state != FieldState::Quoted {
                fields.push(field);
                return Ok(Some((start_line, fields)));
            }

            // Inside a quoted field: the line break belongs to the value.
            if terminator.is_empty() {
                return Err(unterminated(start_line, raw));
            }
            field.push_str(terminator);
            raw.push_str(terminator);

            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Err(unterminated(start_line, raw));
            }
            self.line += 1;
        }
    }

    fn to_record(&self, line: u64, values: Vec<String>) -> RawRecord {
        if values.len() <= self.labels.len() {
            return RawRecord::new(line, self.labels.clone(), values);
        }

        // Extra fields get positional labels; the transform driver warns about them.
        let labels: Vec<String> = self
            .labels
            .iter()
            .cloned()
            .chain((self.labels.len()..values.len()).map(|i| format!("column_{}", i + 1)))
            .collect();
        RawRecord::new(line, Arc::from(labels), values)
    }
}

impl<R: BufRead> Iterator for RecordSource<R> {
    type Item = Result<RawRecord, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_fields() {
            Ok(Some((line, values))) => Some(Ok(self.to_record(line, values))),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Split a physical line into its content and its line terminator.
fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

fn unterminated(line: u64, raw: String) -> StreamError {
    ParseError {
        line,
        raw,
        reason: "unterminated quoted field".to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &str) -> Vec<Result<RawRecord, StreamError>> {
        RecordSource::new(input.as_bytes()).unwrap().collect()
    }

    fn values(record: &RawRecord) -> Vec<&str> {
        record.iter().map(|(_, v)| v).collect()
    }

    #[test]
    fn test_header_and_rows() {
        let records = collect("a,b,c\n1,2,3\n4,5,6\n");
        assert_eq!(records.len(), 2);
        let first = records[0].as_ref().unwrap();
        assert_eq!(first.labels(), &["a", "b", "c"]);
        assert_eq!(values(first), vec!["1", "2", "3"]);
        assert_eq!(first.line, 2);
        assert_eq!(records[1].as_ref().unwrap().line, 3);
    }

    #[test]
    fn test_missing_trailing_newline() {
        let records = collect("a,b\n1,2");
        assert_eq!(records.len(), 1);
        assert_eq!(values(records[0].as_ref().unwrap()), vec!["1", "2"]);
    }

    #[test]
    fn test_quoted_delimiter_and_doubled_quotes() {
        let records = collect("title,artist\n\"Hello, \"\"World\"\"\",x\n");
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.get("title"), Some("Hello, \"World\""));
        assert_eq!(record.get("artist"), Some("x"));
    }

    #[test]
    fn test_embedded_newline_in_quotes() {
        let records = collect("a,b\n\"line one\nline two\",2\n3,4\n");
        assert_eq!(records.len(), 2);
        let first = records[0].as_ref().unwrap();
        assert_eq!(first.get("a"), Some("line one\nline two"));
        assert_eq!(first.line, 2);
        assert_eq!(records[1].as_ref().unwrap().line, 4);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let records = collect("a,b\r\n1,2\r\n\r\n3,4\r\n");
        assert_eq!(records.len(), 2);
        assert_eq!(values(records[1].as_ref().unwrap()), vec!["3", "4"]);
    }

    #[test]
    fn test_bom_stripped_from_header() {
        let records = collect("\u{feff}song,artist\nx,y\n");
        assert_eq!(records[0].as_ref().unwrap().get("song"), Some("x"));
    }

    #[test]
    fn test_trailing_empty_field() {
        let records = collect("a,b,c\n1,2,\n");
        assert_eq!(values(records[0].as_ref().unwrap()), vec!["1", "2", ""]);
    }

    #[test]
    fn test_short_and_long_rows() {
        let records = collect("a,b\n1\n1,2,3\n");
        let short = records[0].as_ref().unwrap();
        assert_eq!(short.get("a"), Some("1"));
        assert_eq!(short.get("b"), None);
        let long = records[1].as_ref().unwrap();
        assert_eq!(long.get("column_3"), Some("3"));
    }

    #[test]
    fn test_unterminated_quote_is_error_and_fuses() {
        let mut source = RecordSource::new("a,b\n1,2\n\"open,3\n4,5\n".as_bytes()).unwrap();
        assert!(source.next().unwrap().is_ok());
        match source.next().unwrap() {
            Err(StreamError::Parse(e)) => {
                assert_eq!(e.line, 3);
                assert!(e.raw.starts_with("\"open,3"));
                assert!(e.reason.contains("unterminated"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(source.next().is_none());
    }

    #[test]
    fn test_garbage_after_closing_quote() {
        let records = collect("a,b\n\"x\"y,2\n");
        match &records[0] {
            Err(StreamError::Parse(e)) => {
                assert_eq!(e.line, 2);
                assert_eq!(e.raw, "\"x\"y,2");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_delimiter() {
        let source = RecordSource::with_delimiter("a;b\n\"1;1\";2\n".as_bytes(), b';').unwrap();
        let records: Vec<_> = source.collect();
        assert_eq!(records[0].as_ref().unwrap().get("a"), Some("1;1"));
    }

    #[test]
    fn test_empty_input() {
        let mut source = RecordSource::new("".as_bytes()).unwrap();
        assert!(source.labels().is_empty());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_io_error() {
        let bytes: &[u8] = b"a\n\xff\xfe\n";
        let mut source = RecordSource::new(bytes).unwrap();
        assert!(matches!(source.next(), Some(Err(StreamError::Io(_)))));
    }
}
