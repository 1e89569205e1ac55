//! Streaming line reader and decoder.
//!
//! Reads one record at a time from a newline-delimited JSON stream, so memory
//! stays bounded no matter how large the export is. A single line larger than
//! the configured cap is a fatal read error. The first record must be the
//! version header; the only supported format version is 1.

use crate::error::{ImportError, LineError};
use crate::model::{ImportLine, RecordKind, WorkItem};
use std::io::BufRead;

/// The only supported export format version.
pub const IMPORT_VERSION: u64 = 1;

/// Default cap on a single line: 16 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub struct LineReader<'a> {
    input: &'a mut (dyn BufRead + Send),
    max_line_bytes: usize,
    line_number: u64,
}

impl<'a> LineReader<'a> {
    pub fn new(input: &'a mut (dyn BufRead + Send), max_line_bytes: usize) -> Self {
        Self {
            input,
            max_line_bytes,
            line_number: 0,
        }
    }

    /// 1-based number of the most recently read line.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Read and check the mandatory version header. Any failure here is
    /// attributed to line 1.
    pub fn expect_version(&mut self) -> Result<(), LineError> {
        match self.next_line() {
            Ok(Some(item)) => match item.line {
                ImportLine::Version {
                    version: IMPORT_VERSION,
                } => Ok(()),
                ImportLine::Version { version } => {
                    Err(LineError::new(1, ImportError::UnsupportedVersion(version)))
                }
                _ => Err(LineError::new(1, ImportError::MissingVersion)),
            },
            Ok(None) => Err(LineError::new(1, ImportError::MissingVersion)),
            Err(err) => Err(LineError::new(1, err.source)),
        }
    }

    /// Decode the next record, or `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<WorkItem>, LineError> {
        loop {
            let raw = match self.read_raw() {
                Ok(Some(raw)) => raw,
                Ok(None) => return Ok(None),
                Err(err) => return Err(LineError::new(self.line_number, err)),
            };
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let line: ImportLine = serde_json::from_slice(&raw).map_err(|err| {
                LineError::new(self.line_number, ImportError::Decode(err.to_string()))
            })?;
            return Ok(Some(WorkItem {
                line_number: self.line_number,
                line,
            }));
        }
    }

    /// Read raw bytes up to the next newline, enforcing the line cap.
    fn read_raw(&mut self) -> Result<Option<Vec<u8>>, ImportError> {
        let mut buf: Vec<u8> = Vec::new();
        let mut started = false;
        loop {
            let available = self.input.fill_buf()?;
            if available.is_empty() {
                if buf.is_empty() && !started {
                    return Ok(None);
                }
                break;
            }
            if !started {
                self.line_number += 1;
                started = true;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&available[..pos]);
                    self.input.consume(pos + 1);
                    if buf.len() > self.max_line_bytes {
                        return Err(ImportError::LineTooLong {
                            max: self.max_line_bytes,
                        });
                    }
                    break;
                }
                None => {
                    buf.extend_from_slice(available);
                    let consumed = available.len();
                    self.input.consume(consumed);
                    if buf.len() > self.max_line_bytes {
                        return Err(ImportError::LineTooLong {
                            max: self.max_line_bytes,
                        });
                    }
                }
            }
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader_over(data: &str) -> (Cursor<Vec<u8>>, usize) {
        (Cursor::new(data.as_bytes().to_vec()), DEFAULT_MAX_LINE_BYTES)
    }

    #[test]
    fn accepts_version_one_header() {
        let (mut input, max) = reader_over("{\"type\":\"version\",\"version\":1}\n");
        let mut reader = LineReader::new(&mut input, max);
        reader.expect_version().unwrap();
    }

    #[test]
    fn rejects_missing_version_header_at_line_one() {
        let (mut input, max) = reader_over("{\"type\":\"team\",\"team\":{\"name\":\"t\",\"display_name\":\"T\",\"type\":\"O\"}}\n");
        let mut reader = LineReader::new(&mut input, max);
        let err = reader.expect_version().unwrap_err();
        assert_eq!(err.line, 1);
        assert!(matches!(err.source, ImportError::MissingVersion));
    }

    #[test]
    fn rejects_unsupported_version_at_line_one() {
        let (mut input, max) = reader_over("{\"type\":\"version\",\"version\":7}\n");
        let mut reader = LineReader::new(&mut input, max);
        let err = reader.expect_version().unwrap_err();
        assert_eq!(err.line, 1);
        assert!(matches!(err.source, ImportError::UnsupportedVersion(7)));
    }

    #[test]
    fn empty_stream_fails_version_check() {
        let (mut input, max) = reader_over("");
        let mut reader = LineReader::new(&mut input, max);
        let err = reader.expect_version().unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn tracks_line_numbers_and_skips_blank_lines() {
        let data = "{\"type\":\"version\",\"version\":1}\n\n{\"type\":\"team\"}\n";
        let (mut input, max) = reader_over(data);
        let mut reader = LineReader::new(&mut input, max);
        reader.expect_version().unwrap();
        let item = reader.next_line().unwrap().unwrap();
        assert_eq!(item.line_number, 3);
        assert_eq!(item.line.kind(), RecordKind::Team);
        assert!(reader.next_line().unwrap().is_none());
    }

    #[test]
    fn oversized_line_is_fatal() {
        let big = format!("{{\"type\":\"post\",\"post\":{{\"message\":\"{}\"}}}}\n", "x".repeat(64));
        let (mut input, _) = reader_over(&big);
        let mut reader = LineReader::new(&mut input, 32);
        let err = reader.next_line().unwrap_err();
        assert!(matches!(err.source, ImportError::LineTooLong { max: 32 }));
    }

    #[test]
    fn malformed_json_reports_offending_line() {
        let data = "{\"type\":\"version\",\"version\":1}\nnot json\n";
        let (mut input, max) = reader_over(data);
        let mut reader = LineReader::new(&mut input, max);
        reader.expect_version().unwrap();
        let err = reader.next_line().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.source, ImportError::Decode(_)));
    }

    #[test]
    fn final_line_without_newline_is_read() {
        let data = "{\"type\":\"version\",\"version\":1}";
        let (mut input, max) = reader_over(data);
        let mut reader = LineReader::new(&mut input, max);
        reader.expect_version().unwrap();
    }
}
