//! Polling file tailer.
//!
//! On first open the tailer seeks to the end (history belongs to whoever
//! rotated the file, not to us). Each poll reads complete lines from the
//! remembered offset, bounded per poll so one chatty file cannot starve
//! the rest of the agent. A file that shrank was truncated or rotated in
//! place, so reading restarts from the top.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use super::CollectError;
use crate::config::LogSource;
use crate::telemetry::LogRecord;

pub struct LogTailer {
    path: PathBuf,
    service: String,
    extract_trace_context: bool,
    max_lines_per_poll: usize,
    file: Option<File>,
    offset: u64,
    trace_re: Regex,
    span_re: Regex,
}

impl LogTailer {
    pub fn new(source: &LogSource, max_lines_per_poll: usize) -> Self {
        Self {
            path: source.path.clone(),
            service: source.service.clone(),
            extract_trace_context: source.extract_trace_context,
            max_lines_per_poll,
            file: None,
            offset: 0,
            trace_re: Regex::new(r#"trace[_-]?id[=:]["']?([a-f0-9]{32})"#)
                .expect("static pattern"),
            span_re: Regex::new(r#"span[_-]?id[=:]["']?([a-f0-9]{16})"#).expect("static pattern"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read newly appended complete lines. A missing file is an error the
    /// scheduler logs at debug and retries forever; the handle is dropped
    /// so a recreated file is picked up fresh.
    pub fn poll(&mut self, now_ms: u64) -> Result<Vec<LogRecord>, CollectError> {
        let metadata = std::fs::metadata(&self.path).map_err(|source| {
            self.file = None;
            self.offset = 0;
            CollectError::Io {
                path: self.path.display().to_string(),
                source,
            }
        })?;

        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|source| CollectError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
            self.file = Some(file);
            self.offset = metadata.len();
            return Ok(Vec::new());
        }

        if metadata.len() < self.offset {
            debug!(path = %self.path.display(), "file shrank, assuming truncation");
            let file = File::open(&self.path).map_err(|source| CollectError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
            self.file = Some(file);
            self.offset = 0;
        }

        self.read_new_lines(now_ms)
    }

    fn read_new_lines(&mut self, now_ms: u64) -> Result<Vec<LogRecord>, CollectError> {
        let io_err = |path: &Path, source: std::io::Error| CollectError::Io {
            path: path.display().to_string(),
            source,
        };
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| io_err(&self.path, e))?;

        let mut reader = BufReader::new(file);
        let mut bodies = Vec::new();
        let mut line = String::new();
        while bodies.len() < self.max_lines_per_poll {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| io_err(&self.path, e))?;
            if read == 0 {
                break;
            }
            // a line without a newline is still being written; leave it
            // for the next poll
            if !line.ends_with('\n') {
                break;
            }
            self.offset += read as u64;
            let body = line.trim_end_matches(['\n', '\r']);
            if body.is_empty() {
                continue;
            }
            bodies.push(body.to_string());
        }
        Ok(bodies
            .iter()
            .map(|body| self.record(body, now_ms))
            .collect())
    }

    fn record(&self, body: &str, now_ms: u64) -> LogRecord {
        let mut record = LogRecord::new(body, now_ms);
        record.service = self.service.clone();
        record.source = self.path.display().to_string();
        if self.extract_trace_context {
            let lower = body.to_lowercase();
            record.trace_id = capture(&self.trace_re, &lower);
            record.span_id = capture(&self.span_re, &lower);
        }
        record
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
