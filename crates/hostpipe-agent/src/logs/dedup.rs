//! Log pattern deduplication.
//!
//! Lines are normalized into templates (variable tokens replaced by
//! placeholders), keyed by an FNV-64a hash of the template, and counted.
//! The first occurrence of a template passes through; repeats within the
//! window are suppressed and surface at flush time as one synthetic record
//! carrying an `occurrence_count` attribute.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration;

use fnv::FnvHasher;
use regex::Regex;
use tracing::warn;

use crate::telemetry::{LogRecord, Severity};

/// Replaces variable tokens in a log line with stable placeholders.
pub struct TemplateNormalizer {
    number: Regex,
    uuid: Regex,
    ipv4: Regex,
    hex: Regex,
    path: Regex,
    timestamp: Regex,
}

impl TemplateNormalizer {
    pub fn new() -> Self {
        Self {
            number: Regex::new(r"\b\d+\b").expect("static pattern"),
            uuid: Regex::new(r"[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}")
                .expect("static pattern"),
            ipv4: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("static pattern"),
            hex: Regex::new(r"\b[a-f0-9]{16,}\b").expect("static pattern"),
            path: Regex::new(r"/[^\s]+").expect("static pattern"),
            timestamp: Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}")
                .expect("static pattern"),
        }
    }

    /// The replacement order is fixed and observable: numbers are rewritten
    /// before the UUID/IP/hex/timestamp patterns run, so a digits-only
    /// segment of a UUID (or any dotted-digit token) is already `<NUM>` by
    /// the time those patterns are applied. Templates produced under this
    /// order are what existing pattern tables contain; changing the order
    /// changes every key.
    pub fn normalize(&self, line: &str) -> String {
        let t = self.number.replace_all(line, "<NUM>");
        let t = self.uuid.replace_all(&t, "<UUID>");
        let t = self.ipv4.replace_all(&t, "<IP>");
        let t = self.hex.replace_all(&t, "<HEX>");
        let t = self.path.replace_all(&t, "<PATH>");
        let t = self.timestamp.replace_all(&t, "<TIMESTAMP>");
        t.into_owned()
    }
}

impl Default for TemplateNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of observing one line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// New template; the caller should forward the line downstream.
    FirstSeen,
    /// Known template; the line is absorbed into the pattern count.
    Duplicate,
}

struct PatternEntry {
    template: String,
    count: u64,
    first_seen_ms: u64,
    last_seen_ms: u64,
    /// First raw line that produced this template, kept as the body of the
    /// flush record.
    sample: String,
    service: String,
    source: String,
}

/// Bounded, windowed pattern table. Single-owner: the pipeline worker holds
/// it behind a mutex and is the only caller.
pub struct Deduplicator {
    normalizer: TemplateNormalizer,
    patterns: HashMap<u64, PatternEntry>,
    window: Duration,
    max_patterns: usize,
    evictions: u64,
}

impl Deduplicator {
    pub fn new(window: Duration, max_patterns: usize) -> Self {
        Self {
            normalizer: TemplateNormalizer::new(),
            patterns: HashMap::new(),
            window,
            max_patterns,
            evictions: 0,
        }
    }

    /// Observe a collected record. First occurrences pass through, repeats
    /// are counted and suppressed.
    pub fn observe(&mut self, record: &LogRecord) -> Observation {
        let template = self.normalizer.normalize(&record.body);
        let key = template_key(&template);

        if let Some(entry) = self.patterns.get_mut(&key) {
            entry.count += 1;
            entry.last_seen_ms = record.timestamp_ms;
            return Observation::Duplicate;
        }

        if self.patterns.len() >= self.max_patterns {
            self.evict_oldest();
        }
        self.patterns.insert(
            key,
            PatternEntry {
                template,
                count: 1,
                first_seen_ms: record.timestamp_ms,
                last_seen_ms: record.timestamp_ms,
                sample: record.body.clone(),
                service: record.service.clone(),
                source: record.source.clone(),
            },
        );
        Observation::FirstSeen
    }

    /// End-of-window flush: drop entries idle past the window, emit one
    /// synthetic record per template that repeated, and reset counts for
    /// the next window.
    pub fn flush(&mut self, now_ms: u64) -> Vec<LogRecord> {
        let window_ms = self.window.as_millis() as u64;
        let mut out = Vec::new();
        self.patterns.retain(|_, entry| {
            if now_ms.saturating_sub(entry.last_seen_ms) > window_ms {
                return false;
            }
            if entry.count > 1 {
                out.push(summary_record(entry));
            }
            entry.count = 0;
            true
        });
        out
    }

    /// Reclamation sweep outside the flush cycle; used by the resource
    /// watchdog. Removes entries idle past the window without emitting.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let window_ms = self.window.as_millis() as u64;
        let before = self.patterns.len();
        self.patterns
            .retain(|_, e| now_ms.saturating_sub(e.last_seen_ms) <= window_ms);
        before - self.patterns.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .patterns
            .iter()
            .min_by_key(|(_, e)| e.last_seen_ms)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            self.patterns.remove(&key);
            self.evictions += 1;
            if self.evictions % 1000 == 1 {
                warn!(
                    max_patterns = self.max_patterns,
                    evictions = self.evictions,
                    "pattern table full, evicting oldest template"
                );
            }
        }
    }
}

fn template_key(template: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(template.as_bytes());
    hasher.finish()
}

fn summary_record(entry: &PatternEntry) -> LogRecord {
    let mut record = LogRecord::new(entry.sample.clone(), entry.last_seen_ms);
    record.severity = Severity::Info;
    record.service = entry.service.clone();
    record.source = entry.source.clone();
    record
        .attributes
        .insert("deduplicated".into(), "true".into());
    record
        .attributes
        .insert("occurrence_count".into(), entry.count.to_string());
    record
        .attributes
        .insert("first_seen_ms".into(), entry.first_seen_ms.to_string());
    record
        .attributes
        .insert("pattern_template".into(), entry.template.clone());
    record
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 10_000)
    }
}
