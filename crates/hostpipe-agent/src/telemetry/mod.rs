//! Core telemetry data model shared by every pipeline stage.
//!
//! Two item kinds flow through the agent: [`MetricSample`] and [`LogRecord`].
//! Both are plain serde-serializable values so they can cross the export
//! boundary and the disk buffer without a separate wire representation.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Label set attached to a sample or record. `BTreeMap` keeps keys sorted so
/// series keys are order-independent without an explicit sort pass.
pub type Labels = BTreeMap<String, String>;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Point-in-time value, exported as-is.
    Gauge,
    /// Monotonic cumulative value; the rate tracker derives per-second
    /// gauges from consecutive observations.
    Counter,
}

/// A single metric observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
}

impl MetricSample {
    pub fn gauge(name: impl Into<String>, value: f64, timestamp_ms: u64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp_ms,
            labels: Labels::new(),
            kind: MetricKind::Gauge,
            unit: String::new(),
        }
    }

    pub fn counter(name: impl Into<String>, value: f64, timestamp_ms: u64) -> Self {
        Self {
            kind: MetricKind::Counter,
            ..Self::gauge(name, value, timestamp_ms)
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Canonical identity of this sample's time series.
    pub fn series_key(&self) -> String {
        series_key(&self.name, &self.labels)
    }
}

/// `name|k=v|k2=v2` over the sorted label set. Two samples with the same
/// name and labels always map to the same key regardless of label insertion
/// order.
pub fn series_key(name: &str, labels: &Labels) -> String {
    let mut key = String::with_capacity(name.len() + labels.len() * 16);
    key.push_str(name);
    for (k, v) in labels {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// Log severity, ordered so that `>=` comparisons express "at least this
/// severe".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Unspecified,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unspecified => "UNSPECIFIED",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// OTLP-style severity number for the export payload.
    pub fn number(&self) -> u8 {
        match self {
            Severity::Unspecified => 0,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }

    /// Keyword scan over a raw log line. Checks the most severe keywords
    /// first so a line like "error while retrying after panic" classifies
    /// as fatal.
    pub fn detect(line: &str) -> Severity {
        let lower = line.to_lowercase();
        if lower.contains("fatal") || lower.contains("panic") {
            Severity::Fatal
        } else if lower.contains("error") || lower.contains("err]") {
            Severity::Error
        } else if lower.contains("warn") {
            Severity::Warn
        } else if lower.contains("debug") || lower.contains("trace") {
            Severity::Debug
        } else {
            Severity::Info
        }
    }
}

/// A single log line after collection, plus everything the tailer and
/// pipeline learned about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u64,
    pub body: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    /// Originating file path or collector name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Labels,
}

impl LogRecord {
    pub fn new(body: impl Into<String>, timestamp_ms: u64) -> Self {
        let body = body.into();
        Self {
            timestamp_ms,
            severity: Severity::detect(&body),
            body,
            service: String::new(),
            source: String::new(),
            trace_id: None,
            span_id: None,
            attributes: Labels::new(),
        }
    }
}

/// Unit of work for the exporter. Batches mix both kinds; the transport
/// splits them per endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryItem {
    Metric(MetricSample),
    Log(LogRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_key_is_label_order_independent() {
        let a = MetricSample::gauge("cpu.usage", 1.0, 0)
            .with_label("host", "web-1")
            .with_label("core", "0");
        let b = MetricSample::gauge("cpu.usage", 2.0, 5)
            .with_label("core", "0")
            .with_label("host", "web-1");
        assert_eq!(a.series_key(), b.series_key());
        assert_eq!(a.series_key(), "cpu.usage|core=0|host=web-1");
    }

    #[test]
    fn series_key_without_labels_is_the_name() {
        assert_eq!(series_key("mem.free", &Labels::new()), "mem.free");
    }

    #[test]
    fn severity_detection_prefers_most_severe_keyword() {
        assert_eq!(Severity::detect("FATAL: out of memory"), Severity::Fatal);
        assert_eq!(
            Severity::detect("error while retrying after panic"),
            Severity::Fatal
        );
        assert_eq!(Severity::detect("connection error"), Severity::Error);
        assert_eq!(Severity::detect("WARN slow request"), Severity::Warn);
        assert_eq!(Severity::detect("DEBUG cache miss"), Severity::Debug);
        assert_eq!(Severity::detect("request served"), Severity::Info);
    }

    #[test]
    fn severity_orders_by_seriousness() {
        assert!(Severity::Error >= Severity::Error);
        assert!(Severity::Fatal >= Severity::Error);
        assert!(Severity::Warn < Severity::Error);
    }

    #[test]
    fn telemetry_item_round_trips_through_json() {
        let item = TelemetryItem::Log(LogRecord::new("started", 1234));
        let bytes = serde_json::to_vec(&item).unwrap();
        let back: TelemetryItem = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(item, back);
    }
}
