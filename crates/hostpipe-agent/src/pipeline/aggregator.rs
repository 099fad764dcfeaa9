//! Windowed metric aggregation.
//!
//! Raw samples accumulate per series for one window; at flush each bucket
//! collapses into the configured aggregates (`<name>.min`, `<name>.p95`,
//! and so on) emitted as gauges. With `drop_raw` set this is where most of
//! the agent's volume reduction happens.

use std::collections::HashMap;

use tracing::debug;

use crate::telemetry::{Labels, MetricKind, MetricSample};

/// One statistic computed over a window of values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    P50,
    P90,
    P95,
    P99,
}

impl Aggregate {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "count" => Some(Self::Count),
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "avg" => Some(Self::Avg),
            "p50" => Some(Self::P50),
            "p90" => Some(Self::P90),
            "p95" => Some(Self::P95),
            "p99" => Some(Self::P99),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::P50 => "p50",
            Self::P90 => "p90",
            Self::P95 => "p95",
            Self::P99 => "p99",
        }
    }

    /// `values` must be sorted ascending and non-empty.
    fn compute(&self, values: &[f64]) -> f64 {
        match self {
            Self::Count => values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Min => values[0],
            Self::Max => values[values.len() - 1],
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::P50 => percentile(values, 0.50),
            Self::P90 => percentile(values, 0.90),
            Self::P95 => percentile(values, 0.95),
            Self::P99 => percentile(values, 0.99),
        }
    }
}

/// Linear interpolation between the two nearest ranks.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let weight = rank - low as f64;
    sorted[low] * (1.0 - weight) + sorted[high] * weight
}

struct Bucket {
    name: String,
    labels: Labels,
    unit: String,
    kind: MetricKind,
    values: Vec<f64>,
    last_timestamp_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AggregatorStats {
    pub samples_in: u64,
    pub samples_out: u64,
}

impl AggregatorStats {
    /// Fraction of input volume eliminated so far.
    pub fn reduction_ratio(&self) -> f64 {
        if self.samples_in == 0 {
            return 0.0;
        }
        1.0 - self.samples_out as f64 / self.samples_in as f64
    }
}

pub struct MetricAggregator {
    aggregates: Vec<Aggregate>,
    drop_raw: bool,
    buckets: HashMap<String, Bucket>,
    stats: AggregatorStats,
}

impl MetricAggregator {
    /// Unrecognized aggregate names are logged and skipped rather than
    /// failing the whole agent.
    pub fn new(aggregate_names: &[String], drop_raw: bool) -> Self {
        let mut aggregates = Vec::with_capacity(aggregate_names.len());
        for name in aggregate_names {
            match Aggregate::parse(name) {
                Some(agg) => aggregates.push(agg),
                None => debug!(aggregate = %name, "unknown aggregate, ignoring"),
            }
        }
        Self {
            aggregates,
            drop_raw,
            buckets: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn add(&mut self, sample: &MetricSample) {
        self.stats.samples_in += 1;
        let key = sample.series_key();
        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            name: sample.name.clone(),
            labels: sample.labels.clone(),
            unit: sample.unit.clone(),
            kind: sample.kind,
            values: Vec::new(),
            last_timestamp_ms: sample.timestamp_ms,
        });
        bucket.values.push(sample.value);
        bucket.last_timestamp_ms = sample.timestamp_ms;
    }

    /// Collapse every bucket into its aggregates and clear the window.
    pub fn flush(&mut self) -> Vec<MetricSample> {
        let mut out = Vec::new();
        for (_, mut bucket) in self.buckets.drain() {
            if bucket.values.is_empty() {
                continue;
            }
            bucket
                .values
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for aggregate in &self.aggregates {
                out.push(MetricSample {
                    name: format!("{}.{}", bucket.name, aggregate.suffix()),
                    value: aggregate.compute(&bucket.values),
                    timestamp_ms: bucket.last_timestamp_ms,
                    labels: bucket.labels.clone(),
                    kind: MetricKind::Gauge,
                    unit: bucket.unit.clone(),
                });
            }
            if !self.drop_raw {
                out.push(MetricSample {
                    name: bucket.name,
                    value: bucket.values[bucket.values.len() - 1],
                    timestamp_ms: bucket.last_timestamp_ms,
                    labels: bucket.labels,
                    kind: bucket.kind,
                    unit: bucket.unit,
                });
            }
        }
        self.stats.samples_out += out.len() as u64;
        out
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
