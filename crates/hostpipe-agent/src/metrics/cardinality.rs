//! Cardinality protection.
//!
//! Unbounded label values are the classic way a host agent blows up its own
//! memory and the upstream bill. The guard rewrites labels first (drop-list
//! removal, zero-allowance stripping, `__other__` clamping) and only then
//! decides admission against the per-metric series cap, so the rewritten
//! label set is the one that counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, warn};

use crate::telemetry::{series_key, MetricSample};

pub const OVERFLOW_LABEL_VALUE: &str = "__other__";

/// Admission decision for one sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The metric is at its series cap and this label set is not already
    /// tracked. The sample must not be forwarded and the set must not grow.
    Rejected,
}

pub struct CardinalityGuard {
    max_series_per_metric: usize,
    max_label_values: BTreeMap<String, usize>,
    drop_labels: Vec<String>,
    alert_threshold: usize,
    ttl: Duration,
    /// metric name -> series key -> last seen (ms).
    series: HashMap<String, HashMap<String, u64>>,
    /// label key -> distinct values admitted so far.
    label_values: HashMap<String, HashSet<String>>,
    alerted: HashSet<String>,
    rejected: u64,
    clamped: u64,
}

impl CardinalityGuard {
    pub fn new(
        max_series_per_metric: usize,
        max_label_values: BTreeMap<String, usize>,
        drop_labels: Vec<String>,
        alert_threshold: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            max_series_per_metric,
            max_label_values,
            drop_labels,
            alert_threshold,
            ttl,
            series: HashMap::new(),
            label_values: HashMap::new(),
            alerted: HashSet::new(),
            rejected: 0,
            clamped: 0,
        }
    }

    /// Rewrite the sample's labels in place and decide admission.
    pub fn admit(&mut self, sample: &mut MetricSample, now_ms: u64) -> Admission {
        for label in &self.drop_labels {
            sample.labels.remove(label);
        }
        self.bound_label_values(sample);

        let key = series_key(&sample.name, &sample.labels);
        let tracked = self.series.entry(sample.name.clone()).or_default();

        if let Some(last_seen) = tracked.get_mut(&key) {
            *last_seen = now_ms;
            return Admission::Accepted;
        }

        // membership is checked before admission: a metric at its cap
        // keeps serving known series but admits nothing new
        if self.max_series_per_metric > 0 && tracked.len() >= self.max_series_per_metric {
            self.rejected += 1;
            debug!(
                metric = %sample.name,
                cap = self.max_series_per_metric,
                "series cap reached, dropping sample for new label set"
            );
            return Admission::Rejected;
        }

        tracked.insert(key, now_ms);
        let count = tracked.len();
        if self.alert_threshold > 0
            && count >= self.alert_threshold
            && self.alerted.insert(sample.name.clone())
        {
            warn!(
                metric = %sample.name,
                series = count,
                threshold = self.alert_threshold,
                "metric cardinality crossed alert threshold"
            );
        }
        Admission::Accepted
    }

    fn bound_label_values(&mut self, sample: &mut MetricSample) {
        let keys: Vec<String> = sample
            .labels
            .keys()
            .filter(|k| self.max_label_values.contains_key(*k))
            .cloned()
            .collect();
        for key in keys {
            let allowance = self.max_label_values[&key];
            if allowance == 0 {
                sample.labels.remove(&key);
                continue;
            }
            let Some(value) = sample.labels.get(&key).cloned() else {
                continue;
            };
            if value == OVERFLOW_LABEL_VALUE {
                continue;
            }
            let seen = self.label_values.entry(key.clone()).or_default();
            if seen.contains(&value) {
                continue;
            }
            if seen.len() >= allowance {
                sample
                    .labels
                    .insert(key, OVERFLOW_LABEL_VALUE.to_string());
                self.clamped += 1;
            } else {
                seen.insert(value);
            }
        }
    }

    /// Reclaim series not seen within the TTL. Metrics whose whole set was
    /// reclaimed also lose their alert latch so a regrowth warns again.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let ttl_ms = self.ttl.as_millis() as u64;
        let mut reclaimed = 0;
        self.series.retain(|name, tracked| {
            let before = tracked.len();
            tracked.retain(|_, last_seen| now_ms.saturating_sub(*last_seen) <= ttl_ms);
            reclaimed += before - tracked.len();
            if tracked.is_empty() {
                self.alerted.remove(name);
                false
            } else {
                true
            }
        });
        reclaimed
    }

    pub fn series_count(&self, metric: &str) -> usize {
        self.series.get(metric).map_or(0, HashMap::len)
    }

    pub fn total_series(&self) -> usize {
        self.series.values().map(HashMap::len).sum()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn clamped(&self) -> u64 {
        self.clamped
    }
}
