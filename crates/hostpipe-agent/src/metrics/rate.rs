//! Counter-to-rate conversion.
//!
//! Cumulative counters are useless upstream without the previous value, so
//! the tracker remembers the last observation per series and emits a
//! `<name>.rate` gauge with the per-second delta. Raw counters keep flowing
//! alongside the derived gauges.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::telemetry::{MetricKind, MetricSample};

struct CounterState {
    value: f64,
    timestamp_ms: u64,
}

/// Per-series last-observation table. Entries idle past the TTL are
/// reclaimed by [`RateTracker::sweep`].
pub struct RateTracker {
    states: HashMap<String, CounterState>,
    ttl: Duration,
    resets: u64,
}

impl RateTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: HashMap::new(),
            ttl,
            resets: 0,
        }
    }

    /// Observe a sample. Returns the derived rate gauge when one can be
    /// computed: gauges and first observations yield nothing, as do
    /// non-advancing timestamps and counter resets. State is updated
    /// unconditionally so the next tick has a baseline either way.
    pub fn observe(&mut self, sample: &MetricSample) -> Option<MetricSample> {
        if sample.kind != MetricKind::Counter {
            return None;
        }

        let key = sample.series_key();
        let previous = self.states.insert(
            key,
            CounterState {
                value: sample.value,
                timestamp_ms: sample.timestamp_ms,
            },
        )?;

        if sample.timestamp_ms <= previous.timestamp_ms {
            return None;
        }
        if sample.value < previous.value {
            // process restart or counter wrap
            self.resets += 1;
            debug!(metric = %sample.name, "counter reset detected, skipping rate for this tick");
            return None;
        }

        let elapsed = (sample.timestamp_ms - previous.timestamp_ms) as f64 / 1000.0;
        Some(MetricSample {
            name: format!("{}.rate", sample.name),
            value: (sample.value - previous.value) / elapsed,
            timestamp_ms: sample.timestamp_ms,
            labels: sample.labels.clone(),
            kind: MetricKind::Gauge,
            unit: rate_unit(&sample.unit),
        })
    }

    /// Drop state for series not observed within the TTL. Returns how many
    /// entries were reclaimed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let ttl_ms = self.ttl.as_millis() as u64;
        let before = self.states.len();
        self.states
            .retain(|_, s| now_ms.saturating_sub(s.timestamp_ms) <= ttl_ms);
        before - self.states.len()
    }

    pub fn tracked_series(&self) -> usize {
        self.states.len()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

fn rate_unit(unit: &str) -> String {
    if unit.is_empty() {
        "/s".to_string()
    } else {
        format!("{unit}/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RateTracker {
        RateTracker::new(Duration::from_secs(900))
    }

    #[test]
    fn first_observation_yields_no_rate() {
        let mut t = tracker();
        let sample = MetricSample::counter("net.bytes", 100.0, 10_000);
        assert!(t.observe(&sample).is_none());
        assert_eq!(t.tracked_series(), 1);
    }

    #[test]
    fn rate_is_delta_over_elapsed_seconds() {
        let mut t = tracker();
        t.observe(&MetricSample::counter("net.bytes", 100.0, 10_000));
        let rate = t
            .observe(&MetricSample::counter("net.bytes", 150.0, 15_000))
            .unwrap();
        assert_eq!(rate.name, "net.bytes.rate");
        assert_eq!(rate.value, 10.0);
        assert_eq!(rate.kind, MetricKind::Gauge);
        assert_eq!(rate.timestamp_ms, 15_000);
    }

    #[test]
    fn rate_unit_derives_from_counter_unit() {
        let mut t = tracker();
        t.observe(&MetricSample::counter("disk.reads", 5.0, 0).with_unit("ops"));
        let rate = t
            .observe(&MetricSample::counter("disk.reads", 15.0, 1000).with_unit("ops"))
            .unwrap();
        assert_eq!(rate.unit, "ops/s");

        let mut t = tracker();
        t.observe(&MetricSample::counter("raw", 1.0, 0));
        let rate = t.observe(&MetricSample::counter("raw", 2.0, 1000)).unwrap();
        assert_eq!(rate.unit, "/s");
    }

    #[test]
    fn gauges_are_ignored() {
        let mut t = tracker();
        assert!(t.observe(&MetricSample::gauge("mem.used", 10.0, 0)).is_none());
        assert!(t
            .observe(&MetricSample::gauge("mem.used", 20.0, 1000))
            .is_none());
        assert_eq!(t.tracked_series(), 0);
    }

    #[test]
    fn reset_skips_one_tick_then_recovers() {
        let mut t = tracker();
        t.observe(&MetricSample::counter("reqs", 1000.0, 0));
        assert!(t.observe(&MetricSample::counter("reqs", 50.0, 5000)).is_none());
        assert_eq!(t.resets(), 1);

        // baseline was overwritten by the reset observation
        let rate = t
            .observe(&MetricSample::counter("reqs", 100.0, 10_000))
            .unwrap();
        assert_eq!(rate.value, 10.0);
    }

    #[test]
    fn non_advancing_timestamp_yields_no_rate() {
        let mut t = tracker();
        t.observe(&MetricSample::counter("reqs", 10.0, 5000));
        assert!(t.observe(&MetricSample::counter("reqs", 20.0, 5000)).is_none());
        assert!(t.observe(&MetricSample::counter("reqs", 30.0, 4000)).is_none());
    }

    #[test]
    fn series_with_different_labels_track_independently() {
        let mut t = tracker();
        let eth0 = |v, ts| {
            MetricSample::counter("net.bytes", v, ts).with_label("iface", "eth0")
        };
        let eth1 = |v, ts| {
            MetricSample::counter("net.bytes", v, ts).with_label("iface", "eth1")
        };
        t.observe(&eth0(100.0, 0));
        t.observe(&eth1(500.0, 0));
        assert_eq!(t.observe(&eth0(200.0, 1000)).unwrap().value, 100.0);
        assert_eq!(t.observe(&eth1(600.0, 1000)).unwrap().value, 100.0);
    }

    #[test]
    fn sweep_reclaims_idle_series() {
        let mut t = RateTracker::new(Duration::from_secs(10));
        t.observe(&MetricSample::counter("old", 1.0, 1000));
        t.observe(&MetricSample::counter("new", 1.0, 20_000));
        assert_eq!(t.sweep(25_000), 1);
        assert_eq!(t.tracked_series(), 1);
    }
}
