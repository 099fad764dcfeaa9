//! The reduction pipeline.
//!
//! One worker drains the collection channel and pushes every item through
//! the stages in order: metrics go rate tracker, then cardinality guard,
//! then sampler, then the windowed aggregator; logs go deduplicator, then
//! the severity sampler. Whatever survives is enriched with host identity
//! and handed to the exporter channel.

pub mod aggregator;
pub mod sampler;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::logs::{Deduplicator, Observation};
use crate::metrics::{Admission, CardinalityGuard, RateTracker};
use crate::telemetry::{now_ms, LogRecord, MetricSample, TelemetryItem};

pub use aggregator::{AggregatorStats, MetricAggregator};
pub use sampler::Sampler;

/// What collectors feed into the pipeline channel.
#[derive(Clone, Debug)]
pub enum PipelineItem {
    Metric(MetricSample),
    Log(LogRecord),
}

/// Shared counters, exposed on the health surface.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub metrics_in: AtomicU64,
    pub logs_in: AtomicU64,
    pub logs_deduplicated: AtomicU64,
    pub dropped_by_cardinality: AtomicU64,
    pub dropped_by_sampling: AtomicU64,
    pub queue_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PipelineSnapshot {
    pub metrics_in: u64,
    pub logs_in: u64,
    pub logs_deduplicated: u64,
    pub dropped_by_cardinality: u64,
    pub dropped_by_sampling: u64,
    pub queue_dropped: u64,
    pub aggregation_samples_in: u64,
    pub aggregation_samples_out: u64,
    pub aggregation_reduction: f64,
}

pub struct Pipeline {
    dedup: Option<Mutex<Deduplicator>>,
    guard: Option<Mutex<CardinalityGuard>>,
    rate: Mutex<RateTracker>,
    sampler: Option<Mutex<Sampler>>,
    aggregator: Option<Mutex<MetricAggregator>>,
    /// Labels stamped onto everything that survives reduction.
    identity: BTreeMap<String, String>,
    /// Fallback for log records whose source declared no service.
    default_service: String,
    out: mpsc::Sender<TelemetryItem>,
    stats: std::sync::Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        hostname: &str,
        out: mpsc::Sender<TelemetryItem>,
        stats: std::sync::Arc<PipelineStats>,
    ) -> Self {
        let mut identity = config.agent.tags.clone();
        identity.insert("host".into(), hostname.to_string());
        identity.insert("environment".into(), config.agent.environment.clone());

        let dedup = config.logs.dedup.enabled.then(|| {
            Mutex::new(Deduplicator::new(
                config.logs.dedup.window(),
                config.logs.dedup.max_patterns,
            ))
        });
        let guard = config.cardinality.enabled.then(|| {
            Mutex::new(CardinalityGuard::new(
                config.cardinality.max_series_per_metric,
                config.cardinality.max_label_values.clone(),
                config.cardinality.drop_labels.clone(),
                config.cardinality.alert_threshold,
                config.cardinality.series_ttl(),
            ))
        });
        let sampler = config
            .sampling
            .enabled
            .then(|| Mutex::new(Sampler::new(&config.sampling)));
        let aggregator = config.aggregation.enabled.then(|| {
            Mutex::new(MetricAggregator::new(
                &config.aggregation.aggregates,
                config.aggregation.drop_raw,
            ))
        });

        Self {
            dedup,
            guard,
            rate: Mutex::new(RateTracker::new(config.cardinality.series_ttl())),
            sampler,
            aggregator,
            identity,
            default_service: config.agent.service_name.clone(),
            out,
            stats,
        }
    }

    /// Drain the collection channel until it closes or shutdown is
    /// requested.
    pub async fn run(
        self: std::sync::Arc<Self>,
        mut rx: mpsc::Receiver<PipelineItem>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => self.handle(item).await,
                    None => return,
                },
                _ = shutdown.cancelled() => return,
            }
        }
    }

    pub async fn handle(&self, item: PipelineItem) {
        match item {
            PipelineItem::Metric(metric) => self.handle_metric(metric).await,
            PipelineItem::Log(log) => self.handle_log(log).await,
        }
    }

    async fn handle_metric(&self, metric: MetricSample) {
        self.stats.metrics_in.fetch_add(1, Ordering::Relaxed);
        let derived = lock(&self.rate).observe(&metric);
        self.admit_metric(metric).await;
        if let Some(rate) = derived {
            self.admit_metric(rate).await;
        }
    }

    async fn admit_metric(&self, mut metric: MetricSample) {
        let now = metric.timestamp_ms;
        if let Some(guard) = &self.guard {
            if lock(guard).admit(&mut metric, now) == Admission::Rejected {
                self.stats
                    .dropped_by_cardinality
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Some(sampler) = &self.sampler {
            if !lock(sampler).keep_event(&metric.name, false, None, metric.timestamp_ms) {
                self.stats
                    .dropped_by_sampling
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        match &self.aggregator {
            Some(aggregator) => lock(aggregator).add(&metric),
            None => self.emit_metric(metric).await,
        }
    }

    async fn handle_log(&self, mut log: LogRecord) {
        self.stats.logs_in.fetch_add(1, Ordering::Relaxed);
        if let Some(dedup) = &self.dedup {
            if lock(dedup).observe(&log) == Observation::Duplicate {
                self.stats
                    .logs_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Some(sampler) = &self.sampler {
            if !lock(sampler).keep_log(log.severity) {
                self.stats
                    .dropped_by_sampling
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.enrich_log(&mut log);
        let _ = self.out.send(TelemetryItem::Log(log)).await;
    }

    /// End-of-window flush of the metric aggregator into the export
    /// channel.
    pub async fn flush_aggregates(&self) {
        let Some(aggregator) = &self.aggregator else {
            return;
        };
        let flushed = lock(aggregator).flush();
        if flushed.is_empty() {
            return;
        }
        debug!(metrics = flushed.len(), "aggregation window flushed");
        for metric in flushed {
            self.emit_metric(metric).await;
        }
    }

    /// End-of-window flush of deduplication summaries. Summaries bypass
    /// the sampler: they already represent many suppressed lines.
    pub async fn flush_dedup(&self) {
        let Some(dedup) = &self.dedup else { return };
        let summaries = lock(dedup).flush(now_ms());
        if summaries.is_empty() {
            return;
        }
        debug!(summaries = summaries.len(), "dedup window flushed");
        for mut summary in summaries {
            self.enrich_log(&mut summary);
            let _ = self.out.send(TelemetryItem::Log(summary)).await;
        }
    }

    /// Final flush on shutdown.
    pub async fn flush_all(&self) {
        self.flush_aggregates().await;
        self.flush_dedup().await;
    }

    /// Reclaim idle state in every stage. Called on a timer and by the
    /// memory watchdog.
    pub fn sweep(&self) {
        let now = now_ms();
        let mut reclaimed = lock(&self.rate).sweep(now);
        if let Some(guard) = &self.guard {
            reclaimed += lock(guard).sweep(now);
        }
        if let Some(sampler) = &self.sampler {
            reclaimed += lock(sampler).sweep(now);
        }
        if let Some(dedup) = &self.dedup {
            reclaimed += lock(dedup).sweep(now);
        }
        if reclaimed > 0 {
            info!(reclaimed, "idle pipeline state reclaimed");
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let agg = self
            .aggregator
            .as_ref()
            .map(|a| lock(a).stats())
            .unwrap_or_default();
        PipelineSnapshot {
            metrics_in: self.stats.metrics_in.load(Ordering::Relaxed),
            logs_in: self.stats.logs_in.load(Ordering::Relaxed),
            logs_deduplicated: self.stats.logs_deduplicated.load(Ordering::Relaxed),
            dropped_by_cardinality: self.stats.dropped_by_cardinality.load(Ordering::Relaxed),
            dropped_by_sampling: self.stats.dropped_by_sampling.load(Ordering::Relaxed),
            queue_dropped: self.stats.queue_dropped.load(Ordering::Relaxed),
            aggregation_samples_in: agg.samples_in,
            aggregation_samples_out: agg.samples_out,
            aggregation_reduction: agg.reduction_ratio(),
        }
    }

    async fn emit_metric(&self, mut metric: MetricSample) {
        for (key, value) in &self.identity {
            metric
                .labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let _ = self.out.send(TelemetryItem::Metric(metric)).await;
    }

    fn enrich_log(&self, log: &mut LogRecord) {
        if log.service.is_empty() {
            log.service = self.default_service.clone();
        }
        for (key, value) in &self.identity {
            log.attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[allow(clippy::expect_used)]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("pipeline lock poisoned")
}
