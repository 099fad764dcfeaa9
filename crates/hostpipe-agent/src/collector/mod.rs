//! Collection side of the agent: interval-scheduled metric sources and
//! polling log tailers, all feeding the pipeline channel. A full channel
//! drops at the door and counts the drop; collection never blocks on a
//! slow pipeline.

pub mod host;
pub mod tail;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::{PipelineItem, PipelineStats};
use crate::telemetry::{now_ms, MetricSample};

pub use host::HostMetricsSource;
pub use tail::LogTailer;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A producer of metric samples polled on a fixed interval. Collection is
/// synchronous and cheap (procfs reads); a failing tick is logged and
/// skipped, never fatal.
pub trait MetricSource: Send {
    fn name(&self) -> &'static str;
    fn collect(&mut self, now_ms: u64) -> Result<Vec<MetricSample>, CollectError>;
}

/// Drive one metric source until shutdown.
pub async fn run_metric_source(
    mut source: Box<dyn MetricSource>,
    every: Duration,
    tx: mpsc::Sender<PipelineItem>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match source.collect(now_ms()) {
                    Ok(samples) => {
                        for sample in samples {
                            offer(&tx, PipelineItem::Metric(sample), &stats);
                        }
                    }
                    Err(e) => {
                        warn!(source = source.name(), error = %e, "collection tick skipped");
                    }
                }
            }
        }
    }
}

/// Drive one log tailer until shutdown.
pub async fn run_tailer(
    mut tailer: LogTailer,
    every: Duration,
    tx: mpsc::Sender<PipelineItem>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match tailer.poll(now_ms()) {
                    Ok(records) => {
                        for record in records {
                            offer(&tx, PipelineItem::Log(record), &stats);
                        }
                    }
                    Err(e) => {
                        // the file may simply not exist yet; keep polling
                        debug!(path = %tailer.path().display(), error = %e, "log source unavailable");
                    }
                }
            }
        }
    }
}

fn offer(tx: &mpsc::Sender<PipelineItem>, item: PipelineItem, stats: &PipelineStats) {
    if tx.try_send(item).is_err() {
        stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct StaticSource {
        fail: bool,
    }

    impl MetricSource for StaticSource {
        fn name(&self) -> &'static str {
            "static"
        }

        fn collect(&mut self, now_ms: u64) -> Result<Vec<MetricSample>, CollectError> {
            if self.fail {
                return Err(CollectError::Io {
                    path: "/proc/none".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(vec![MetricSample::gauge("static.value", 1.0, now_ms)])
        }
    }

    #[tokio::test]
    async fn scheduler_emits_on_each_tick_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(PipelineStats::default());
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_metric_source(
            Box::new(StaticSource { fail: false }),
            Duration::from_millis(5),
            tx,
            stats,
            shutdown.clone(),
        ));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, PipelineItem::Metric(m) if m.name == "static.value"));
        rx.recv().await.unwrap();

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn failing_source_keeps_the_worker_alive() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(PipelineStats::default());
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_metric_source(
            Box::new(StaticSource { fail: true }),
            Duration::from_millis(5),
            tx,
            stats,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert!(!worker.is_finished());
        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn full_channel_counts_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let stats = Arc::new(PipelineStats::default());
        offer(
            &tx,
            PipelineItem::Metric(MetricSample::gauge("a", 1.0, 0)),
            &stats,
        );
        offer(
            &tx,
            PipelineItem::Metric(MetricSample::gauge("b", 1.0, 0)),
            &stats,
        );
        assert_eq!(stats.queue_dropped.load(Ordering::Relaxed), 1);
    }
}
