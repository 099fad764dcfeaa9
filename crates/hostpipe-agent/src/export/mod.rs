//! Reliable delivery.
//!
//! The exporter collects pipeline output into batches (cut by size or
//! timeout), sends them with exponential-backoff retries, and classifies
//! failures: transient failures that exhaust their retries spill to the
//! disk buffer for later replay, permanent failures are reported and
//! dropped. A replay worker drains the buffer oldest-first whenever the
//! live path is idle.

pub mod buffer;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExportSection;
use crate::telemetry::TelemetryItem;
pub use buffer::DiskBuffer;
pub use transport::{HttpTransport, Transport, TransportError};

/// Counters shared with the health surface. Plain relaxed atomics; these
/// are statistics, not synchronization.
#[derive(Debug, Default)]
pub struct ExporterStats {
    pub items_exported: AtomicU64,
    pub batches_exported: AtomicU64,
    pub bytes_exported: AtomicU64,
    pub send_failures: AtomicU64,
    pub permanent_drops: AtomicU64,
    pub batches_buffered: AtomicU64,
    pub batches_replayed: AtomicU64,
    pub buffer_dropped: AtomicU64,
    pub buffer_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ExporterSnapshot {
    pub items_exported: u64,
    pub batches_exported: u64,
    pub bytes_exported: u64,
    pub send_failures: u64,
    pub permanent_drops: u64,
    pub batches_buffered: u64,
    pub batches_replayed: u64,
    pub buffer_dropped: u64,
}

impl ExporterStats {
    pub fn snapshot(&self) -> ExporterSnapshot {
        ExporterSnapshot {
            items_exported: self.items_exported.load(Ordering::Relaxed),
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            bytes_exported: self.bytes_exported.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            permanent_drops: self.permanent_drops.load(Ordering::Relaxed),
            batches_buffered: self.batches_buffered.load(Ordering::Relaxed),
            batches_replayed: self.batches_replayed.load(Ordering::Relaxed),
            buffer_dropped: self.buffer_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    fn from_config(config: &ExportSection) -> Self {
        Self {
            enabled: config.retry.enabled,
            max_attempts: config.retry.max_attempts.max(1),
            initial_backoff: config.retry.initial_backoff(),
            max_backoff: config.retry.max_backoff(),
        }
    }
}

pub struct Exporter {
    transport: Arc<dyn Transport>,
    buffer: Option<Mutex<DiskBuffer>>,
    retry: RetryPolicy,
    batch_max_size: usize,
    batch_max_wait: Duration,
    /// Set while a live batch is in flight so the replay worker yields.
    sending: AtomicBool,
    stats: Arc<ExporterStats>,
}

impl Exporter {
    pub fn new(
        transport: Arc<dyn Transport>,
        buffer: Option<DiskBuffer>,
        config: &ExportSection,
        stats: Arc<ExporterStats>,
    ) -> Self {
        Self {
            transport,
            buffer: buffer.map(Mutex::new),
            retry: RetryPolicy::from_config(config),
            batch_max_size: config.batch.max_size,
            batch_max_wait: config.batch.max_wait(),
            sending: AtomicBool::new(false),
            stats,
        }
    }

    /// Batch-and-send loop. Runs until the input channel closes, then
    /// flushes whatever is pending with a single attempt so shutdown stays
    /// bounded (failures spill to the buffer as usual). The token does not
    /// stop the loop itself; it only cuts retry backoffs short so a batch
    /// mid-retry spills instead of holding up shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TelemetryItem>,
        shutdown: CancellationToken,
    ) {
        let mut pending: Vec<TelemetryItem> = Vec::with_capacity(self.batch_max_size);
        let mut ticker = interval(self.batch_max_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        pending.push(item);
                        if pending.len() >= self.batch_max_size {
                            self.dispatch(&mut pending, true, &shutdown).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.dispatch(&mut pending, true, &shutdown).await;
                    }
                }
            }
        }

        if !pending.is_empty() {
            info!(items = pending.len(), "final flush on shutdown");
            self.dispatch(&mut pending, false, &shutdown).await;
        }
    }

    async fn dispatch(
        &self,
        pending: &mut Vec<TelemetryItem>,
        with_retries: bool,
        shutdown: &CancellationToken,
    ) {
        let batch = std::mem::take(pending);
        self.sending.store(true, Ordering::Release);
        let result = if with_retries {
            self.send_with_retry(&batch, shutdown).await
        } else {
            self.send_once(&batch).await
        };
        self.sending.store(false, Ordering::Release);

        match result {
            Ok(()) => {}
            Err(TransportError::Permanent(detail)) => {
                error!(items = batch.len(), %detail, "batch rejected upstream, dropping");
                self.stats
                    .permanent_drops
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(TransportError::Transient(detail)) => {
                warn!(items = batch.len(), %detail, "delivery failed, spilling batch to disk");
                self.spill(&batch);
            }
        }
    }

    /// One delivery attempt plus bookkeeping on success.
    async fn send_once(&self, batch: &[TelemetryItem]) -> Result<(), TransportError> {
        let result = self.transport.send(batch).await;
        match &result {
            Ok(()) => {
                self.stats
                    .items_exported
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.stats.batches_exported.fetch_add(1, Ordering::Relaxed);
                if let Ok(payload) = serde_json::to_vec(batch) {
                    self.stats
                        .bytes_exported
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Retry transient failures with exponential backoff up to the
    /// configured attempt budget. Permanent failures return immediately.
    /// A cancellation during the backoff abandons the remaining attempts
    /// and hands the transient error back so the caller spills the batch.
    pub async fn send_with_retry(
        &self,
        batch: &[TelemetryItem],
        shutdown: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(batch).await {
                Ok(()) => return Ok(()),
                Err(e @ TransportError::Permanent(_)) => return Err(e),
                Err(e @ TransportError::Transient(_)) => {
                    if !self.retry.enabled || attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    debug!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient delivery failure, backing off"
                    );
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.cancelled() => {
                            debug!(attempt, "shutdown during retry backoff, abandoning attempts");
                            return Err(e);
                        }
                    }
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
            }
        }
    }

    fn spill(&self, batch: &[TelemetryItem]) {
        let Some(buffer) = &self.buffer else {
            warn!(
                items = batch.len(),
                "disk buffer disabled, dropping undeliverable batch"
            );
            self.stats.buffer_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        #[allow(clippy::expect_used)]
        let mut buffer = buffer.lock().expect("buffer lock poisoned");
        match buffer.store(batch) {
            Ok(evicted) => {
                self.stats.batches_buffered.fetch_add(1, Ordering::Relaxed);
                if evicted > 0 {
                    self.stats
                        .buffer_dropped
                        .fetch_add(evicted, Ordering::Relaxed);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to buffer batch, data lost");
                self.stats.buffer_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Periodic replay of buffered batches, oldest first. Skips a tick when
    /// a live send is in flight so replay never competes with fresh data.
    pub async fn run_replay(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        if self.buffer.is_none() {
            return;
        }
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if self.sending.load(Ordering::Acquire) {
                        continue;
                    }
                    self.replay_once(&shutdown).await;
                }
            }
        }
    }

    /// Drain the buffer until it is empty or a send fails.
    async fn replay_once(&self, shutdown: &CancellationToken) {
        loop {
            let oldest = {
                let Some(buffer) = &self.buffer else { return };
                #[allow(clippy::expect_used)]
                let mut buffer = buffer.lock().expect("buffer lock poisoned");
                match buffer.peek_oldest() {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "failed to read disk buffer");
                        self.stats.buffer_errors.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            };
            let Some((path, batch)) = oldest else { return };

            match self.send_with_retry(&batch, shutdown).await {
                Ok(()) => {
                    self.stats.batches_replayed.fetch_add(1, Ordering::Relaxed);
                    debug!(items = batch.len(), "replayed buffered batch");
                }
                Err(TransportError::Transient(_)) => {
                    // still unreachable; leave the segment for the next tick
                    return;
                }
                Err(TransportError::Permanent(detail)) => {
                    error!(%detail, "buffered batch rejected upstream, dropping");
                    self.stats
                        .permanent_drops
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
            }

            let Some(buffer) = &self.buffer else { return };
            #[allow(clippy::expect_used)]
            let mut buffer = buffer.lock().expect("buffer lock poisoned");
            if let Err(e) = buffer.remove(&path) {
                warn!(error = %e, "failed to remove replayed segment");
                self.stats.buffer_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    pub fn stats(&self) -> &ExporterStats {
        &self.stats
    }

    pub fn buffered_segments(&self) -> usize {
        let Some(buffer) = &self.buffer else { return 0 };
        #[allow(clippy::expect_used)]
        let buffer = buffer.lock().expect("buffer lock poisoned");
        buffer.segment_count().unwrap_or(0)
    }
}
