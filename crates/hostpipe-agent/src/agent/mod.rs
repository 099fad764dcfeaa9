//! Agent orchestration: build every component from the config, run one
//! task per worker, and take the whole thing down in order on shutdown so
//! in-flight telemetry drains instead of vanishing.

pub mod health;

use std::env;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{host::read_self_rss, run_metric_source, run_tailer, HostMetricsSource, LogTailer};
use crate::config::Config;
use crate::error::AgentError;
use crate::export::{DiskBuffer, Exporter, ExporterStats, HttpTransport};
use crate::pipeline::{Pipeline, PipelineItem, PipelineStats};
use crate::telemetry::TelemetryItem;

const PIPELINE_QUEUE_CAPACITY: usize = 4096;
const EXPORT_QUEUE_CAPACITY: usize = 1024;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until the token fires, then drain and stop. Errors here are all
    /// boot-time; a running agent degrades, it does not return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let config = self.config;
        let hostname = resolve_hostname(&config.agent.hostname);
        info!(
            hostname = %hostname,
            environment = %config.agent.environment,
            endpoint = %config.export.endpoint,
            "starting agent"
        );

        let transport =
            HttpTransport::new(&config.export).map_err(|e| AgentError::Transport(e.to_string()))?;
        let buffer = if config.export.buffer.enabled {
            Some(
                DiskBuffer::open(&config.export.buffer.path, config.export.buffer.max_bytes)
                    .map_err(AgentError::Buffer)?,
            )
        } else {
            None
        };
        let health_listener = health::bind(config.agent.health_port).await?;

        let (collect_tx, collect_rx) = mpsc::channel::<PipelineItem>(PIPELINE_QUEUE_CAPACITY);
        let (export_tx, export_rx) = mpsc::channel::<TelemetryItem>(EXPORT_QUEUE_CAPACITY);

        let pipeline_stats = Arc::new(PipelineStats::default());
        let pipeline = Arc::new(Pipeline::new(
            &config,
            &hostname,
            export_tx,
            pipeline_stats.clone(),
        ));
        let exporter = Arc::new(Exporter::new(
            Arc::new(transport),
            buffer,
            &config.export,
            Arc::new(ExporterStats::default()),
        ));

        let health_state = Arc::new(health::HealthState {
            hostname: hostname.clone(),
            started_at: Instant::now(),
            ready: AtomicBool::new(false),
            rss_bytes: AtomicU64::new(0),
            pipeline: pipeline.clone(),
            exporter: exporter.clone(),
        });

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        if config.metrics.enabled {
            workers.push(tokio::spawn(run_metric_source(
                Box::new(HostMetricsSource::new(
                    config.metrics.collect_cpu,
                    config.metrics.collect_memory,
                    config.metrics.collect_network,
                )),
                config.metrics.interval(),
                collect_tx.clone(),
                pipeline_stats.clone(),
                shutdown.clone(),
            )));
        }
        if config.logs.enabled {
            for source in &config.logs.sources {
                workers.push(tokio::spawn(run_tailer(
                    LogTailer::new(source, config.logs.max_lines_per_poll),
                    config.logs.poll_interval(),
                    collect_tx.clone(),
                    pipeline_stats.clone(),
                    shutdown.clone(),
                )));
            }
        }
        drop(collect_tx);

        workers.push(tokio::spawn(
            pipeline.clone().run(collect_rx, shutdown.clone()),
        ));
        workers.push(tokio::spawn(run_flush_timers(
            pipeline.clone(),
            config.clone(),
            shutdown.clone(),
        )));
        workers.push(tokio::spawn(run_watchdog(
            pipeline.clone(),
            health_state.clone(),
            config.resources.max_memory_bytes,
            shutdown.clone(),
        )));
        workers.push(tokio::spawn(exporter.clone().run_replay(
            config.export.buffer.replay_interval(),
            shutdown.clone(),
        )));
        workers.push(tokio::spawn(health::serve(
            health_listener,
            health_state.clone(),
            shutdown.clone(),
        )));

        // the exporter stops when the pipeline's sender side closes, not on
        // the token, so the final flush below still has somewhere to go;
        // the token only cuts retry backoffs short
        let export_worker = tokio::spawn(exporter.clone().run(export_rx, shutdown.clone()));

        health_state.ready.store(true, Ordering::Release);
        info!("agent ready");
        shutdown.cancelled().await;

        info!("shutting down");
        health_state.ready.store(false, Ordering::Release);
        for worker in workers {
            if timeout(SHUTDOWN_GRACE, worker).await.is_err() {
                warn!("worker did not stop within grace period");
            }
        }

        pipeline.flush_all().await;
        drop(health_state);
        drop(pipeline);
        if timeout(SHUTDOWN_GRACE, export_worker).await.is_err() {
            warn!("exporter did not drain within grace period");
        }
        info!("agent stopped");
        Ok(())
    }
}

/// Periodic flushes: the aggregation window, the dedup window, and the
/// idle-state sweep.
async fn run_flush_timers(pipeline: Arc<Pipeline>, config: Config, shutdown: CancellationToken) {
    let mut aggregate = interval(config.aggregation.window());
    let mut dedup = interval(config.logs.dedup.window());
    let sweep_every = config.cardinality.series_ttl().max(Duration::from_secs(60)) / 2;
    let mut sweep = interval(sweep_every);
    for ticker in [&mut aggregate, &mut dedup, &mut sweep] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // intervals fire immediately; skip the initial tick
        ticker.reset();
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = aggregate.tick() => pipeline.flush_aggregates().await,
            _ = dedup.tick() => pipeline.flush_dedup().await,
            _ = sweep.tick() => pipeline.sweep(),
        }
    }
}

/// Resource watchdog: samples the agent's RSS, publishes it to the health
/// surface, and forces a reclamation sweep when over budget.
async fn run_watchdog(
    pipeline: Arc<Pipeline>,
    health: Arc<health::HealthState>,
    max_memory_bytes: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(WATCHDOG_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let Some(rss) = read_self_rss() else { continue };
                health.rss_bytes.store(rss, Ordering::Relaxed);
                if max_memory_bytes > 0 && rss > max_memory_bytes {
                    warn!(
                        rss_bytes = rss,
                        max_memory_bytes,
                        "over memory budget, forcing state reclamation"
                    );
                    pipeline.sweep();
                }
            }
        }
    }
}

/// Config override, then the kernel, then the environment.
fn resolve_hostname(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_hostname_wins() {
        assert_eq!(resolve_hostname("pinned-name"), "pinned-name");
    }

    #[test]
    fn empty_hostname_is_resolved_to_something() {
        assert!(!resolve_hostname("").is_empty());
    }

    #[tokio::test]
    async fn agent_boots_and_stops_cleanly() {
        let buffer_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.health_port = 0; // any free port
        config.metrics.interval_secs = 3600;
        config.export.buffer.path = buffer_dir.path().to_path_buf();
        // nothing listens on the endpoint; the disk buffer absorbs failures
        config.export.endpoint = "127.0.0.1:1".into();
        config.export.retry.max_attempts = 1;
        config.export.retry.initial_backoff_ms = 1;

        let shutdown = CancellationToken::new();
        let agent = Agent::new(config);
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        shutdown.cancel();
        timeout(Duration::from_secs(30), handle)
            .await
            .expect("agent must stop within the grace budget")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_health_port_fails_boot() {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default();
        config.agent.health_port = port;
        config.export.buffer.enabled = false;

        let err = Agent::new(config)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::HealthBind { .. }));
    }
}
