//! End-to-end: collected items flow through the reduction pipeline, get
//! batched by the exporter, and land on the HTTP intake.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hostpipe_agent::config::Config;
use hostpipe_agent::export::{Exporter, ExporterStats, HttpTransport};
use hostpipe_agent::pipeline::{Pipeline, PipelineItem, PipelineStats};
use hostpipe_agent::telemetry::{now_ms, LogRecord, MetricSample, TelemetryItem};

fn deterministic_config(endpoint: String) -> Config {
    let mut config = Config::default();
    config.export.endpoint = endpoint;
    config.export.buffer.enabled = false;
    config.export.batch.max_size = 4;
    config.export.batch.max_wait_secs = 1;
    config.export.retry.initial_backoff_ms = 1;
    config.sampling.base_rate = 1.0;
    config.sampling.log_info_rate = 1.0;
    config.sampling.log_debug_rate = 1.0;
    config
}

#[tokio::test]
async fn reduced_telemetry_reaches_the_intake() {
    let mut server = mockito::Server::new_async().await;
    let metrics_mock = server
        .mock("POST", "/v1/metrics")
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;
    let logs_mock = server
        .mock("POST", "/v1/logs")
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let config = deterministic_config(server.host_with_port());
    let (export_tx, export_rx) = mpsc::channel::<TelemetryItem>(256);
    let pipeline = Arc::new(Pipeline::new(
        &config,
        "it-host",
        export_tx,
        Arc::new(PipelineStats::default()),
    ));
    let transport = HttpTransport::new(&config.export).expect("client");
    let exporter = Arc::new(Exporter::new(
        Arc::new(transport),
        None,
        &config.export,
        Arc::new(ExporterStats::default()),
    ));
    let export_worker = tokio::spawn(exporter.clone().run(export_rx, CancellationToken::new()));

    let now = now_ms();
    // ten raw samples of one series: held in the aggregation window
    for i in 0..10 {
        pipeline
            .handle(PipelineItem::Metric(MetricSample::gauge(
                "req.latency",
                10.0 + i as f64,
                now + i,
            )))
            .await;
    }
    // three lines sharing a template plus one unique line
    for port in [8080, 8081, 8082] {
        pipeline
            .handle(PipelineItem::Log(LogRecord::new(
                format!("upstream on port {port} timed out"),
                now,
            )))
            .await;
    }
    pipeline
        .handle(PipelineItem::Log(LogRecord::new("agent deployed", now)))
        .await;

    pipeline.flush_all().await;
    let snapshot = pipeline.snapshot();
    drop(pipeline); // closes the export channel so the worker drains
    export_worker.await.expect("export worker");

    // 10 metric samples collapsed into 5 aggregates
    assert_eq!(snapshot.aggregation_samples_in, 10);
    assert_eq!(snapshot.aggregation_samples_out, 5);
    // two of three duplicate lines absorbed
    assert_eq!(snapshot.logs_deduplicated, 2);

    metrics_mock.assert_async().await;
    logs_mock.assert_async().await;

    let stats = exporter.stats().snapshot();
    // 5 aggregates + first occurrence + unique line + dedup summary
    assert_eq!(stats.items_exported, 8);
    assert_eq!(stats.send_failures, 0);
}

#[tokio::test]
async fn unreachable_intake_loses_nothing_to_the_buffer() {
    let buffer_dir = tempfile::tempdir().unwrap();
    let mut config = deterministic_config("127.0.0.1:1".into());
    config.export.buffer.enabled = true;
    config.export.retry.max_attempts = 2;

    let transport = HttpTransport::new(&config.export).expect("client");
    let buffer = hostpipe_agent::export::DiskBuffer::open(
        buffer_dir.path(),
        config.export.buffer.max_bytes,
    )
    .expect("buffer dir");
    let exporter = Arc::new(Exporter::new(
        Arc::new(transport),
        Some(buffer),
        &config.export,
        Arc::new(ExporterStats::default()),
    ));

    let (export_tx, export_rx) = mpsc::channel::<TelemetryItem>(16);
    let export_worker = tokio::spawn(exporter.clone().run(export_rx, CancellationToken::new()));
    for i in 0..4 {
        export_tx
            .send(TelemetryItem::Metric(MetricSample::gauge(
                "m",
                i as f64,
                now_ms(),
            )))
            .await
            .expect("send");
    }
    drop(export_tx);
    export_worker.await.expect("export worker");

    // the batch survived on disk instead of being dropped
    assert_eq!(exporter.buffered_segments(), 1);
    assert_eq!(exporter.stats().snapshot().batches_buffered, 1);
    assert_eq!(exporter.stats().snapshot().items_exported, 0);
}
