//! Local health and introspection surface.
//!
//! Four endpoints on a loopback-friendly port: `/health` (liveness),
//! `/ready` (readiness, flipped once all workers are up), `/metrics`
//! (text exposition of the agent's own counters) and `/status` (JSON
//! snapshot for humans and scripts).

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::export::{Exporter, ExporterSnapshot};
use crate::pipeline::{Pipeline, PipelineSnapshot};

pub struct HealthState {
    pub hostname: String,
    pub started_at: Instant,
    pub ready: AtomicBool,
    pub rss_bytes: AtomicU64,
    pub pipeline: Arc<Pipeline>,
    pub exporter: Arc<Exporter>,
}

#[derive(Serialize)]
struct StatusSnapshot<'a> {
    status: &'static str,
    hostname: &'a str,
    uptime_seconds: u64,
    rss_bytes: u64,
    buffer_segments: usize,
    pipeline: PipelineSnapshot,
    exporter: ExporterSnapshot,
}

/// Bind the health port up front so a conflict is a boot failure, not a
/// silently dead endpoint.
pub async fn bind(port: u16) -> Result<TcpListener, AgentError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| AgentError::HealthBind { port, source })?;
    info!(port, "health server listening");
    Ok(listener)
}

pub async fn serve(listener: TcpListener, state: Arc<HealthState>, shutdown: CancellationToken) {
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "health accept failed");
                    continue;
                }
            },
        };
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(&state, req)) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %e, "health connection error");
            }
        });
    }
}

fn handle(state: &HealthState, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text(StatusCode::OK, "OK\n"),
        (&Method::GET, "/ready") => {
            if state.ready.load(Ordering::Acquire) {
                text(StatusCode::OK, "Ready\n")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "Not Ready\n")
            }
        }
        (&Method::GET, "/metrics") => text(StatusCode::OK, exposition(state)),
        (&Method::GET, "/status") => {
            let snapshot = StatusSnapshot {
                status: if state.ready.load(Ordering::Acquire) {
                    "running"
                } else {
                    "starting"
                },
                hostname: &state.hostname,
                uptime_seconds: state.started_at.elapsed().as_secs(),
                rss_bytes: state.rss_bytes.load(Ordering::Relaxed),
                buffer_segments: state.exporter.buffered_segments(),
                pipeline: state.pipeline.snapshot(),
                exporter: state.exporter.stats().snapshot(),
            };
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(body) => {
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("application/json"),
                    );
                    response
                }
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Prometheus-style exposition of the agent's own counters.
fn exposition(state: &HealthState) -> String {
    let pipeline = state.pipeline.snapshot();
    let exporter = state.exporter.stats().snapshot();
    let mut out = String::with_capacity(1024);
    for (name, value) in [
        ("hostpipe_metrics_in_total", pipeline.metrics_in),
        ("hostpipe_logs_in_total", pipeline.logs_in),
        (
            "hostpipe_logs_deduplicated_total",
            pipeline.logs_deduplicated,
        ),
        (
            "hostpipe_dropped_by_cardinality_total",
            pipeline.dropped_by_cardinality,
        ),
        (
            "hostpipe_dropped_by_sampling_total",
            pipeline.dropped_by_sampling,
        ),
        ("hostpipe_queue_dropped_total", pipeline.queue_dropped),
        (
            "hostpipe_aggregation_samples_in_total",
            pipeline.aggregation_samples_in,
        ),
        (
            "hostpipe_aggregation_samples_out_total",
            pipeline.aggregation_samples_out,
        ),
        ("hostpipe_items_exported_total", exporter.items_exported),
        ("hostpipe_batches_exported_total", exporter.batches_exported),
        ("hostpipe_bytes_exported_total", exporter.bytes_exported),
        ("hostpipe_send_failures_total", exporter.send_failures),
        ("hostpipe_permanent_drops_total", exporter.permanent_drops),
        ("hostpipe_batches_buffered_total", exporter.batches_buffered),
        ("hostpipe_batches_replayed_total", exporter.batches_replayed),
        ("hostpipe_buffer_dropped_total", exporter.buffer_dropped),
        (
            "hostpipe_buffer_segments",
            state.exporter.buffered_segments() as u64,
        ),
        ("hostpipe_rss_bytes", state.rss_bytes.load(Ordering::Relaxed)),
    ] {
        out.push_str(name);
        out.push(' ');
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out.push_str(&format!(
        "hostpipe_aggregation_reduction_ratio {:.4}\n",
        pipeline.aggregation_reduction
    ));
    out
}
