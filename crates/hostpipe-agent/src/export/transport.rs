//! Upstream transport.
//!
//! The exporter only cares about one distinction: failures that a retry
//! might fix (network errors, 5xx, 408, 429) versus failures that will
//! never succeed no matter how often the same payload is resent (other
//! 4xx). Permanent failures are reported and dropped; retrying them would
//! wedge the whole delivery path behind an unsendable batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::ExportSection;
use crate::telemetry::{LogRecord, MetricSample, TelemetryItem};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Worth retrying and, once retries are exhausted, worth buffering.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Never retried and never buffered.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

/// Seam between the exporter and the wire. Production uses
/// [`HttpTransport`]; tests substitute recording fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &[TelemetryItem]) -> Result<(), TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bearer_token: String,
}

impl HttpTransport {
    pub fn new(config: &ExportSection) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.tls.skip_verify)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// Test-only constructor pointing at an arbitrary base URL.
    #[cfg(test)]
    pub fn for_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            api_key: String::new(),
            bearer_token: String::new(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", &self.api_key);
        }
        if !self.bearer_token.is_empty() {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.bearer_token),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("{url}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            debug!(%url, %status, "export request accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("{url} returned {status}: {body}");
        if permanent_status(status) {
            Err(TransportError::Permanent(detail))
        } else {
            Err(TransportError::Transient(detail))
        }
    }
}

/// 4xx means the payload itself is unacceptable, with two exceptions the
/// server explicitly asks us to retry.
fn permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[TelemetryItem]) -> Result<(), TransportError> {
        let mut metrics: Vec<&MetricSample> = Vec::new();
        let mut logs: Vec<&LogRecord> = Vec::new();
        for item in batch {
            match item {
                TelemetryItem::Metric(m) => metrics.push(m),
                TelemetryItem::Log(l) => logs.push(l),
            }
        }

        if !metrics.is_empty() {
            self.post("/v1/metrics", &metrics_payload(&metrics)).await?;
        }
        if !logs.is_empty() {
            self.post("/v1/logs", &logs_payload(&logs)).await?;
        }
        Ok(())
    }
}

fn metrics_payload(metrics: &[&MetricSample]) -> Value {
    let entries: Vec<Value> = metrics
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "value": m.value,
                "timestamp": m.timestamp_ms * 1_000_000,
                "attributes": m.labels,
                "type": m.kind,
                "unit": m.unit,
            })
        })
        .collect();
    json!({
        "resource_metrics": [{
            "scope_metrics": [{ "metrics": entries }]
        }]
    })
}

fn logs_payload(logs: &[&LogRecord]) -> Value {
    let entries: Vec<Value> = logs
        .iter()
        .map(|l| {
            let mut entry = json!({
                "timestamp": l.timestamp_ms * 1_000_000,
                "body": l.body,
                "severity_text": l.severity.as_str(),
                "severity_number": l.severity.number(),
                "attributes": l.attributes,
            });
            if !l.service.is_empty() {
                entry["attributes"]["service.name"] = json!(l.service);
            }
            if !l.source.is_empty() {
                entry["attributes"]["log.file.path"] = json!(l.source);
            }
            if let Some(trace_id) = &l.trace_id {
                entry["trace_id"] = json!(trace_id);
            }
            if let Some(span_id) = &l.span_id {
                entry["span_id"] = json!(span_id);
            }
            entry
        })
        .collect();
    json!({
        "resource_logs": [{
            "scope_logs": [{ "log_records": entries }]
        }]
    })
}
