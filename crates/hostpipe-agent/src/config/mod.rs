//! Agent configuration.
//!
//! Values are resolved in priority order: built-in defaults, then the YAML
//! config file, then `HOSTPIPE_*` environment overrides. Validation runs
//! once at boot and is the only fatal error path in the agent; everything
//! after boot degrades instead of exiting.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration, apply environment overrides, and validate.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_yaml::from_str(&text)?
        }
        None => Config::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub agent: AgentSection,
    pub metrics: MetricsSection,
    pub logs: LogsSection,
    pub aggregation: AggregationSection,
    pub sampling: SamplingSection,
    pub cardinality: CardinalitySection,
    pub export: ExportSection,
    pub resources: ResourcesSection,
}

impl Config {
    /// Environment overrides, applied after the file so operators can adjust
    /// a deployed config without editing it.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("HOSTPIPE_ENDPOINT") {
            if !v.trim().is_empty() {
                self.export.endpoint = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("HOSTPIPE_API_KEY") {
            if !v.trim().is_empty() {
                self.export.api_key = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("HOSTPIPE_ENVIRONMENT") {
            if !v.trim().is_empty() {
                self.agent.environment = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("HOSTPIPE_HOSTNAME") {
            if !v.trim().is_empty() {
                self.agent.hostname = v.trim().to_string();
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.enabled && self.metrics.interval_secs < 5 {
            return Err(ConfigError::Invalid(format!(
                "metrics.interval_secs must be at least 5, got {}",
                self.metrics.interval_secs
            )));
        }
        if self.aggregation.enabled && self.aggregation.window_secs < 10 {
            return Err(ConfigError::Invalid(format!(
                "aggregation.window_secs must be at least 10, got {}",
                self.aggregation.window_secs
            )));
        }
        if self.logs.dedup.enabled && self.logs.dedup.max_patterns == 0 {
            return Err(ConfigError::Invalid(
                "logs.dedup.max_patterns must be greater than zero".into(),
            ));
        }
        for (field, rate) in [
            ("sampling.base_rate", self.sampling.base_rate),
            ("sampling.log_info_rate", self.sampling.log_info_rate),
            ("sampling.log_debug_rate", self.sampling.log_debug_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be between 0 and 1, got {rate}"
                )));
            }
        }
        if self.export.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("export.endpoint must be set".into()));
        }
        if self.export.batch.max_size == 0 {
            return Err(ConfigError::Invalid(
                "export.batch.max_size must be greater than zero".into(),
            ));
        }
        if self.export.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "export.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.export.buffer.enabled && self.export.buffer.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "export.buffer.max_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Empty means detect from the OS at boot.
    pub hostname: String,
    pub service_name: String,
    pub environment: String,
    /// Static labels attached to every exported item.
    pub tags: BTreeMap<String, String>,
    pub health_port: u16,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            service_name: "hostpipe".into(),
            environment: "production".into(),
            tags: BTreeMap::new(),
            health_port: 13133,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub collect_cpu: bool,
    pub collect_memory: bool,
    pub collect_network: bool,
}

impl MetricsSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            collect_cpu: true,
            collect_memory: true,
            collect_network: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogsSection {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Upper bound on lines consumed from one file in one poll, so a burst
    /// in one source cannot starve the others.
    pub max_lines_per_poll: usize,
    pub sources: Vec<LogSource>,
    pub dedup: DedupSection,
}

impl LogsSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 250,
            max_lines_per_poll: 1000,
            sources: Vec::new(),
            dedup: DedupSection::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSource {
    pub path: PathBuf,
    pub service: String,
    pub extract_trace_context: bool,
}

impl Default for LogSource {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            service: String::new(),
            extract_trace_context: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupSection {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_patterns: usize,
}

impl DedupSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            max_patterns: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationSection {
    pub enabled: bool,
    pub window_secs: u64,
    /// Which aggregates to emit per series per window. Recognized values:
    /// count, sum, min, max, avg, p50, p90, p95, p99.
    pub aggregates: Vec<String>,
    pub drop_raw: bool,
}

impl AggregationSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            aggregates: ["count", "sum", "min", "max", "avg"]
                .into_iter()
                .map(String::from)
                .collect(),
            drop_raw: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingSection {
    pub enabled: bool,
    /// Probability of keeping an item that matches no hard-keep rule.
    pub base_rate: f64,
    pub slow_threshold_ms: u64,
    pub always_keep_errors: bool,
    /// Multiplier applied to base_rate for operations not seen within
    /// rare_window_secs.
    pub rare_operation_boost: f64,
    pub rare_window_secs: u64,
    pub log_info_rate: f64,
    pub log_debug_rate: f64,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_rate: 1.0,
            slow_threshold_ms: 1000,
            always_keep_errors: true,
            rare_operation_boost: 5.0,
            rare_window_secs: 60,
            log_info_rate: 0.1,
            log_debug_rate: 0.01,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CardinalitySection {
    pub enabled: bool,
    pub max_series_per_metric: usize,
    /// Per-label-key allowance of distinct values. Zero strips the label
    /// entirely; over-allowance values collapse into `__other__`.
    pub max_label_values: BTreeMap<String, usize>,
    /// Labels removed from every sample before anything else looks at it.
    pub drop_labels: Vec<String>,
    pub alert_threshold: usize,
    /// Idle series and counter state older than this are reclaimed.
    pub series_ttl_secs: u64,
}

impl CardinalitySection {
    pub fn series_ttl(&self) -> Duration {
        Duration::from_secs(self.series_ttl_secs)
    }
}

impl Default for CardinalitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_series_per_metric: 10_000,
            max_label_values: ["user_id", "request_id", "session_id", "trace_id"]
                .into_iter()
                .map(|k| (k.to_string(), 0))
                .collect(),
            drop_labels: ["password", "token", "secret"]
                .into_iter()
                .map(String::from)
                .collect(),
            alert_threshold: 5000,
            series_ttl_secs: 900,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportSection {
    /// host:port of the upstream intake; scheme comes from tls.enabled.
    pub endpoint: String,
    pub api_key: String,
    pub bearer_token: String,
    pub tls: TlsSection,
    pub request_timeout_secs: u64,
    pub batch: BatchSection,
    pub retry: RetrySection,
    pub buffer: BufferSection,
}

impl ExportSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls.enabled { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            endpoint: "localhost:4318".into(),
            api_key: String::new(),
            bearer_token: String::new(),
            tls: TlsSection::default(),
            request_timeout_secs: 30,
            batch: BatchSection::default(),
            retry: RetrySection::default(),
            buffer: BufferSection::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub enabled: bool,
    pub skip_verify: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub max_size: usize,
    pub max_wait_secs: u64,
}

impl BatchSection {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_wait_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetrySection {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferSection {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_bytes: u64,
    pub replay_interval_secs: u64,
}

impl BufferSection {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval_secs)
    }
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/lib/hostpipe/buffer"),
            max_bytes: 256 * 1024 * 1024,
            replay_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcesSection {
    pub max_memory_bytes: u64,
    /// Target CPU budget in cores; used to size the runtime when
    /// worker_threads is 0.
    pub max_cpu: f64,
    /// Explicit runtime thread count; 0 derives it from max_cpu.
    pub worker_threads: usize,
}

impl ResourcesSection {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        (self.max_cpu.ceil() as usize).max(1)
    }
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024,
            max_cpu: 0.5,
            worker_threads: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metrics.interval_secs, 15);
        assert_eq!(config.aggregation.window_secs, 60);
        assert_eq!(config.export.retry.max_attempts, 5);
        assert_eq!(config.cardinality.max_label_values.get("user_id"), Some(&0));
    }

    #[test]
    fn partial_yaml_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
agent:
  environment: staging
metrics:
  interval_secs: 30
export:
  endpoint: intake.example.com:443
  tls:
    enabled: true
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.agent.environment, "staging");
        assert_eq!(config.metrics.interval_secs, 30);
        assert_eq!(config.export.base_url(), "https://intake.example.com:443");
        // untouched sections keep defaults
        assert_eq!(config.logs.poll_interval_ms, 250);
        assert_eq!(config.sampling.log_info_rate, 0.1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "metrics:\n  intervall_secs: 30\n").unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn interval_below_floor_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "metrics:\n  interval_secs: 1\n").unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn window_below_floor_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "aggregation:\n  window_secs: 3\n").unwrap();
        assert!(load(Some(file.path())).is_err());
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "sampling:\n  base_rate: 1.5\n").unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("base_rate"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load(Some(Path::new("/nonexistent/hostpipe.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    #[serial]
    fn env_overrides_take_priority_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "export:\n  endpoint: from-file:4318\n").unwrap();

        env::set_var("HOSTPIPE_ENDPOINT", "from-env:4318");
        env::set_var("HOSTPIPE_API_KEY", "  sekrit  ");
        let config = load(Some(file.path())).unwrap();
        env::remove_var("HOSTPIPE_ENDPOINT");
        env::remove_var("HOSTPIPE_API_KEY");

        assert_eq!(config.export.endpoint, "from-env:4318");
        assert_eq!(config.export.api_key, "sekrit");
    }

    #[test]
    #[serial]
    fn blank_env_values_are_ignored() {
        env::set_var("HOSTPIPE_HOSTNAME", "   ");
        let config = load(None).unwrap();
        env::remove_var("HOSTPIPE_HOSTNAME");
        assert_eq!(config.agent.hostname, "");
    }

    #[test]
    fn zero_worker_threads_derives_the_count_from_the_cpu_budget() {
        let mut resources = ResourcesSection::default();
        assert_eq!(resources.effective_worker_threads(), 2);

        resources.worker_threads = 0;
        resources.max_cpu = 0.5;
        assert_eq!(resources.effective_worker_threads(), 1);

        resources.max_cpu = 3.2;
        assert_eq!(resources.effective_worker_threads(), 4);

        resources.max_cpu = 0.0;
        assert_eq!(resources.effective_worker_threads(), 1);
    }
}
