//! Priority sampling.
//!
//! Two decision paths: [`Sampler::keep_event`] for anything with an
//! operation name and optional latency (errors and slow items are always
//! kept, rarely-seen operations get a boosted rate), and
//! [`Sampler::keep_log`] for log records (severity-tiered rates with a hard
//! always-keep override at error and above).

use std::collections::HashMap;

use rand::Rng;

use crate::config::SamplingSection;
use crate::telemetry::Severity;

pub struct Sampler {
    base_rate: f64,
    slow_threshold_ms: u64,
    always_keep_errors: bool,
    rare_boost: f64,
    rare_window_ms: u64,
    log_info_rate: f64,
    log_debug_rate: f64,
    /// operation -> last seen (ms). Used for the rare-operation boost.
    last_seen: HashMap<String, u64>,
}

impl Sampler {
    pub fn new(config: &SamplingSection) -> Self {
        Self {
            base_rate: config.base_rate,
            slow_threshold_ms: config.slow_threshold_ms,
            always_keep_errors: config.always_keep_errors,
            rare_boost: config.rare_operation_boost,
            rare_window_ms: config.rare_window_secs * 1000,
            log_info_rate: config.log_info_rate,
            log_debug_rate: config.log_debug_rate,
            last_seen: HashMap::new(),
        }
    }

    /// Decide whether to keep one item. The recency table is updated on
    /// every call, including for items that end up dropped.
    pub fn keep_event(
        &mut self,
        operation: &str,
        is_error: bool,
        duration_ms: Option<u64>,
        now_ms: u64,
    ) -> bool {
        let seen_recently = self
            .last_seen
            .insert(operation.to_string(), now_ms)
            .is_some_and(|last| now_ms.saturating_sub(last) <= self.rare_window_ms);

        if self.always_keep_errors && is_error {
            return true;
        }
        if let Some(duration) = duration_ms {
            if self.slow_threshold_ms > 0 && duration >= self.slow_threshold_ms {
                return true;
            }
        }

        let mut rate = self.base_rate;
        if !seen_recently {
            rate *= self.rare_boost;
        }
        draw(rate)
    }

    /// Severity-tiered decision for log records. Error and above always
    /// pass; warnings pass unconditionally as well since they are both rare
    /// and actionable.
    pub fn keep_log(&mut self, severity: Severity) -> bool {
        match severity {
            Severity::Error | Severity::Fatal => true,
            Severity::Warn => true,
            Severity::Info => draw(self.log_info_rate),
            Severity::Debug | Severity::Unspecified => draw(self.log_debug_rate),
        }
    }

    /// Drop recency entries older than the window; called from the
    /// reclamation sweep.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let window = self.rare_window_ms;
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, last| now_ms.saturating_sub(*last) <= window);
        before - self.last_seen.len()
    }
}

fn draw(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::thread_rng().gen::<f64>() < rate
}
