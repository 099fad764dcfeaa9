//! Host metrics from procfs.
//!
//! Each sub-collector reads one file under /proc, parses what it can, and
//! logs a debug line when the file is missing or malformed (containers and
//! non-Linux dev machines lack some of them). CPU and network values are
//! emitted as raw cumulative counters; the rate tracker downstream turns
//! them into per-second gauges.

use std::fs;

use tracing::debug;

use super::{CollectError, MetricSource};
use crate::telemetry::MetricSample;

const PROC_MEMINFO: &str = "/proc/meminfo";
const PROC_STAT: &str = "/proc/stat";
const PROC_NET_DEV: &str = "/proc/net/dev";
const PROC_SELF_STATM: &str = "/proc/self/statm";

// statm reports pages; the kernel page size on every platform this agent
// targets
const PAGE_SIZE: u64 = 4096;

pub struct HostMetricsSource {
    collect_cpu: bool,
    collect_memory: bool,
    collect_network: bool,
}

impl HostMetricsSource {
    pub fn new(collect_cpu: bool, collect_memory: bool, collect_network: bool) -> Self {
        Self {
            collect_cpu,
            collect_memory,
            collect_network,
        }
    }
}

impl MetricSource for HostMetricsSource {
    fn name(&self) -> &'static str {
        "host"
    }

    fn collect(&mut self, now_ms: u64) -> Result<Vec<MetricSample>, CollectError> {
        let mut out = Vec::new();
        if self.collect_memory {
            collect_memory(&mut out, now_ms);
        }
        if self.collect_cpu {
            collect_cpu(&mut out, now_ms);
        }
        if self.collect_network {
            collect_network(&mut out, now_ms);
        }
        collect_self(&mut out, now_ms);
        Ok(out)
    }
}

fn collect_memory(out: &mut Vec<MetricSample>, now_ms: u64) {
    let Some(text) = read_proc(PROC_MEMINFO) else { return };
    let Some((total_kb, available_kb)) = parse_meminfo(&text) else {
        debug!(path = PROC_MEMINFO, "unexpected meminfo format");
        return;
    };
    let total = total_kb * 1024;
    let available = available_kb * 1024;
    let used = total.saturating_sub(available);
    out.push(MetricSample::gauge("system.memory.total_bytes", total as f64, now_ms).with_unit("bytes"));
    out.push(
        MetricSample::gauge("system.memory.available_bytes", available as f64, now_ms)
            .with_unit("bytes"),
    );
    out.push(MetricSample::gauge("system.memory.used_bytes", used as f64, now_ms).with_unit("bytes"));
    if total > 0 {
        out.push(
            MetricSample::gauge(
                "system.memory.utilization",
                used as f64 / total as f64 * 100.0,
                now_ms,
            )
            .with_unit("percent"),
        );
    }
}

fn collect_cpu(out: &mut Vec<MetricSample>, now_ms: u64) {
    let Some(text) = read_proc(PROC_STAT) else { return };
    for (mode, jiffies) in parse_proc_stat(&text) {
        out.push(
            MetricSample::counter("system.cpu.time", jiffies as f64, now_ms)
                .with_label("mode", mode)
                .with_unit("jiffies"),
        );
    }
}

fn collect_network(out: &mut Vec<MetricSample>, now_ms: u64) {
    let Some(text) = read_proc(PROC_NET_DEV) else { return };
    for iface in parse_net_dev(&text) {
        for (name, value) in [
            ("system.network.bytes_recv", iface.rx_bytes),
            ("system.network.bytes_sent", iface.tx_bytes),
            ("system.network.packets_recv", iface.rx_packets),
            ("system.network.packets_sent", iface.tx_packets),
        ] {
            out.push(
                MetricSample::counter(name, value as f64, now_ms)
                    .with_label("interface", iface.name.clone()),
            );
        }
    }
}

/// The agent watches its own footprint; the watchdog and the upstream both
/// want this series.
fn collect_self(out: &mut Vec<MetricSample>, now_ms: u64) {
    if let Some(rss) = read_self_rss() {
        out.push(MetricSample::gauge("hostpipe.agent.rss_bytes", rss as f64, now_ms).with_unit("bytes"));
    }
}

pub fn read_self_rss() -> Option<u64> {
    let text = read_proc(PROC_SELF_STATM)?;
    parse_statm_rss(&text).map(|pages| pages * PAGE_SIZE)
}

fn read_proc(path: &str) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(path, error = %e, "procfs read failed");
            None
        }
    }
}

/// MemTotal and MemAvailable in kB.
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = first_number(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = first_number(rest);
        }
    }
    Some((total?, available?))
}

/// Jiffies per mode from the aggregate `cpu` line.
fn parse_proc_stat(text: &str) -> Vec<(&'static str, u64)> {
    const MODES: [&str; 8] = [
        "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal",
    ];
    let Some(line) = text.lines().find(|l| l.starts_with("cpu ")) else {
        return Vec::new();
    };
    line.split_whitespace()
        .skip(1)
        .zip(MODES)
        .filter_map(|(field, mode)| field.parse::<u64>().ok().map(|v| (mode, v)))
        .collect()
}

pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Per-interface counters from /proc/net/dev, loopback excluded.
fn parse_net_dev(text: &str) -> Vec<InterfaceCounters> {
    let mut out = Vec::new();
    // first two lines are headers
    for line in text.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        // rx bytes/packets are fields 0/1, tx bytes/packets are 8/9
        if fields.len() < 10 {
            continue;
        }
        out.push(InterfaceCounters {
            name: name.to_string(),
            rx_bytes: fields[0],
            rx_packets: fields[1],
            tx_bytes: fields[8],
            tx_packets: fields[9],
        });
    }
    out
}

/// Second field of /proc/self/statm is resident pages.
fn parse_statm_rss(text: &str) -> Option<u64> {
    text.split_whitespace().nth(1)?.parse().ok()
}

fn first_number(text: &str) -> Option<u64> {
    text.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricKind;

    #[test]
    fn meminfo_parses_total_and_available() {
        let text = "MemTotal:       16303448 kB\n\
                    MemFree:         1593820 kB\n\
                    MemAvailable:    9387340 kB\n\
                    Buffers:          945132 kB\n";
        assert_eq!(parse_meminfo(text), Some((16_303_448, 9_387_340)));
    }

    #[test]
    fn meminfo_without_available_is_rejected() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn proc_stat_parses_the_aggregate_cpu_line() {
        let text = "cpu  74608 2520 24433 1117073 6176 4054 0 0 0 0\n\
                    cpu0 37304 1260 12216 558536 3088 2027 0 0 0 0\n\
                    intr 8885917\n";
        let modes = parse_proc_stat(text);
        assert_eq!(modes.len(), 8);
        assert_eq!(modes[0], ("user", 74_608));
        assert_eq!(modes[3], ("idle", 1_117_073));
        assert_eq!(modes[7], ("steal", 0));
    }

    #[test]
    fn proc_stat_without_cpu_line_yields_nothing() {
        assert!(parse_proc_stat("intr 12345\n").is_empty());
    }

    #[test]
    fn net_dev_skips_headers_and_loopback() {
        let text = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1234567    9876    0    0    0     0          0         0  1234567    9876    0    0    0     0       0          0
  eth0: 8888888    7777    0    0    0     0          0         0  4444444    3333    0    0    0     0       0          0
";
        let ifaces = parse_net_dev(text);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].name, "eth0");
        assert_eq!(ifaces[0].rx_bytes, 8_888_888);
        assert_eq!(ifaces[0].rx_packets, 7_777);
        assert_eq!(ifaces[0].tx_bytes, 4_444_444);
        assert_eq!(ifaces[0].tx_packets, 3_333);
    }

    #[test]
    fn statm_rss_is_the_second_field() {
        assert_eq!(parse_statm_rss("12345 678 90 1 0 234 0\n"), Some(678));
        assert_eq!(parse_statm_rss(""), None);
    }

    #[test]
    fn cpu_samples_are_counters_with_mode_labels() {
        let text = "cpu  100 0 50 1000 0 0 0 0 0 0\n";
        let mut out = Vec::new();
        for (mode, jiffies) in parse_proc_stat(text) {
            out.push(
                MetricSample::counter("system.cpu.time", jiffies as f64, 0)
                    .with_label("mode", mode),
            );
        }
        assert!(out.iter().all(|m| m.kind == MetricKind::Counter));
        assert!(out.iter().any(|m| m.labels.get("mode").map(String::as_str) == Some("idle")));
    }
}
