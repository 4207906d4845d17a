//! Host-level anomaly monitoring.
//!
//! Polls interface byte counters (and an optional latency probe file) on a
//! fixed cadence, keeps an EWMA baseline per metric, and fires a signal when
//! the instantaneous value diverges past the configured ratio. A refractory
//! period stops one sustained incident from re-firing every poll.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::monotonic_ns;
use crate::config::AnomalyConfig;

/// What kind of divergence fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    ThroughputDrop,
    LatencySpike,
}

/// One threshold-triggered observation.
#[derive(Debug, Clone, Copy)]
pub struct AnomalySignal {
    pub kind: AnomalyKind,
    /// Relative change versus baseline (throughput < 1.0, latency > 1.0).
    pub ratio: f64,
    /// Absolute measurement in native units (bytes/sec or microseconds).
    pub value: f64,
    /// Monotonic nanoseconds when the reading was taken.
    pub timestamp_ns: u64,
}

/// Callback invoked for each fired signal.
pub type AnomalyHandler = Box<dyn Fn(AnomalySignal) + Send + Sync>;

/// Periodic counter poller with EWMA baselines.
pub struct AnomalyMonitor {
    cfg: AnomalyConfig,
}

struct MetricState {
    baseline: f64,
    ready: bool,
    last_emit_ns: u64,
}

impl MetricState {
    fn new() -> Self {
        Self {
            baseline: 0.0,
            ready: false,
            last_emit_ns: 0,
        }
    }

    /// Fold one reading into the baseline and return the divergence ratio,
    /// or None for the seeding read.
    fn update(&mut self, instant: f64, alpha: f64) -> Option<f64> {
        if !self.ready {
            self.baseline = instant;
            self.ready = true;
            return None;
        }
        let alpha = alpha.clamp(0.01, 0.9);
        self.baseline = alpha * instant + (1.0 - alpha) * self.baseline;
        Some(instant / self.baseline.max(1.0))
    }

    fn in_refractory(&self, now_ns: u64, refractory: Duration) -> bool {
        now_ns.saturating_sub(self.last_emit_ns) < refractory.as_nanos() as u64
    }
}

impl AnomalyMonitor {
    pub fn new(cfg: AnomalyConfig) -> Self {
        Self { cfg }
    }

    /// Spawn the polling task. Does nothing when disabled.
    pub fn start(&self, handler: AnomalyHandler, cancel: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }

        let cfg = self.cfg.clone();
        tokio::spawn(async move {
            run_poll_loop(cfg, handler, cancel).await;
        });
    }
}

async fn run_poll_loop(cfg: AnomalyConfig, handler: AnomalyHandler, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(cfg.sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut throughput = MetricState::new();
    let mut latency = MetricState::new();
    let mut prev_bytes: Option<u64> = None;
    let mut prev_ns = monotonic_ns();

    info!(
        interval = ?cfg.sample_interval,
        interfaces = ?cfg.interfaces,
        "anomaly monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now_ns = monotonic_ns();

        match read_interface_rx_bytes(&cfg.interfaces) {
            Some(cur_bytes) => {
                if let Some(prev) = prev_bytes {
                    let delta_bytes = cur_bytes.saturating_sub(prev);
                    let delta_s = now_ns.saturating_sub(prev_ns) as f64 / 1e9;
                    if delta_s > 0.0 && delta_bytes > 0 {
                        let bps = delta_bytes as f64 / delta_s;
                        if let Some(ratio) = throughput.update(bps, cfg.throughput_alpha) {
                            if ratio < cfg.throughput_ratio
                                && !throughput.in_refractory(now_ns, cfg.refractory)
                            {
                                throughput.last_emit_ns = now_ns;
                                handler(AnomalySignal {
                                    kind: AnomalyKind::ThroughputDrop,
                                    ratio,
                                    value: bps,
                                    timestamp_ns: now_ns,
                                });
                            }
                        }
                    }
                }
                prev_bytes = Some(cur_bytes);
                prev_ns = now_ns;
            }
            None => {
                // Counter read failures skip the whole interval without
                // firing either metric.
                debug!("interface counter read failed, skipping interval");
                continue;
            }
        }

        if let Some(latency_us) = read_latency_probe(&cfg.latency_probe_path) {
            if let Some(ratio) = latency.update(latency_us, cfg.latency_alpha) {
                if ratio > cfg.latency_ratio && !latency.in_refractory(now_ns, cfg.refractory) {
                    latency.last_emit_ns = now_ns;
                    handler(AnomalySignal {
                        kind: AnomalyKind::LatencySpike,
                        ratio,
                        value: latency_us,
                        timestamp_ns: now_ns,
                    });
                }
            }
        }
    }
}

/// Sum RX bytes across the selected interfaces from `/proc/net/dev`.
/// An empty interface list sums every interface.
fn read_interface_rx_bytes(interfaces: &[String]) -> Option<u64> {
    let data = match std::fs::read_to_string("/proc/net/dev") {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "failed to read /proc/net/dev");
            return None;
        }
    };
    sum_rx_bytes(&data, interfaces)
}

fn sum_rx_bytes(data: &str, interfaces: &[String]) -> Option<u64> {
    let mut total = 0u64;
    let mut found = false;
    for line in data.lines().skip(2) {
        let Some((iface, stats)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if !interfaces.is_empty() && !interfaces.iter().any(|want| want == iface) {
            continue;
        }
        let rx_bytes = stats
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        total = total.saturating_add(rx_bytes);
        found = true;
    }
    found.then_some(total)
}

fn read_latency_probe(path: &str) -> Option<f64> {
    if path.is_empty() {
        return None;
    }
    let data = std::fs::read_to_string(path).ok()?;
    let value: f64 = data.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}
