use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// perf_event_attr type for generic hardware events.
pub const PERF_TYPE_HARDWARE: u32 = 0;
/// perf_event_attr type for raw, CPU-model-specific encodings.
pub const PERF_TYPE_RAW: u32 = 4;

const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

/// Top-level configuration for the microsentinel agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Kernel sampler and sample-source configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Rollup aggregation configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Mode state-machine thresholds.
    #[serde(default)]
    pub thresholds: ModeThresholds,

    /// Host anomaly monitor configuration.
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Per-CPU timestamp calibration configuration.
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Gauge exporter endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Control-plane endpoint.
    #[serde(default)]
    pub control: ControlConfig,

    /// Rollup/raw/stack/data store sink.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Start (and pin) the agent in Diagnostic mode.
    #[serde(default)]
    pub diagnostic_mode: bool,
}

/// One event inside a PMU group.
#[derive(Debug, Clone, Deserialize)]
pub struct PmuEventDesc {
    /// Human-readable event name, used in logs only.
    #[serde(default)]
    pub name: String,

    /// perf_event_attr type. Default: hardware.
    #[serde(default, rename = "type")]
    pub perf_type: u32,

    /// perf_event_attr config. Default: LLC misses.
    #[serde(default = "default_event_config")]
    pub config: u64,

    /// Counter overflow period. Default: 100000.
    #[serde(default = "default_sample_period")]
    pub sample_period: u64,

    /// Logical event identity stamped on emitted samples (numeric
    /// `ms_pmu_event_type` value).
    #[serde(default = "default_logical_event")]
    pub logical: u32,

    /// Request precise (PEBS-style) sampling.
    #[serde(default = "default_true")]
    pub precise: bool,
}

/// An ordered set of events attached together.
#[derive(Debug, Clone, Deserialize)]
pub struct PmuGroupConfig {
    pub name: String,
    pub events: Vec<PmuEventDesc>,
}

/// Kernel sampler and sample-source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Sentinel-mode token budget in samples/sec. Default: 5000.
    #[serde(default = "default_sentinel_budget")]
    pub sentinel_budget: u64,

    /// Diagnostic-mode token budget in samples/sec. Default: 20000.
    #[serde(default = "default_diagnostic_budget")]
    pub diagnostic_budget: u64,

    /// Hard inter-sample drop window in nanoseconds. Default: 8000.
    #[serde(default = "default_hard_drop_ns")]
    pub hard_drop_ns: u64,

    /// CPUs to sample. Empty means every online CPU.
    #[serde(default)]
    pub cpus: Vec<u32>,

    /// Force the synthetic sample generator even when BPF is available.
    #[serde(default)]
    pub mock_mode: bool,

    /// Synthetic generator emission period. Default: 10ms.
    #[serde(default = "default_mock_period", with = "humantime_serde")]
    pub mock_period: Duration,

    /// Path to the pre-built kernel sampler object.
    #[serde(default = "default_bpf_object_path")]
    pub bpf_object_path: String,

    /// Group sample-source workers by NUMA node. Default: true.
    #[serde(default = "default_true")]
    pub numa_workers: bool,

    /// Per-CPU ring size in pages. Default: 8.
    #[serde(default = "default_ring_pages")]
    pub ring_pages: usize,

    /// PMU group rotation period. Default: 5s.
    #[serde(default = "default_rotation_window", with = "humantime_serde")]
    pub rotation_window: Duration,

    /// Load ratio above which heavy events are shed. Default: 0.95.
    #[serde(default = "default_safety_high_watermark")]
    pub safety_high_watermark: f64,

    /// Load ratio below which shedding is lifted. Default: 0.75.
    #[serde(default = "default_safety_low_watermark")]
    pub safety_low_watermark: f64,

    /// Events kept per group while shedding. Default: 1.
    #[serde(default = "default_shed_event_limit")]
    pub shed_event_limit: usize,

    /// Flow back-fill tolerance in nanoseconds. Default: 2000.
    #[serde(default = "default_skew_tolerance_ns")]
    pub skew_tolerance_ns: u64,

    /// Flow back-fill window capacity per CPU. Default: 4.
    #[serde(default = "default_skew_window")]
    pub skew_window: usize,

    /// Event groups attached in Sentinel mode.
    #[serde(default = "default_sentinel_groups")]
    pub sentinel_groups: Vec<PmuGroupConfig>,

    /// Event groups attached in Diagnostic mode.
    #[serde(default = "default_diagnostic_groups")]
    pub diagnostic_groups: Vec<PmuGroupConfig>,
}

/// Rollup aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Bucket width in nanoseconds; 0 disables bucketing. Default: 5ms.
    #[serde(default = "default_agg_window_ns")]
    pub window_ns: u64,

    /// Table size that triggers a full shed. Default: 200000.
    #[serde(default = "default_agg_max_entries")]
    pub max_entries: usize,

    /// Flush cycle period. Default: 200ms.
    #[serde(default = "default_agg_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Mode state-machine thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ModeThresholds {
    /// Load ratio that promotes Sentinel to Diagnostic. Default: 1.10.
    #[serde(default = "default_sentinel_to_diag")]
    pub sentinel_to_diag: f64,

    /// Load ratio below which Diagnostic demotes. Default: 1.02.
    #[serde(default = "default_diag_to_sentinel")]
    pub diag_to_sentinel: f64,

    /// Throughput-drop ratio that promotes. Default: 0.85.
    #[serde(default = "default_throughput_ratio")]
    pub throughput_ratio_trigger: f64,

    /// Latency-spike ratio that promotes. Default: 1.25.
    #[serde(default = "default_mode_latency_ratio")]
    pub latency_ratio_trigger: f64,

    /// Hold in Diagnostic after an anomaly. Default: 5s.
    #[serde(default = "default_refractory", with = "humantime_serde")]
    pub quiet_period: Duration,
}

/// Host anomaly monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Enable the anomaly poller. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interfaces to watch. Empty sums every interface.
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Poll cadence. Default: 500ms.
    #[serde(default = "default_anomaly_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Throughput EWMA smoothing factor. Default: 0.1.
    #[serde(default = "default_throughput_alpha")]
    pub throughput_alpha: f64,

    /// Latency EWMA smoothing factor. Default: 0.2.
    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,

    /// Throughput-drop trigger ratio. Default: 0.85.
    #[serde(default = "default_throughput_ratio")]
    pub throughput_ratio: f64,

    /// Latency-spike trigger ratio. Default: 1.3.
    #[serde(default = "default_anomaly_latency_ratio")]
    pub latency_ratio: f64,

    /// Minimum spacing between emissions per metric. Default: 5s.
    #[serde(default = "default_refractory", with = "humantime_serde")]
    pub refractory: Duration,

    /// Optional file carrying the latest probe latency in microseconds.
    #[serde(default)]
    pub latency_probe_path: String,
}

/// Per-CPU timestamp calibration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Enable calibration. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Slope EWMA smoothing factor. Default: 0.05.
    #[serde(default = "default_tsc_alpha")]
    pub slope_alpha: f64,

    /// Offset EWMA smoothing factor. Default: 0.05.
    #[serde(default = "default_tsc_alpha")]
    pub offset_alpha: f64,
}

/// Gauge exporter endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Default: "0.0.0.0".
    #[serde(default = "default_metrics_address")]
    pub address: String,

    /// Listen port. Default: 9105.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Control-plane endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Listen address. Default: "127.0.0.1".
    #[serde(default = "default_control_address")]
    pub address: String,

    /// Listen port. Default: 9200.
    #[serde(default = "default_control_port")]
    pub port: u16,
}

/// Rollup/raw/stack/data store sink.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Store HTTP endpoint. Default: "http://localhost:8123".
    #[serde(default = "default_sink_endpoint")]
    pub endpoint: String,

    /// Rollup table name. Default: "ms_flow_rollup".
    #[serde(default = "default_sink_table")]
    pub table: String,

    /// Stack intern table name. Default: "ms_stack_traces".
    #[serde(default = "default_stack_table")]
    pub stack_table: String,

    /// Raw sample table name. Default: "ms_raw_samples".
    #[serde(default = "default_raw_table")]
    pub raw_table: String,

    /// Data object table name. Default: "ms_data_objects".
    #[serde(default = "default_data_table")]
    pub data_table: String,

    /// Background flush cadence. Default: 500ms.
    #[serde(default = "default_sink_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Queue length that triggers an opportunistic flush. Default: 4096.
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: usize,
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.sink.endpoint.starts_with("http://") {
            bail!("sink.endpoint must be an http:// URL: {}", self.sink.endpoint);
        }
        if self.aggregator.max_entries == 0 {
            bail!("aggregator.max_entries must be positive");
        }
        if self.thresholds.sentinel_to_diag < self.thresholds.diag_to_sentinel {
            bail!(
                "thresholds.sentinel_to_diag ({}) must be >= thresholds.diag_to_sentinel ({})",
                self.thresholds.sentinel_to_diag,
                self.thresholds.diag_to_sentinel
            );
        }
        if self.sampling.sentinel_budget == 0 || self.sampling.diagnostic_budget == 0 {
            bail!("sampling budgets must be positive");
        }
        for group in self
            .sampling
            .sentinel_groups
            .iter()
            .chain(&self.sampling.diagnostic_groups)
        {
            if group.events.is_empty() {
                bail!("PMU group '{}' has no events", group.name);
            }
        }
        Ok(())
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_config() -> u64 {
    PERF_COUNT_HW_CACHE_MISSES
}

fn default_sample_period() -> u64 {
    100_000
}

fn default_logical_event() -> u32 {
    1 // l3_miss
}

fn default_sentinel_budget() -> u64 {
    5000
}

fn default_diagnostic_budget() -> u64 {
    20_000
}

fn default_hard_drop_ns() -> u64 {
    8000
}

fn default_mock_period() -> Duration {
    Duration::from_millis(10)
}

fn default_bpf_object_path() -> String {
    "bpf/microsentinel_kern.bpf.o".to_string()
}

fn default_ring_pages() -> usize {
    8
}

fn default_rotation_window() -> Duration {
    Duration::from_secs(5)
}

fn default_safety_high_watermark() -> f64 {
    0.95
}

fn default_safety_low_watermark() -> f64 {
    0.75
}

fn default_shed_event_limit() -> usize {
    1
}

fn default_skew_tolerance_ns() -> u64 {
    2000
}

fn default_skew_window() -> usize {
    4
}

fn default_sentinel_groups() -> Vec<PmuGroupConfig> {
    vec![PmuGroupConfig {
        name: "sentinel-default".to_string(),
        events: vec![PmuEventDesc {
            name: "l3_miss".to_string(),
            perf_type: PERF_TYPE_HARDWARE,
            config: PERF_COUNT_HW_CACHE_MISSES,
            sample_period: 200_000,
            logical: 1,
            precise: true,
        }],
    }]
}

fn default_diagnostic_groups() -> Vec<PmuGroupConfig> {
    vec![PmuGroupConfig {
        name: "diagnostic-default".to_string(),
        events: vec![
            PmuEventDesc {
                name: "l3_miss".to_string(),
                perf_type: PERF_TYPE_HARDWARE,
                config: PERF_COUNT_HW_CACHE_MISSES,
                sample_period: 150_000,
                logical: 1,
                precise: true,
            },
            PmuEventDesc {
                name: "branch_mispred".to_string(),
                perf_type: PERF_TYPE_HARDWARE,
                config: PERF_COUNT_HW_BRANCH_MISSES,
                sample_period: 120_000,
                logical: 2,
                precise: false,
            },
            PmuEventDesc {
                name: "xsnp_hitm".to_string(),
                perf_type: PERF_TYPE_RAW,
                config: 0x1b7,
                sample_period: 80_000,
                logical: 6,
                precise: true,
            },
        ],
    }]
}

fn default_agg_window_ns() -> u64 {
    5_000_000
}

fn default_agg_max_entries() -> usize {
    200_000
}

fn default_agg_flush_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_sentinel_to_diag() -> f64 {
    1.10
}

fn default_diag_to_sentinel() -> f64 {
    1.02
}

fn default_throughput_ratio() -> f64 {
    0.85
}

fn default_mode_latency_ratio() -> f64 {
    1.25
}

fn default_anomaly_latency_ratio() -> f64 {
    1.3
}

fn default_anomaly_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_throughput_alpha() -> f64 {
    0.1
}

fn default_latency_alpha() -> f64 {
    0.2
}

fn default_refractory() -> Duration {
    Duration::from_secs(5)
}

fn default_tsc_alpha() -> f64 {
    0.05
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9105
}

fn default_control_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    9200
}

fn default_sink_endpoint() -> String {
    "http://localhost:8123".to_string()
}

fn default_sink_table() -> String {
    "ms_flow_rollup".to_string()
}

fn default_stack_table() -> String {
    "ms_stack_traces".to_string()
}

fn default_raw_table() -> String {
    "ms_raw_samples".to_string()
}

fn default_data_table() -> String {
    "ms_data_objects".to_string()
}

fn default_sink_flush_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_sink_batch_size() -> usize {
    4096
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sampling: SamplingConfig::default(),
            aggregator: AggregatorConfig::default(),
            thresholds: ModeThresholds::default(),
            anomaly: AnomalyConfig::default(),
            calibration: CalibrationConfig::default(),
            metrics: MetricsConfig::default(),
            control: ControlConfig::default(),
            sink: SinkConfig::default(),
            diagnostic_mode: false,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sentinel_budget: default_sentinel_budget(),
            diagnostic_budget: default_diagnostic_budget(),
            hard_drop_ns: default_hard_drop_ns(),
            cpus: Vec::new(),
            mock_mode: false,
            mock_period: default_mock_period(),
            bpf_object_path: default_bpf_object_path(),
            numa_workers: true,
            ring_pages: default_ring_pages(),
            rotation_window: default_rotation_window(),
            safety_high_watermark: default_safety_high_watermark(),
            safety_low_watermark: default_safety_low_watermark(),
            shed_event_limit: default_shed_event_limit(),
            skew_tolerance_ns: default_skew_tolerance_ns(),
            skew_window: default_skew_window(),
            sentinel_groups: default_sentinel_groups(),
            diagnostic_groups: default_diagnostic_groups(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_ns: default_agg_window_ns(),
            max_entries: default_agg_max_entries(),
            flush_interval: default_agg_flush_interval(),
        }
    }
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            sentinel_to_diag: default_sentinel_to_diag(),
            diag_to_sentinel: default_diag_to_sentinel(),
            throughput_ratio_trigger: default_throughput_ratio(),
            latency_ratio_trigger: default_mode_latency_ratio(),
            quiet_period: default_refractory(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interfaces: Vec::new(),
            sample_interval: default_anomaly_interval(),
            throughput_alpha: default_throughput_alpha(),
            latency_alpha: default_latency_alpha(),
            throughput_ratio: default_throughput_ratio(),
            latency_ratio: default_anomaly_latency_ratio(),
            refractory: default_refractory(),
            latency_probe_path: String::new(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slope_alpha: default_tsc_alpha(),
            offset_alpha: default_tsc_alpha(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
            port: default_metrics_port(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: default_control_address(),
            port: default_control_port(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_sink_endpoint(),
            table: default_sink_table(),
            stack_table: default_stack_table(),
            raw_table: default_raw_table(),
            data_table: default_data_table(),
            flush_interval: default_sink_flush_interval(),
            batch_size: default_sink_batch_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().expect("defaults validate");
    }

    #[test]
    fn test_default_groups() {
        let cfg = SamplingConfig::default();
        assert_eq!(cfg.sentinel_groups.len(), 1);
        assert_eq!(cfg.sentinel_groups[0].events.len(), 1);
        assert_eq!(cfg.diagnostic_groups[0].events.len(), 3);
        assert_eq!(cfg.diagnostic_groups[0].events[2].perf_type, PERF_TYPE_RAW);
    }

    #[test]
    fn test_yaml_parsing_with_humantime() {
        let cfg: Config = serde_yaml::from_str(
            r#"
log_level: debug
sampling:
  sentinel_budget: 1234
  mock_period: 25ms
aggregator:
  flush_interval: 1s
anomaly:
  interfaces: [eth0]
  refractory: 2s
sink:
  endpoint: http://db.internal:8123
"#,
        )
        .expect("parse");
        assert_eq!(cfg.sampling.sentinel_budget, 1234);
        assert_eq!(cfg.sampling.mock_period, Duration::from_millis(25));
        assert_eq!(cfg.aggregator.flush_interval, Duration::from_secs(1));
        assert_eq!(cfg.anomaly.interfaces, vec!["eth0".to_string()]);
        assert_eq!(cfg.sink.endpoint, "http://db.internal:8123");
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut cfg = Config::default();
        cfg.sink.endpoint = "tcp://db:9000".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.sentinel_to_diag = 1.0;
        cfg.thresholds.diag_to_sentinel = 1.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_group_rejected() {
        let mut cfg = Config::default();
        cfg.sampling.sentinel_groups = vec![PmuGroupConfig {
            name: "empty".to_string(),
            events: Vec::new(),
        }];
        assert!(cfg.validate().is_err());
    }
}
