//! Agent runtime orchestration.
//!
//! Owns every pipeline component, wires the callbacks between them, runs
//! the periodic flush cycle, and applies mode and safety policy. Components
//! never talk to each other directly; everything meets here.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
#[cfg(all(feature = "bpf", target_os = "linux"))]
use tracing::error;
use tracing::{info, warn};

use crate::anomaly::{AnomalyKind, AnomalyMonitor, AnomalySignal};
use crate::api::{ControlHandlers, ControlPlane, DataObjectRequest, JitRegionRequest, PmuConfigUpdate};
use crate::clock::monotonic_ns;
use crate::config::{Config, PmuGroupConfig};
use crate::export::MetricsExporter;
use crate::mode::bucket::{apply_bucket_update, BucketState, BucketUpdateRequest};
use crate::mode::{AgentMode, ModeController, SafetyLevel};
use crate::pipeline::aggregate::{AggregatedValue, Aggregator, AttributionKey};
use crate::pipeline::calibrate::TimeCalibrator;
use crate::pipeline::false_sharing::FalseSharingDetector;
use crate::pipeline::remote_dram::RemoteDramAnalyzer;
use crate::pipeline::skew::SkewAdjuster;
use crate::pipeline::targets::{TargetFilter, TargetSpec};
use crate::rotate::PmuRotator;
use crate::sampler::event::{BranchStack, Direction, InterferenceClass, PmuEventKind, Sample};
use crate::sampler::synthetic::SyntheticSource;
use crate::sampler::{SampleHandler, SampleSource};
use crate::sink::SinkWriter;
use crate::symbolize::Symbolizer;

#[cfg(all(feature = "bpf", target_os = "linux"))]
use crate::sampler::control::SamplerController;
#[cfg(all(feature = "bpf", target_os = "linux"))]
use crate::sampler::kernel::KernelSource;

/// Group sets for both arms, replaceable at runtime by the control plane.
struct GroupSets {
    sentinel: Vec<PmuGroupConfig>,
    diagnostic: Vec<PmuGroupConfig>,
}

impl GroupSets {
    fn for_mode(&self, mode: AgentMode) -> &[PmuGroupConfig] {
        match mode {
            AgentMode::Sentinel => &self.sentinel,
            AgentMode::Diagnostic => &self.diagnostic,
        }
    }
}

/// Shared core: every component plus the cross-cutting state the flush
/// cycle and control callbacks operate on.
pub struct AgentCore {
    cfg: Config,
    symbolizer: Arc<Symbolizer>,
    aggregator: Arc<Aggregator>,
    calibrator: TimeCalibrator,
    skew: SkewAdjuster,
    targets: TargetFilter,
    remote_dram: RemoteDramAnalyzer,
    false_sharing: FalseSharingDetector,
    mode_controller: ModeController,
    metrics: Arc<MetricsExporter>,
    sink: Arc<SinkWriter>,
    samples_total: AtomicU64,
    current_mode: AtomicU8,
    safety_level: AtomicU8,
    bucket_state: Mutex<BucketState>,
    group_sets: Mutex<GroupSets>,
    rotator: Mutex<Option<Arc<PmuRotator>>>,
    #[cfg(all(feature = "bpf", target_os = "linux"))]
    controller: Option<Arc<SamplerController>>,
}

/// The running agent: core plus lifecycle state.
pub struct AgentRuntime {
    core: Arc<AgentCore>,
    source: Option<SampleSource>,
    source_cancel: CancellationToken,
    source_tasks: Vec<tokio::task::JoinHandle<()>>,
    flush_cancel: CancellationToken,
    flush_task: Option<tokio::task::JoinHandle<()>>,
    rotator_cancel: CancellationToken,
    anomaly_cancel: CancellationToken,
    sink_cancel: CancellationToken,
    server_cancel: CancellationToken,
}

impl AgentRuntime {
    /// Build every component. Kernel attach happens here; on failure the
    /// agent is wired to the synthetic source instead.
    pub fn new(mut cfg: Config) -> Result<Self> {
        // Anomaly trigger settings double as mode-promotion thresholds.
        if cfg.anomaly.throughput_ratio > 0.0 {
            cfg.thresholds.throughput_ratio_trigger = cfg.anomaly.throughput_ratio;
        }
        if cfg.anomaly.latency_ratio > 0.0 {
            cfg.thresholds.latency_ratio_trigger = cfg.anomaly.latency_ratio;
        }
        if !cfg.anomaly.refractory.is_zero() {
            cfg.thresholds.quiet_period = cfg.anomaly.refractory;
        }
        // Pinned Diagnostic must never demote; promotion at any load does
        // that through the ordinary state machine.
        if cfg.diagnostic_mode {
            cfg.thresholds.sentinel_to_diag = 0.0;
            cfg.thresholds.diag_to_sentinel = 0.0;
        }

        let symbolizer = Arc::new(Symbolizer::new());
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&symbolizer),
            cfg.aggregator.window_ns,
            cfg.aggregator.max_entries,
        ));
        let metrics = Arc::new(MetricsExporter::new(cfg.metrics.clone()));
        let sink = Arc::new(SinkWriter::new(cfg.sink.clone()));
        sink.set_bucket_width(cfg.aggregator.window_ns);

        let mut bucket_state = BucketState {
            sentinel_budget: cfg.sampling.sentinel_budget,
            diagnostic_budget: cfg.sampling.diagnostic_budget,
            hard_drop_ns: cfg.sampling.hard_drop_ns,
        };
        if bucket_state.diagnostic_budget < bucket_state.sentinel_budget {
            bucket_state.diagnostic_budget = bucket_state.sentinel_budget;
        }

        let initial_mode = if cfg.diagnostic_mode {
            AgentMode::Diagnostic
        } else {
            AgentMode::Sentinel
        };
        let mode_controller = ModeController::new(cfg.thresholds.clone());
        mode_controller.force(initial_mode);

        let group_sets = GroupSets {
            sentinel: cfg.sampling.sentinel_groups.clone(),
            diagnostic: cfg.sampling.diagnostic_groups.clone(),
        };

        #[cfg(all(feature = "bpf", target_os = "linux"))]
        let controller = if cfg.sampling.mock_mode {
            None
        } else {
            match SamplerController::init(&cfg.sampling) {
                Ok(controller) => Some(Arc::new(controller)),
                Err(e) => {
                    warn!(error = %e, "kernel sampler unavailable, falling back to synthetic samples");
                    None
                }
            }
        };

        let core = Arc::new(AgentCore {
            calibrator: TimeCalibrator::new(cfg.calibration.clone()),
            skew: SkewAdjuster::new(cfg.sampling.skew_tolerance_ns, cfg.sampling.skew_window),
            targets: TargetFilter::new(),
            remote_dram: RemoteDramAnalyzer::new(crate::pipeline::remote_dram::DEFAULT_WINDOW_NS),
            false_sharing: FalseSharingDetector::new(
                Arc::clone(&symbolizer),
                crate::pipeline::false_sharing::DEFAULT_WINDOW_NS,
                crate::pipeline::false_sharing::DEFAULT_THRESHOLD,
            ),
            mode_controller,
            symbolizer,
            aggregator,
            metrics,
            sink,
            samples_total: AtomicU64::new(0),
            current_mode: AtomicU8::new(initial_mode as u8),
            safety_level: AtomicU8::new(SafetyLevel::Normal as u8),
            bucket_state: Mutex::new(bucket_state),
            group_sets: Mutex::new(group_sets),
            rotator: Mutex::new(None),
            #[cfg(all(feature = "bpf", target_os = "linux"))]
            controller,
            cfg,
        });

        Ok(Self {
            core,
            source: None,
            source_cancel: CancellationToken::new(),
            source_tasks: Vec::new(),
            flush_cancel: CancellationToken::new(),
            flush_task: None,
            rotator_cancel: CancellationToken::new(),
            anomaly_cancel: CancellationToken::new(),
            sink_cancel: CancellationToken::new(),
            server_cancel: CancellationToken::new(),
        })
    }

    /// Start every component in dependency order and begin sampling.
    pub async fn start(&mut self) -> Result<()> {
        let core = &self.core;
        let mode = core.mode();

        info!(
            mode = %mode,
            anomaly = core.cfg.anomaly.enabled,
            source = self.describe_source(),
            "starting agent runtime"
        );

        core.metrics
            .start(self.server_cancel.clone())
            .await
            .context("starting metrics exporter")?;

        core.sink.start(self.sink_cancel.clone());

        let control = ControlPlane::new(core.cfg.control.clone(), control_handlers(core));
        control
            .start(self.server_cancel.clone())
            .await
            .context("starting control plane")?;

        {
            let core = Arc::clone(core);
            AnomalyMonitor::new(core.cfg.anomaly.clone()).start(
                Box::new(move |signal| core.handle_anomaly(&signal)),
                self.anomaly_cancel.clone(),
            );
        }

        // Kernel side first: interface allowlist, budgets, initial groups,
        // then the rotor that time-slices multi-group modes.
        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if let Some(controller) = &core.controller {
            let allowlist = if core.cfg.anomaly.enabled {
                core.cfg.anomaly.interfaces.clone()
            } else {
                Vec::new()
            };
            if let Err(e) = controller.set_interface_filter(&allowlist) {
                warn!(error = %e, "interface allowlist programming failed");
            }

            core.apply_mode(mode);

            let rotator = Arc::new(PmuRotator::new(
                Arc::clone(controller) as Arc<dyn crate::rotate::EventGroupController>,
                core.cfg.sampling.rotation_window,
                {
                    let aggregator = Arc::clone(&core.aggregator);
                    let metrics = Arc::clone(&core.metrics);
                    Box::new(move |scale| {
                        aggregator.set_sample_scale(scale);
                        metrics.set_gauge("ms_pmu_scale", scale);
                    })
                },
            ));
            rotator.start(mode, self.rotator_cancel.clone());
            *core.rotator.lock() = Some(rotator);
        }

        let handler: SampleHandler = {
            let core = Arc::clone(core);
            Arc::new(move |sample, stack| core.handle_sample(sample, stack))
        };

        let mut source = self.build_source();
        self.source_tasks = match source.start(Arc::clone(&handler), self.source_cancel.clone()) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "sample source failed to start, falling back to synthetic generator");
                let mut synthetic =
                    SampleSource::Synthetic(SyntheticSource::new(self.core.cfg.sampling.mock_period));
                let tasks = synthetic
                    .start(handler, self.source_cancel.clone())
                    .context("starting synthetic sample source")?;
                source = synthetic;
                tasks
            }
        };
        info!(source = source.name(), "sample source started");
        self.source = Some(source);

        let flush_core = Arc::clone(core);
        let flush_cancel = self.flush_cancel.clone();
        let interval = core.cfg.aggregator.flush_interval;
        self.flush_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = flush_cancel.cancelled() => return,
                    _ = ticker.tick() => flush_core.run_flush_cycle(interval),
                }
            }
        }));

        info!("agent fully started");
        Ok(())
    }

    /// Stop in reverse dataflow order so nothing writes into a component
    /// that has already shut down.
    pub async fn stop(&mut self) {
        // 1. Sample source, then drain the skew windows it fed.
        self.source_cancel.cancel();
        for task in self.source_tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(source) = self.source.take() {
            info!(source = source.name(), "sample source stopped");
        }
        let core = Arc::clone(&self.core);
        core.skew.flush_all(&mut |sample, stack| core.emit_ready(sample, stack));

        // 2. Flush task, then one final synchronous cycle.
        self.flush_cancel.cancel();
        if let Some(task) = self.flush_task.take() {
            let _ = task.await;
        }
        core.run_flush_cycle(core.cfg.aggregator.flush_interval);

        // 3. Rotator and anomaly poller.
        self.rotator_cancel.cancel();
        self.anomaly_cancel.cancel();

        // 4. Sink (waits for its final flush), then the HTTP surfaces.
        self.sink_cancel.cancel();
        core.sink.wait_for_shutdown().await;
        self.server_cancel.cancel();

        info!(
            samples = core.samples_total.load(Ordering::Relaxed),
            "agent stopped"
        );
    }

    fn describe_source(&self) -> &'static str {
        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if self.core.controller.is_some() {
            return "kernel";
        }
        "synthetic"
    }

    fn build_source(&self) -> SampleSource {
        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if let Some(controller) = &self.core.controller {
            return SampleSource::Kernel(KernelSource::new(
                Arc::clone(controller),
                self.core.cfg.sampling.clone(),
            ));
        }
        SampleSource::Synthetic(SyntheticSource::new(self.core.cfg.sampling.mock_period))
    }

    /// Shared core, for tests and embedding.
    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }
}

impl AgentCore {
    pub fn mode(&self) -> AgentMode {
        AgentMode::from_u8(self.current_mode.load(Ordering::Relaxed))
    }

    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &Arc<MetricsExporter> {
        &self.metrics
    }

    /// Per-sample entry point: calibrate, then hold in the skew window; every
    /// sample the window releases continues through [`emit_ready`].
    pub fn handle_sample(&self, mut sample: Sample, stack: BranchStack) {
        sample.tsc = self.calibrator.normalize(sample.cpu, sample.tsc);
        self.skew
            .process(sample, stack, &mut |sample, stack| self.emit_ready(sample, stack));
    }

    /// Post-window pipeline: filter, then fan out to the analyzers and sink.
    fn emit_ready(&self, sample: Sample, stack: BranchStack) {
        if !self.targets.allow(&sample) {
            return;
        }

        self.remote_dram.observe(&sample);

        let norm_cost = self.aggregator.sample_scale() / f64::from(sample.gso_segs.max(1));
        self.sink.enqueue_raw_sample(&sample, &stack, norm_cost);

        self.aggregator.add(&sample, &stack);
        self.false_sharing.observe(&sample);
        self.samples_total.fetch_add(1, Ordering::Relaxed);
    }

    /// One flush cycle: drain the aggregator and the symbolizer toward the
    /// sink, refresh gauges, and run mode/safety policy off the observed
    /// sample rate.
    pub fn run_flush_cycle(&self, interval: Duration) {
        let now_ns = monotonic_ns();

        let flushed = self.aggregator.flush(|key, value| {
            self.sink.enqueue_rollup(key, value);
            self.metrics
                .set_gauge(&rollup_gauge_name(key), value.norm_cost);
        });

        for trace in self.symbolizer.drain_new_stacks() {
            self.sink.enqueue_stack(&trace);
        }
        for symbol in self.symbolizer.drain_new_data_objects() {
            self.sink.enqueue_data_object(&symbol);
        }

        self.metrics
            .set_gauge("ms_agg_table_sheds", self.aggregator.shed_count() as f64);

        if flushed > 0 {
            let samples_per_sec = flushed as f64 / interval.as_secs_f64();
            self.metrics.set_gauge("ms_samples_per_sec", samples_per_sec);

            let budget = self.bucket_state.lock().active_budget(self.mode());
            let ratio = if budget > 0 {
                samples_per_sec / budget as f64
            } else {
                1.0
            };

            self.maybe_adjust_safety(ratio);
            let updated = self.mode_controller.update(ratio);
            if updated != self.mode() {
                self.apply_mode(updated);
            }
        }

        self.false_sharing.flush(now_ns, |finding| {
            let name = format!(
                "ms_false_sharing_score{{line=\"{:#x}\",mapping=\"{}\",pid=\"{}\",offset=\"{:#x}\"}}",
                finding.line_addr,
                escape_label(&finding.object.mapping),
                finding.dominant_pid,
                finding.object.offset,
            );
            self.metrics.set_gauge(&name, finding.total_hits as f64);
        });

        self.remote_dram.flush(now_ns, |finding| {
            let name = format!(
                "ms_remote_dram_hotspot{{flow=\"{}\",numa=\"{}\",ifindex=\"{}\"}}",
                finding.flow_id, finding.numa_node, finding.ifindex,
            );
            self.metrics.set_gauge(&name, finding.samples as f64);
        });

        self.calibrator.snapshot(|cpu, slope, offset| {
            self.metrics
                .set_gauge(&format!("ms_tsc_slope{{cpu=\"{cpu}\"}}"), slope);
            self.metrics
                .set_gauge(&format!("ms_tsc_offset_ns{{cpu=\"{cpu}\"}}"), offset);
        });
    }

    /// Switch the sampling regime. The controller is reprogrammed with the
    /// new arm's groups and budget; the rotator and mode gauge only follow
    /// on success so a failed switch stays visible.
    pub fn apply_mode(&self, mode: AgentMode) {
        let previous = self.mode();
        self.current_mode.store(mode as u8, Ordering::Relaxed);
        if previous != mode {
            info!(from = %previous, to = %mode, "agent mode transition");
        } else {
            info!(mode = %mode, "reapplying agent mode");
        }
        self.mode_controller.force(mode);

        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if let Some(controller) = &self.controller {
            let groups = {
                let sets = self.group_sets.lock();
                sets.for_mode(mode).to_vec()
            };
            let (budget, hard_drop) = {
                let state = self.bucket_state.lock();
                (state.active_budget(mode), state.hard_drop_ns)
            };
            if let Err(e) = controller.switch_mode(mode, &groups) {
                error!(mode = %mode, error = %e, "mode reprogramming failed, sampler keeps previous state");
                return;
            }
            if let Err(e) = controller.update_token_bucket(budget, hard_drop) {
                warn!(error = %e, "token bucket update failed");
            }
            if let Some(rotator) = self.rotator.lock().as_ref() {
                rotator.update_mode(mode);
            }
        }

        self.metrics.set_gauge(
            "ms_agent_mode",
            if mode == AgentMode::Diagnostic { 1.0 } else { 0.0 },
        );
    }

    /// Merge a budget update and reprogram the kernel when the active arm
    /// or the hard-drop window changed.
    pub fn handle_bucket_update(&self, req: BucketUpdateRequest) {
        let (outcome, hard_drop) = {
            let mut state = self.bucket_state.lock();
            let outcome = apply_bucket_update(&req, self.mode(), &mut state);
            (outcome, state.hard_drop_ns)
        };

        info!(
            active_budget = outcome.active_budget,
            reprogram = outcome.reprogram_required,
            "token bucket updated"
        );

        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if outcome.reprogram_required {
            if let Some(controller) = &self.controller {
                if let Err(e) = controller.update_token_bucket(outcome.active_budget, hard_drop) {
                    warn!(error = %e, "token bucket reprogramming failed");
                }
            }
        }
        #[cfg(not(all(feature = "bpf", target_os = "linux")))]
        let _ = hard_drop;
    }

    /// Swap one or both arms' PMU group sets and re-attach the active arm.
    pub fn handle_pmu_config(&self, update: PmuConfigUpdate) {
        let mut changed = false;
        {
            let mut sets = self.group_sets.lock();
            if let Some(groups) = update.sentinel {
                if !groups.is_empty() {
                    sets.sentinel = groups;
                    changed = true;
                }
            }
            if let Some(groups) = update.diagnostic {
                if !groups.is_empty() {
                    sets.diagnostic = groups;
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }

        info!("PMU group configuration updated");

        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if let Some(controller) = &self.controller {
            let mode = self.mode();
            let groups = {
                let sets = self.group_sets.lock();
                sets.for_mode(mode).to_vec()
            };
            match controller.switch_mode(mode, &groups) {
                Ok(()) => {
                    if let Some(rotator) = self.rotator.lock().as_ref() {
                        rotator.update_mode(mode);
                    }
                }
                Err(e) => warn!(error = %e, "re-attaching updated groups failed"),
            }
        }
    }

    pub fn handle_jit_region(&self, req: JitRegionRequest) {
        self.symbolizer
            .register_jit(req.pid, req.start, req.end, &req.path, &req.build_id);
    }

    pub fn handle_data_object(&self, req: DataObjectRequest) {
        self.symbolizer
            .register_data(req.pid, req.address, &req.name, &req.type_name, req.size);
    }

    pub fn handle_target_update(&self, specs: Vec<TargetSpec>) {
        self.targets.update(&specs);
    }

    /// Promote/demote the shedding level against the safety watermarks.
    fn maybe_adjust_safety(&self, ratio: f64) {
        let high = self.cfg.sampling.safety_high_watermark;
        let low = self.cfg.sampling.safety_low_watermark;
        let current = SafetyLevel::from_u8(self.safety_level.load(Ordering::Relaxed));

        let desired = if high > 0.0 && ratio > high {
            SafetyLevel::ShedHeavy
        } else if low > 0.0 && ratio < low {
            SafetyLevel::Normal
        } else {
            current
        };

        if desired == current {
            return;
        }
        self.safety_level.store(desired as u8, Ordering::Relaxed);

        let shedding = desired == SafetyLevel::ShedHeavy;
        warn!(ratio, shedding, "safety level changed");

        #[cfg(all(feature = "bpf", target_os = "linux"))]
        if let Some(controller) = &self.controller {
            let limit = if shedding {
                self.cfg.sampling.shed_event_limit.max(1)
            } else {
                0
            };
            controller.set_max_events_per_group(limit);
            if let Some(rotator) = self.rotator.lock().as_ref() {
                rotator.update_mode(self.mode());
            }
        }

        self.metrics
            .set_gauge("ms_sampling_throttled", if shedding { 1.0 } else { 0.0 });
    }

    /// Anomaly input from the monitor: gauge it, feed the state machine,
    /// and apply any resulting promotion.
    pub fn handle_anomaly(&self, signal: &AnomalySignal) {
        match signal.kind {
            AnomalyKind::ThroughputDrop => {
                self.metrics.set_gauge("ms_throughput_ratio", signal.ratio);
                self.metrics.set_gauge("ms_throughput_bps", signal.value);
            }
            AnomalyKind::LatencySpike => {
                self.metrics.set_gauge("ms_latency_ratio", signal.ratio);
                self.metrics.set_gauge("ms_latency_us", signal.value);
            }
        }

        let updated = self.mode_controller.notify_anomaly(signal);
        if updated != self.mode() {
            self.apply_mode(updated);
        }
    }
}

fn control_handlers(core: &Arc<AgentCore>) -> ControlHandlers {
    let mode_core = Arc::clone(core);
    let bucket_core = Arc::clone(core);
    let pmu_core = Arc::clone(core);
    let jit_core = Arc::clone(core);
    let data_core = Arc::clone(core);
    let target_core = Arc::clone(core);

    ControlHandlers {
        on_mode: Box::new(move |mode| mode_core.apply_mode(mode)),
        on_bucket: Box::new(move |req| bucket_core.handle_bucket_update(req)),
        on_pmu_config: Box::new(move |update| pmu_core.handle_pmu_config(update)),
        on_jit: Box::new(move |req| jit_core.handle_jit_region(req)),
        on_data_object: Box::new(move |req| data_core.handle_data_object(req)),
        on_targets: Box::new(move |specs| target_core.handle_target_update(specs)),
    }
}

/// Gauge family for a rollup entry, by event kind.
fn flow_metric_name(pmu_event: u32) -> &'static str {
    match PmuEventKind::from_u32(pmu_event) {
        Some(PmuEventKind::L3Miss) => "ms_flow_micromiss_rate",
        Some(PmuEventKind::RemoteDram) => "ms_remote_dram_rate",
        Some(PmuEventKind::BranchMispred) => "ms_branch_mispred_rate",
        Some(PmuEventKind::ICacheStall) => "ms_icache_stall_rate",
        Some(PmuEventKind::AvxDownclock) => "ms_avx_downclock_rate",
        Some(PmuEventKind::BackendStall) => "ms_backend_stall_rate",
        Some(PmuEventKind::CrossSnoopHitm) => "ms_false_sharing_rate",
        None => "ms_flow_event_norm",
    }
}

fn rollup_gauge_name(key: &AttributionKey) -> String {
    format!(
        "{}{{flow=\"{}\",function=\"{:#x}\",stack=\"{:#x}\",event=\"{}\",numa=\"{}\",direction=\"{}\",class=\"{}\",data_object=\"{:#x}\"}}",
        flow_metric_name(key.pmu_event),
        key.flow_id,
        key.function_id,
        key.stack_id,
        key.pmu_event,
        key.numa_node,
        Direction::label(key.direction),
        InterferenceClass::from_u8(key.interference_class),
        key.data_object_id,
    )
}

/// Strip characters that would corrupt a gauge label value.
fn escape_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '"' | '\\' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
