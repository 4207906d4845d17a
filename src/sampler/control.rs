//! Kernel sampler control surface.
//!
//! Loads the pre-built BPF object and owns every interaction with its maps
//! and programs: token-bucket budgets, the active-event fallback value, the
//! interface allowlist, and PMU group attachment. One event group is
//! attached at a time; mode switches and rotation both go through
//! [`SamplerController::rotate_to_group`]-style re-attachment.
//!
//! All code is gated behind the `bpf` feature.

use std::ffi::CString;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{Array, MapData};
use aya::programs::perf_event::{PerfEventScope, PerfTypeId, SamplePolicy};
use aya::programs::{PerfEvent, TracePoint};
use aya::Ebpf;

use crate::config::{PmuGroupConfig, SamplingConfig};
use crate::mode::AgentMode;
use crate::rotate::EventGroupController;

/// Token-bucket parameters (matches `struct ms_tb_cfg` in the BPF object).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct TokenBucketCfg {
    max_samples_per_sec: u64,
    hard_drop_threshold: u64,
}

// SAFETY: TokenBucketCfg is a plain C struct of two u64 with no padding.
unsafe impl aya::Pod for TokenBucketCfg {}

struct ControllerInner {
    ebpf: Ebpf,
    active_groups: Vec<PmuGroupConfig>,
    active_index: usize,
    perf_links: Vec<aya::programs::perf_event::PerfEventLinkId>,
    perf_loaded: bool,
    cfg_seq: u64,
    max_events_per_group: usize,
}

/// Owner of the loaded BPF object and its control maps.
pub struct SamplerController {
    cpus: Vec<u32>,
    inner: Mutex<ControllerInner>,
}

impl SamplerController {
    /// Load the BPF object and attach the flow-context hook. Failure here
    /// means the kernel path is unavailable and the caller should fall back
    /// to the synthetic source.
    pub fn init(cfg: &SamplingConfig) -> Result<Self> {
        let mut ebpf = Ebpf::load_file(&cfg.bpf_object_path)
            .with_context(|| format!("loading BPF object {}", cfg.bpf_object_path))?;

        attach_flow_context(&mut ebpf)?;
        // TX-side context capture stays detached until the kernel interface
        // confirms it; ingress covers flow attribution today.

        let cpus = if cfg.cpus.is_empty() {
            super::online_cpus()
        } else {
            cfg.cpus.clone()
        };

        info!(
            object = %cfg.bpf_object_path,
            cpus = cpus.len(),
            "kernel sampler loaded"
        );

        Ok(Self {
            cpus,
            inner: Mutex::new(ControllerInner {
                ebpf,
                active_groups: Vec::new(),
                active_index: 0,
                perf_links: Vec::new(),
                perf_loaded: false,
                cfg_seq: 0,
                max_events_per_group: usize::MAX,
            }),
        })
    }

    /// CPUs the controller samples on.
    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    /// Take the per-CPU sample ring map out of the object for the source.
    pub fn take_sample_array(&self) -> Result<AsyncPerfEventArray<MapData>> {
        let mut inner = self.inner.lock();
        let map = inner
            .ebpf
            .take_map("samples")
            .ok_or_else(|| anyhow!("samples map not found in BPF object"))?;
        AsyncPerfEventArray::try_from(map).context("opening samples perf array")
    }

    /// Replace the active group set for a mode switch (or a control-plane
    /// group swap) and attach its first group. The caller owns the group
    /// sets for both arms and passes the active arm's set.
    pub fn switch_mode(&self, _mode: AgentMode, groups: &[PmuGroupConfig]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.active_groups = groups.to_vec();
        inner.active_index = 0;
        self.attach_group_locked(&mut inner, 0)
    }

    /// Program the token bucket with the active budget and bump the
    /// generation counter so the kernel reloads it.
    pub fn update_token_bucket(&self, samples_per_sec: u64, hard_drop_ns: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        {
            let map = inner
                .ebpf
                .map_mut("tb_cfg")
                .ok_or_else(|| anyhow!("tb_cfg map not found"))?;
            let mut cfg: Array<_, TokenBucketCfg> = Array::try_from(map)?;
            cfg.set(
                0,
                TokenBucketCfg {
                    max_samples_per_sec: samples_per_sec,
                    hard_drop_threshold: hard_drop_ns,
                },
                0,
            )
            .context("writing token bucket config")?;
        }

        inner.cfg_seq += 1;
        let seq = inner.cfg_seq;
        {
            let map = inner
                .ebpf
                .map_mut("tb_ctrl")
                .ok_or_else(|| anyhow!("tb_ctrl map not found"))?;
            let mut ctrl: Array<_, u64> = Array::try_from(map)?;
            ctrl.set(0, seq, 0).context("bumping token bucket seq")?;
        }

        debug!(samples_per_sec, hard_drop_ns, seq, "token bucket reprogrammed");
        Ok(())
    }

    /// Restrict flow-context capture to the named interfaces. An empty list
    /// disables filtering (all interfaces allowed).
    pub fn set_interface_filter(&self, interfaces: &[String]) -> Result<()> {
        let mut indices = Vec::with_capacity(interfaces.len());
        for name in interfaces {
            match interface_index(name) {
                Some(ifindex) => indices.push(ifindex),
                None => warn!(interface = %name, "unknown interface, skipping in allowlist"),
            }
        }

        let mut inner = self.inner.lock();
        {
            let map = inner
                .ebpf
                .map_mut("if_filter_ctrl")
                .ok_or_else(|| anyhow!("if_filter_ctrl map not found"))?;
            let mut ctrl: Array<_, u32> = Array::try_from(map)?;
            ctrl.set(0, u32::from(!indices.is_empty()), 0)
                .context("writing interface filter mode")?;
        }
        {
            let map = inner
                .ebpf
                .map_mut("if_filter")
                .ok_or_else(|| anyhow!("if_filter map not found"))?;
            let mut filter: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(map)?;
            let existing: Vec<u32> = filter.keys().filter_map(|k| k.ok()).collect();
            for key in existing {
                let _ = filter.remove(&key);
            }
            for ifindex in &indices {
                filter
                    .insert(*ifindex, 1, 0)
                    .with_context(|| format!("allowlisting ifindex {ifindex}"))?;
            }
        }

        info!(allowed = indices.len(), "interface allowlist programmed");
        Ok(())
    }

    /// Cap the events attached per group (overload shedding). Takes effect
    /// at the next attach.
    pub fn set_max_events_per_group(&self, limit: usize) {
        let mut inner = self.inner.lock();
        inner.max_events_per_group = if limit == 0 { usize::MAX } else { limit };
    }

    fn attach_group_locked(&self, inner: &mut ControllerInner, index: usize) -> Result<()> {
        let group = inner
            .active_groups
            .get(index)
            .ok_or_else(|| anyhow!("group index {index} out of range"))?
            .clone();

        // Detach whatever is currently attached before touching the PMU.
        self.detach_perf_locked(inner);

        let limit = inner.max_events_per_group;
        let events: Vec<_> = group.events.iter().take(limit.max(1)).cloned().collect();

        // The kernel stamps samples with the active-event fallback value, so
        // write the first event's logical identity before attaching.
        if let Some(first) = events.first() {
            let map = inner
                .ebpf
                .map_mut("active_event")
                .ok_or_else(|| anyhow!("active_event map not found"))?;
            let mut active: Array<_, u32> = Array::try_from(map)?;
            active
                .set(0, first.logical, 0)
                .context("writing active event")?;
        }

        let prog: &mut PerfEvent = inner
            .ebpf
            .program_mut("on_pmu_sample")
            .ok_or_else(|| anyhow!("on_pmu_sample program not found"))?
            .try_into()
            .context("'on_pmu_sample' is not a perf_event program")?;
        if !inner.perf_loaded {
            prog.load().context("loading on_pmu_sample")?;
            inner.perf_loaded = true;
        }

        let mut links = Vec::with_capacity(events.len() * self.cpus.len());
        for desc in &events {
            for &cpu in &self.cpus {
                let link = prog
                    .attach(
                        perf_type_of(desc.perf_type),
                        desc.config,
                        PerfEventScope::AllProcessesOneCpu { cpu },
                        SamplePolicy::Period(desc.sample_period),
                        false,
                    )
                    .with_context(|| {
                        format!("attaching {} (cpu {cpu})", display_name(desc))
                    })?;
                links.push(link);
            }
        }

        inner.perf_links = links;
        inner.active_index = index;
        info!(
            group = %group.name,
            events = events.len(),
            cpus = self.cpus.len(),
            "PMU group attached"
        );
        Ok(())
    }

    fn detach_perf_locked(&self, inner: &mut ControllerInner) {
        if inner.perf_links.is_empty() {
            return;
        }
        let links = std::mem::take(&mut inner.perf_links);
        let Some(program) = inner.ebpf.program_mut("on_pmu_sample") else {
            return;
        };
        let Ok(prog) = <&mut PerfEvent>::try_from(program) else {
            return;
        };
        for link in links {
            if let Err(e) = prog.detach(link) {
                warn!(error = %e, "perf event detach failed");
            }
        }
    }
}

impl EventGroupController for SamplerController {
    fn active_group_count(&self) -> usize {
        self.inner.lock().active_groups.len()
    }

    fn current_group_index(&self) -> usize {
        self.inner.lock().active_index
    }

    fn rotate_to_group(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        self.attach_group_locked(&mut inner, index)
    }
}

fn perf_type_of(raw: u32) -> PerfTypeId {
    match raw {
        0 => PerfTypeId::Hardware,
        1 => PerfTypeId::Software,
        2 => PerfTypeId::TracePoint,
        3 => PerfTypeId::HwCache,
        5 => PerfTypeId::Breakpoint,
        _ => PerfTypeId::Raw,
    }
}

fn display_name(desc: &crate::config::PmuEventDesc) -> String {
    if desc.name.is_empty() {
        format!("event({}/{:#x})", desc.perf_type, desc.config)
    } else {
        desc.name.clone()
    }
}

fn attach_flow_context(ebpf: &mut Ebpf) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut("on_skb_flow_ctx")
        .ok_or_else(|| anyhow!("on_skb_flow_ctx program not found"))?
        .try_into()
        .context("'on_skb_flow_ctx' is not a tracepoint program")?;
    prog.load().context("loading flow context hook")?;
    prog.attach("net", "netif_receive_skb")
        .context("attaching flow context hook")?;
    debug!("flow context hook attached");
    Ok(())
}

fn interface_index(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of
    // the call.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    (index != 0).then_some(index)
}
