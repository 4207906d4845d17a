//! Monitoring target selection.
//!
//! Holds the currently requested monitoring set and answers, per sample,
//! whether it should enter the pipeline. Updates build a fresh immutable
//! snapshot that the hot path reads through an atomic pointer swap, so
//! `allow` never contends with control-plane updates.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::warn;

use crate::sampler::event::Sample;

/// Flow selector: zero fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowTarget {
    pub ingress_ifindex: u16,
    pub l4_proto: u8,
}

/// One requested monitoring target, as received from the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetSpec {
    All,
    Cgroup {
        path: String,
    },
    #[serde(alias = "pid")]
    Process {
        pid: u32,
    },
    Flow {
        #[serde(default)]
        ingress_ifindex: u16,
        #[serde(default)]
        l4_proto: u8,
    },
}

#[derive(Default)]
struct TargetSnapshot {
    allow_all: bool,
    has_pid_filter: bool,
    has_flow_filter: bool,
    pids: HashSet<u32>,
    flows: Vec<FlowTarget>,
}

/// Filter applied to every sample leaving the skew adjuster.
pub struct TargetFilter {
    snapshot: ArcSwap<TargetSnapshot>,
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetFilter {
    /// Starts with no targets, which allows everything.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TargetSnapshot {
                allow_all: true,
                ..TargetSnapshot::default()
            }),
        }
    }

    /// Replace the monitoring set. Cgroup targets are expanded to their
    /// current member PIDs here; the set is not refreshed afterwards.
    pub fn update(&self, specs: &[TargetSpec]) {
        let mut next = TargetSnapshot {
            allow_all: specs.is_empty(),
            ..TargetSnapshot::default()
        };

        for spec in specs {
            match spec {
                TargetSpec::All => {
                    next = TargetSnapshot {
                        allow_all: true,
                        ..TargetSnapshot::default()
                    };
                    break;
                }
                TargetSpec::Process { pid } => {
                    next.has_pid_filter = true;
                    if *pid != 0 {
                        next.pids.insert(*pid);
                    }
                }
                TargetSpec::Cgroup { path } => {
                    next.has_pid_filter = true;
                    if !path.is_empty() {
                        load_cgroup_pids(path, &mut next.pids);
                    }
                }
                TargetSpec::Flow {
                    ingress_ifindex,
                    l4_proto,
                } => {
                    next.has_flow_filter = true;
                    next.flows.push(FlowTarget {
                        ingress_ifindex: *ingress_ifindex,
                        l4_proto: *l4_proto,
                    });
                }
            }
        }

        self.snapshot.store(Arc::new(next));
    }

    /// Whether this sample is inside the monitoring set. PID and flow
    /// filters compose as AND; flow selectors compose as OR.
    pub fn allow(&self, sample: &Sample) -> bool {
        let snap = self.snapshot.load();
        if snap.allow_all {
            return true;
        }

        if snap.has_pid_filter && !snap.pids.contains(&sample.pid) {
            return false;
        }

        if !snap.has_flow_filter {
            return true;
        }

        snap.flows.iter().any(|flow| {
            let if_ok =
                flow.ingress_ifindex == 0 || flow.ingress_ifindex == sample.ingress_ifindex;
            let proto_ok = flow.l4_proto == 0 || flow.l4_proto == sample.l4_proto;
            if_ok && proto_ok
        })
    }
}

fn load_cgroup_pids(path: &str, dest: &mut HashSet<u32>) {
    let procs = Path::new(path).join("cgroup.procs");
    let data = match std::fs::read_to_string(&procs) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %procs.display(), error = %e, "failed to read cgroup process list");
            return;
        }
    };
    for line in data.lines() {
        if let Ok(pid) = line.trim().parse::<u32>() {
            if pid != 0 {
                dest.insert(pid);
            }
        }
    }
}
