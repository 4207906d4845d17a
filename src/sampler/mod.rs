//! Sample sources.
//!
//! Two variants share one contract: deliver `(Sample, BranchStack)` pairs to
//! a callback, preserving per-CPU order, until cancelled. The kernel-backed
//! variant drains per-CPU perf rings grouped by NUMA node; the synthetic
//! variant fabricates samples at a fixed cadence and exists for bring-up,
//! tests, and hosts where the kernel sampler cannot attach.

pub mod event;
pub mod parse;
pub mod synthetic;

#[cfg(all(feature = "bpf", target_os = "linux"))]
pub mod control;
#[cfg(all(feature = "bpf", target_os = "linux"))]
pub mod kernel;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::{BranchStack, Sample};
use self::synthetic::SyntheticSource;

/// Callback for samples leaving a source.
pub type SampleHandler = Arc<dyn Fn(Sample, BranchStack) + Send + Sync>;

/// A running sample source.
pub enum SampleSource {
    #[cfg(all(feature = "bpf", target_os = "linux"))]
    Kernel(kernel::KernelSource),
    Synthetic(SyntheticSource),
}

impl SampleSource {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(all(feature = "bpf", target_os = "linux"))]
            Self::Kernel(_) => "kernel",
            Self::Synthetic(_) => "synthetic",
        }
    }

    /// Begin delivering samples to the handler until cancellation. Returns
    /// the worker task handles so shutdown can wait for the last samples to
    /// land before draining downstream state.
    pub fn start(
        &mut self,
        handler: SampleHandler,
        cancel: CancellationToken,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        match self {
            #[cfg(all(feature = "bpf", target_os = "linux"))]
            Self::Kernel(source) => source.start(handler, cancel),
            Self::Synthetic(source) => Ok(vec![source.start(handler, cancel)]),
        }
    }
}

/// Parse a kernel CPU list such as "0-3,5,8-9".
pub fn parse_cpu_list(text: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in text.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                    if start <= end {
                        cpus.extend(start..=end);
                    }
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<u32>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

/// Online CPUs from sysfs; falls back to CPU 0.
pub fn online_cpus() -> Vec<u32> {
    let cpus = std::fs::read_to_string("/sys/devices/system/cpu/online")
        .map(|text| parse_cpu_list(&text))
        .unwrap_or_default();
    if cpus.is_empty() {
        vec![0]
    } else {
        cpus
    }
}

/// NUMA node owning a CPU, from sysfs; unknown CPUs land on node 0.
pub fn node_of_cpu(cpu: u32) -> u32 {
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
        return 0;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(node) = name.strip_prefix("node").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let cpulist = entry.path().join("cpulist");
        if let Ok(text) = std::fs::read_to_string(cpulist) {
            if parse_cpu_list(&text).contains(&cpu) {
                return node;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-1,4-5"), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpu_list(" 0-1 , 3 \n"), vec![0, 1, 3]);
        assert_eq!(parse_cpu_list("3,1,1,0"), vec![0, 1, 3]);
        assert!(parse_cpu_list("").is_empty());
        assert!(parse_cpu_list("x-y").is_empty());
    }

    #[test]
    fn test_online_cpus_nonempty() {
        assert!(!online_cpus().is_empty());
    }
}
