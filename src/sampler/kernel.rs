//! Kernel-backed sample source.
//!
//! Drains the per-CPU sample rings written by the kernel sampler. One
//! worker task runs per NUMA node (or a single global worker when NUMA
//! grouping is off); each worker waits on its subset of CPU rings, drains
//! whichever becomes ready, and re-arms. Per-CPU delivery order is
//! preserved because each CPU's ring is only ever drained by its one
//! worker, in ring order.
//!
//! All code is gated behind the `bpf` feature.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use futures::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aya::maps::perf::AsyncPerfEventArrayBuffer;
use aya::maps::MapData;

use crate::config::SamplingConfig;
use crate::sampler::parse::{parse_sample, RECORD_SIZE};

use super::control::SamplerController;
use super::{node_of_cpu, SampleHandler};

/// Per-event slots handed to each ring read.
const READ_SLOTS: usize = 64;

/// Slack for the perf record framing around each sample.
const SLOT_CAPACITY: usize = RECORD_SIZE + 64;

struct CpuRing {
    cpu: u32,
    ring: AsyncPerfEventArrayBuffer<MapData>,
    slots: Vec<BytesMut>,
}

/// Per-NUMA-node ring drainer over the kernel sample map.
pub struct KernelSource {
    controller: Arc<SamplerController>,
    cfg: SamplingConfig,
}

impl KernelSource {
    pub fn new(controller: Arc<SamplerController>, cfg: SamplingConfig) -> Self {
        Self { controller, cfg }
    }

    /// Open every CPU ring and spawn the node workers. Failure to open one
    /// CPU's ring skips that CPU; failure to open all of them is an error
    /// and the caller falls back to the synthetic source.
    pub fn start(
        &mut self,
        handler: SampleHandler,
        cancel: CancellationToken,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut array = self
            .controller
            .take_sample_array()
            .context("taking sample ring map")?;

        let pages = self.cfg.ring_pages.max(1).next_power_of_two();
        let mut by_node: HashMap<u32, Vec<CpuRing>> = HashMap::new();
        let mut opened = 0usize;

        for &cpu in self.controller.cpus() {
            match array.open(cpu, Some(pages)) {
                Ok(ring) => {
                    let node = if self.cfg.numa_workers {
                        node_of_cpu(cpu)
                    } else {
                        0
                    };
                    by_node.entry(node).or_default().push(CpuRing {
                        cpu,
                        ring,
                        slots: (0..READ_SLOTS)
                            .map(|_| BytesMut::with_capacity(SLOT_CAPACITY))
                            .collect(),
                    });
                    opened += 1;
                }
                Err(e) => {
                    warn!(cpu, error = %e, "failed to open sample ring, skipping CPU");
                }
            }
        }

        if opened == 0 {
            anyhow::bail!("no per-CPU sample ring could be opened");
        }

        let mut tasks = Vec::with_capacity(by_node.len());
        for (node, rings) in by_node {
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            let cpus: Vec<u32> = rings.iter().map(|r| r.cpu).collect();
            info!(node, cpus = ?cpus, "sample ring worker starting");
            tasks.push(tokio::spawn(async move {
                run_node_worker(node, rings, handler, cancel).await;
            }));
        }

        Ok(tasks)
    }
}

async fn run_node_worker(
    node: u32,
    mut rings: Vec<CpuRing>,
    handler: SampleHandler,
    cancel: CancellationToken,
) {
    loop {
        let (index, events) = {
            let reads = rings.iter_mut().map(|entry| {
                let CpuRing { ring, slots, .. } = entry;
                Box::pin(async move { ring.read_events(slots).await })
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(node, "sample ring worker stopping");
                    return;
                }
                (result, index, rest) = select_all(reads) => {
                    drop(rest);
                    match result {
                        Ok(events) => (index, events),
                        Err(e) => {
                            // One CPU's ring failing must not stop the rest.
                            warn!(node, error = %e, "sample ring read failed");
                            continue;
                        }
                    }
                }
            }
        };

        let entry = &rings[index];
        if events.lost > 0 {
            warn!(node, cpu = entry.cpu, lost = events.lost, "kernel dropped samples");
        }

        for slot in entry.slots.iter().take(events.read) {
            match parse_sample(slot) {
                Ok((sample, stack)) => handler(sample, stack),
                Err(e) => {
                    // Malformed records are skipped; the ring stays usable.
                    debug!(node, error = %e, "skipping malformed sample record");
                }
            }
        }
    }
}
