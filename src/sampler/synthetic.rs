//! Synthetic sample generator.
//!
//! Emits fabricated samples at a fixed cadence so the full pipeline can be
//! exercised without the kernel sampler: bring-up on new hosts, CI, and the
//! fallback path when no perf ring could be attached. Always logged loudly,
//! since its output looks like real data downstream.

use std::time::Duration;

use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::monotonic_ns;
use crate::sampler::event::{PmuEventKind, Sample, MAX_PMU_EVENT};

use super::SampleHandler;

/// Fixed-cadence fabricated sample source.
pub struct SyntheticSource {
    period: Duration,
}

impl SyntheticSource {
    pub fn new(period: Duration) -> Self {
        Self {
            period: if period.is_zero() {
                Duration::from_millis(10)
            } else {
                period
            },
        }
    }

    pub fn start(
        &self,
        handler: SampleHandler,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.period;
        warn!(
            period = ?period,
            "synthetic sample generator active; emitted samples are fabricated"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut rng = rand::rngs::StdRng::from_entropy();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                handler(fabricate(&mut rng), Vec::new());
            }
        })
    }
}

fn fabricate(rng: &mut impl Rng) -> Sample {
    Sample {
        tsc: monotonic_ns(),
        cpu: 0,
        pid: std::process::id(),
        tid: std::process::id(),
        pmu_event: rng.gen_range(PmuEventKind::L3Miss as u32..=MAX_PMU_EVENT),
        ip: 0x1,
        data_addr: 0x1000,
        flow_id: rng.gen_range(1..=1_000_000),
        gso_segs: 1,
        ingress_ifindex: 1,
        numa_node: 0,
        l4_proto: 6,
        direction: 0,
        branch_count: 0,
    }
}
