//! Flow-identifier skew adjustment.
//!
//! PMU skid can land a sample just before or after the packet context that
//! should have tagged it, leaving `flow_id == 0`. A short per-CPU window
//! holds recent samples and back-fills missing flow identifiers from the
//! nearest in-tolerance neighbor before releasing them downstream.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::sampler::event::{BranchStack, Sample};

/// Default back-fill tolerance, matches the kernel sampler's skid bound.
pub const DEFAULT_TOLERANCE_NS: u64 = 2000;

struct Bundle {
    sample: Sample,
    stack: BranchStack,
}

#[derive(Default)]
struct CpuWindow {
    entries: VecDeque<Bundle>,
}

/// Per-CPU bounded reorder window that adopts neighbor flow identifiers.
pub struct SkewAdjuster {
    tolerance_ns: u64,
    max_window: usize,
    per_cpu: Mutex<Vec<CpuWindow>>,
}

impl SkewAdjuster {
    pub fn new(tolerance_ns: u64, max_window: usize) -> Self {
        Self {
            tolerance_ns: if tolerance_ns == 0 {
                DEFAULT_TOLERANCE_NS
            } else {
                tolerance_ns
            },
            max_window: max_window.max(2),
            per_cpu: Mutex::new(Vec::new()),
        }
    }

    /// Admit one sample; emits every entry that leaves the window, oldest
    /// first. The callback runs outside the internal lock.
    pub fn process(
        &self,
        sample: Sample,
        stack: BranchStack,
        emit: &mut dyn FnMut(Sample, BranchStack),
    ) {
        let mut ready = Vec::new();
        {
            let mut per_cpu = self.per_cpu.lock();
            let idx = sample.cpu as usize;
            if idx >= per_cpu.len() {
                per_cpu.resize_with(idx + 1, CpuWindow::default);
            }
            let window = &mut per_cpu[idx];
            window.entries.push_back(Bundle { sample, stack });
            self.adjust_window(window);
            self.drain_ready(window, &mut ready);
        }
        for bundle in ready {
            emit(bundle.sample, bundle.stack);
        }
    }

    /// Drain every held entry on shutdown, preserving per-CPU order.
    pub fn flush_all(&self, emit: &mut dyn FnMut(Sample, BranchStack)) {
        let mut ready = Vec::new();
        {
            let mut per_cpu = self.per_cpu.lock();
            for window in per_cpu.iter_mut() {
                while let Some(bundle) = window.entries.pop_front() {
                    ready.push(bundle);
                }
            }
        }
        for bundle in ready {
            emit(bundle.sample, bundle.stack);
        }
    }

    fn adjust_window(&self, window: &mut CpuWindow) {
        let n = window.entries.len();
        if n < 2 {
            return;
        }

        for i in 0..n {
            if window.entries[i].sample.flow_id != 0 {
                continue;
            }
            let tsc = window.entries[i].sample.tsc;
            let mut best_flow = 0u64;
            let mut best_delta = u64::MAX;

            // The window is TSC-ordered per CPU, so the scan can stop at the
            // first neighbor that falls outside the tolerance.
            for j in (0..i).rev() {
                let candidate = &window.entries[j].sample;
                if candidate.flow_id == 0 {
                    continue;
                }
                let delta = tsc.abs_diff(candidate.tsc);
                if delta > self.tolerance_ns {
                    break;
                }
                if delta < best_delta {
                    best_delta = delta;
                    best_flow = candidate.flow_id;
                }
            }

            for j in i + 1..n {
                let candidate = &window.entries[j].sample;
                if candidate.flow_id == 0 {
                    continue;
                }
                let delta = tsc.abs_diff(candidate.tsc);
                if delta > self.tolerance_ns {
                    break;
                }
                if delta < best_delta {
                    best_delta = delta;
                    best_flow = candidate.flow_id;
                }
            }

            if best_flow != 0 {
                window.entries[i].sample.flow_id = best_flow;
            }
        }
    }

    fn drain_ready(&self, window: &mut CpuWindow, ready: &mut Vec<Bundle>) {
        while window.entries.len() > 1 {
            ready.push(window.entries.pop_front().expect("non-empty window"));
        }
        if window.entries.len() > self.max_window {
            ready.push(window.entries.pop_front().expect("non-empty window"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: u32, tsc: u64, flow_id: u64) -> Sample {
        Sample {
            cpu,
            tsc,
            flow_id,
            ..Sample::default()
        }
    }

    fn collect(adj: &SkewAdjuster, samples: Vec<Sample>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for s in samples {
            adj.process(s, Vec::new(), &mut |s, _| out.push((s.tsc, s.flow_id)));
        }
        adj.flush_all(&mut |s, _| out.push((s.tsc, s.flow_id)));
        out
    }

    #[test]
    fn test_backfill_from_later_neighbor() {
        let adj = SkewAdjuster::new(2000, 4);
        let out = collect(&adj, vec![sample(0, 100, 0), sample(0, 120, 42)]);
        assert_eq!(out, vec![(100, 42), (120, 42)]);
    }

    #[test]
    fn test_backfill_is_per_cpu() {
        let adj = SkewAdjuster::new(2000, 4);
        let out = collect(
            &adj,
            vec![
                sample(0, 1000, 0),
                sample(1, 1010, 77),
                sample(0, 1040, 99),
            ],
        );
        // cpu=0 entry adopts from its own later neighbor, never from cpu=1.
        assert!(out.contains(&(1000, 99)));
        assert!(out.contains(&(1040, 99)));
        assert!(out.contains(&(1010, 77)));
    }

    #[test]
    fn test_out_of_tolerance_neighbor_ignored() {
        let adj = SkewAdjuster::new(2000, 4);
        let out = collect(&adj, vec![sample(0, 100, 0), sample(0, 5000, 42)]);
        assert_eq!(out, vec![(100, 0), (5000, 42)]);
    }

    #[test]
    fn test_nearest_donor_wins() {
        let adj = SkewAdjuster::new(2000, 8);
        let mut out = Vec::new();
        for s in [
            sample(0, 100, 7),
            sample(0, 140, 9),
            sample(0, 150, 0),
        ] {
            adj.process(s, Vec::new(), &mut |s, _| out.push((s.tsc, s.flow_id)));
        }
        adj.flush_all(&mut |s, _| out.push((s.tsc, s.flow_id)));
        // Both donors are in tolerance; 140 is nearer than 100.
        assert!(out.contains(&(150, 9)));
    }

    #[test]
    fn test_emission_preserves_insertion_order() {
        let adj = SkewAdjuster::new(2000, 4);
        let out = collect(
            &adj,
            vec![
                sample(0, 10, 1),
                sample(0, 20, 2),
                sample(0, 30, 3),
                sample(0, 40, 4),
            ],
        );
        let tscs: Vec<u64> = out.iter().map(|(t, _)| *t).collect();
        assert_eq!(tscs, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_backfilled_sample_keeps_own_identity() {
        let adj = SkewAdjuster::new(2000, 4);
        let mut got = Vec::new();
        let donor = Sample {
            cpu: 0,
            tsc: 120,
            flow_id: 42,
            pid: 9,
            ip: 0x9999,
            ..Sample::default()
        };
        let orphan = Sample {
            cpu: 0,
            tsc: 100,
            flow_id: 0,
            pid: 5,
            ip: 0x5555,
            ..Sample::default()
        };
        adj.process(orphan, Vec::new(), &mut |s, _| got.push(s));
        adj.process(donor, Vec::new(), &mut |s, _| got.push(s));
        adj.flush_all(&mut |s, _| got.push(s));

        let filled = got.iter().find(|s| s.tsc == 100).expect("orphan emitted");
        assert_eq!(filled.flow_id, 42);
        assert_eq!(filled.pid, 5);
        assert_eq!(filled.ip, 0x5555);
    }
}
