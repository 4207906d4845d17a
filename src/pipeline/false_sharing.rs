//! False-sharing detection.
//!
//! Tracks cross-socket snoop HITM samples per 64-byte cache line and reports
//! lines that were hammered from multiple CPUs once they go quiet. A line
//! dominated by a single CPU is contention on that CPU's own working set,
//! not false sharing, and is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sampler::event::{PmuEventKind, Sample};
use crate::symbolize::{DataObject, Symbolizer};

/// Default reporting window.
pub const DEFAULT_WINDOW_NS: u64 = 50_000_000;

/// Default minimum hit count before a line can be reported.
pub const DEFAULT_THRESHOLD: u64 = 100;

const CACHE_LINE_MASK: u64 = !63;

/// Maximum share of total hits one CPU may hold.
const MAX_CPU_SHARE: f64 = 0.9;

/// One suspected falsely-shared cache line.
#[derive(Debug, Clone)]
pub struct FalseSharingFinding {
    pub line_addr: u64,
    pub total_hits: u64,
    pub cpu_hits: Vec<u64>,
    pub dominant_pid: u32,
    pub object: DataObject,
}

#[derive(Default)]
struct LineStats {
    total_hits: u64,
    last_tsc: u64,
    cpu_hits: Vec<u64>,
    pid_hits: HashMap<u32, u64>,
}

/// Cache-line-keyed cross-CPU concurrent-modifier finder.
pub struct FalseSharingDetector {
    symbolizer: Arc<Symbolizer>,
    window_ns: u64,
    threshold: u64,
    table: Mutex<HashMap<u64, LineStats>>,
}

impl FalseSharingDetector {
    pub fn new(symbolizer: Arc<Symbolizer>, window_ns: u64, threshold: u64) -> Self {
        Self {
            symbolizer,
            window_ns: if window_ns == 0 {
                DEFAULT_WINDOW_NS
            } else {
                window_ns
            },
            threshold,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, sample: &Sample) {
        if sample.pmu_event != PmuEventKind::CrossSnoopHitm as u32 {
            return;
        }

        let line = sample.data_addr & CACHE_LINE_MASK;
        let mut table = self.table.lock();
        let stats = table.entry(line).or_default();
        stats.total_hits += 1;
        stats.last_tsc = sample.tsc;
        let cpu = sample.cpu as usize;
        if stats.cpu_hits.len() <= cpu {
            stats.cpu_hits.resize(cpu + 1, 0);
        }
        stats.cpu_hits[cpu] += 1;
        *stats.pid_hits.entry(sample.pid).or_default() += 1;
    }

    /// Evict lines idle for longer than the window and report those that
    /// pass the false-sharing filters. The callback and the symbolizer run
    /// outside the table lock.
    pub fn flush(&self, now_tsc: u64, mut report: impl FnMut(&FalseSharingFinding)) {
        let expired: Vec<(u64, LineStats)> = {
            let mut table = self.table.lock();
            let stale: Vec<u64> = table
                .iter()
                .filter(|(_, stats)| now_tsc.saturating_sub(stats.last_tsc) > self.window_ns)
                .map(|(line, _)| *line)
                .collect();
            stale
                .into_iter()
                .filter_map(|line| table.remove(&line).map(|stats| (line, stats)))
                .collect()
        };

        for (line_addr, stats) in expired {
            if stats.total_hits < self.threshold {
                continue;
            }

            let mut active_cpus = 0u64;
            let mut max_hits = 0u64;
            for &hits in &stats.cpu_hits {
                if hits == 0 {
                    continue;
                }
                active_cpus += 1;
                max_hits = max_hits.max(hits);
            }
            if active_cpus < 2 {
                continue;
            }
            if max_hits as f64 / stats.total_hits as f64 >= MAX_CPU_SHARE {
                continue;
            }

            let dominant_pid = stats
                .pid_hits
                .iter()
                .max_by_key(|(_, hits)| **hits)
                .map(|(pid, _)| *pid)
                .unwrap_or(0);

            let object = if dominant_pid != 0 {
                self.symbolizer.resolve_data(dominant_pid, line_addr)
            } else {
                DataObject::default()
            };

            report(&FalseSharingFinding {
                line_addr,
                total_hits: stats.total_hits,
                cpu_hits: stats.cpu_hits,
                dominant_pid,
                object,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hitm(cpu: u32, pid: u32, addr: u64, tsc: u64) -> Sample {
        Sample {
            cpu,
            pid,
            data_addr: addr,
            tsc,
            pmu_event: PmuEventKind::CrossSnoopHitm as u32,
            ..Sample::default()
        }
    }

    fn detector(window_ns: u64, threshold: u64) -> FalseSharingDetector {
        FalseSharingDetector::new(Arc::new(Symbolizer::new()), window_ns, threshold)
    }

    #[test]
    fn test_two_cpu_line_reported() {
        let det = detector(1000, 10);
        for i in 0..5 {
            det.observe(&hitm(0, 100, 0x1000 + i, 100));
            det.observe(&hitm(1, 200, 0x1020 + i, 100));
        }

        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));

        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.line_addr, 0x1000);
        assert_eq!(f.total_hits, 10);
        assert_eq!(f.cpu_hits[0], 5);
        assert_eq!(f.cpu_hits[1], 5);
    }

    #[test]
    fn test_below_threshold_not_reported() {
        let det = detector(1000, 100);
        for _ in 0..50 {
            det.observe(&hitm(0, 1, 0x40, 100));
            det.observe(&hitm(1, 1, 0x48, 100));
        }
        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_single_cpu_not_reported() {
        let det = detector(1000, 10);
        for _ in 0..100 {
            det.observe(&hitm(3, 1, 0x40, 100));
        }
        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_dominant_cpu_rejected() {
        let det = detector(1000, 10);
        // 95 of 100 hits from cpu 0: share 0.95 >= 0.9.
        for _ in 0..95 {
            det.observe(&hitm(0, 1, 0x80, 100));
        }
        for _ in 0..5 {
            det.observe(&hitm(1, 1, 0x80, 100));
        }
        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_fresh_lines_kept() {
        let det = detector(1_000_000, 1);
        det.observe(&hitm(0, 1, 0x40, 5000));
        det.observe(&hitm(1, 1, 0x40, 5000));

        let mut findings = Vec::new();
        det.flush(5100, |f| findings.push(f.clone()));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_dominant_pid_and_line_key() {
        let det = detector(1000, 2);
        det.observe(&hitm(0, 111, 0x1004, 100));
        det.observe(&hitm(1, 222, 0x1034, 100));
        det.observe(&hitm(1, 222, 0x103f, 100));

        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_addr, 0x1000);
        assert_eq!(findings[0].dominant_pid, 222);
    }

    #[test]
    fn test_ignores_other_events() {
        let det = detector(1000, 1);
        let mut s = hitm(0, 1, 0x40, 100);
        s.pmu_event = PmuEventKind::L3Miss as u32;
        det.observe(&s);
        let mut s2 = hitm(1, 1, 0x40, 100);
        s2.pmu_event = PmuEventKind::RemoteDram as u32;
        det.observe(&s2);

        let mut findings = Vec::new();
        det.flush(10_000, |f| findings.push(f.clone()));
        assert!(findings.is_empty());
    }
}
