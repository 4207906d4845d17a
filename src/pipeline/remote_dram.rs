//! Remote-DRAM hotspot analysis.
//!
//! Counts `RemoteDram` samples per `(flow, numa node, interface)` tuple and
//! reports tuples whose activity has gone quiet for a full window, i.e. a
//! completed burst of cross-node memory traffic attributable to one flow.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::sampler::event::{PmuEventKind, Sample};

/// Default reporting window.
pub const DEFAULT_WINDOW_NS: u64 = 50_000_000;

/// One completed remote-DRAM burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDramFinding {
    pub flow_id: u64,
    pub numa_node: u16,
    pub ifindex: u16,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    flow_id: u64,
    numa_node: u16,
    ifindex: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    count: u64,
    last_tsc: u64,
}

/// `(flow, numa, interface)` rate finder over `RemoteDram` samples.
pub struct RemoteDramAnalyzer {
    window_ns: u64,
    table: Mutex<HashMap<Key, Entry>>,
}

impl RemoteDramAnalyzer {
    pub fn new(window_ns: u64) -> Self {
        Self {
            window_ns: if window_ns == 0 {
                DEFAULT_WINDOW_NS
            } else {
                window_ns
            },
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, sample: &Sample) {
        if sample.pmu_event != PmuEventKind::RemoteDram as u32 {
            return;
        }
        let key = Key {
            flow_id: sample.flow_id,
            numa_node: sample.numa_node,
            ifindex: sample.ingress_ifindex,
        };
        let mut table = self.table.lock();
        let entry = table.entry(key).or_default();
        entry.count += 1;
        entry.last_tsc = sample.tsc;
    }

    /// Evict and report entries idle for longer than the window. The
    /// callback runs outside the table lock.
    pub fn flush(&self, now_tsc: u64, mut report: impl FnMut(&RemoteDramFinding)) {
        let expired: Vec<(Key, Entry)> = {
            let mut table = self.table.lock();
            let stale: Vec<Key> = table
                .iter()
                .filter(|(_, entry)| now_tsc.saturating_sub(entry.last_tsc) > self.window_ns)
                .map(|(key, _)| *key)
                .collect();
            stale
                .into_iter()
                .filter_map(|key| table.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, entry) in expired {
            if entry.count == 0 {
                continue;
            }
            report(&RemoteDramFinding {
                flow_id: key.flow_id,
                numa_node: key.numa_node,
                ifindex: key.ifindex,
                samples: entry.count,
            });
        }
    }
}
