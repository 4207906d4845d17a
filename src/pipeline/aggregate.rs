//! Time-bucketed sample aggregation.
//!
//! Folds every accepted sample into a single table keyed by the full
//! attribution tuple. The per-sample cost is the published PMU scale divided
//! by the GSO segment count, so rollup rates stay comparable across event
//! group rotations and large offloaded packets count per wire segment.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sampler::event::{classify_event, BranchStack, Sample};
use crate::symbolize::Symbolizer;

/// Composite attribution tuple. Equality is by value; the hash mixes every
/// field so adjacent flows and buckets spread across the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributionKey {
    pub flow_id: u64,
    pub function_id: u64,
    pub stack_id: u64,
    pub data_object_id: u64,
    pub pmu_event: u32,
    pub numa_node: u16,
    pub interference_class: u8,
    pub direction: u8,
    pub bucket: u64,
}

impl Hash for AttributionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc = self.flow_id;
        acc ^= self
            .function_id
            .wrapping_add(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(acc << 6)
            .wrapping_add(acc >> 2);
        acc ^= self
            .stack_id
            .wrapping_add(0xbf58_476d_1ce4_e5b9)
            .wrapping_add(acc << 5)
            .wrapping_add(acc >> 3);
        acc ^= self
            .data_object_id
            .wrapping_add(0x94d0_49bb_1331_11eb)
            .wrapping_add(acc << 4)
            .wrapping_add(acc >> 1);
        acc ^= u64::from(self.pmu_event).wrapping_add(acc);
        acc ^= u64::from(self.numa_node).wrapping_add(acc);
        acc ^= u64::from(self.interference_class).wrapping_add(acc);
        acc ^= u64::from(self.direction).wrapping_add(acc);
        acc ^= self.bucket.wrapping_add(0x517c_c1b7_2722_0a95);
        state.write_u64(acc);
    }
}

/// Accumulated cost for one attribution key.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregatedValue {
    pub samples: u64,
    pub norm_cost: f64,
}

/// Single in-memory rollup table over the accepted sample stream.
pub struct Aggregator {
    symbolizer: Arc<Symbolizer>,
    window_ns: u64,
    max_entries: usize,
    table: Mutex<HashMap<AttributionKey, AggregatedValue>>,
    /// Inverse duty cycle of the active event group, published by the
    /// rotator; stored as f64 bits.
    sample_scale: AtomicU64,
    sheds: AtomicU64,
}

impl Aggregator {
    pub fn new(symbolizer: Arc<Symbolizer>, window_ns: u64, max_entries: usize) -> Self {
        Self {
            symbolizer,
            window_ns,
            max_entries,
            table: Mutex::new(HashMap::new()),
            sample_scale: AtomicU64::new(1.0f64.to_bits()),
            sheds: AtomicU64::new(0),
        }
    }

    /// Publish a new per-sample scale factor. Non-positive values reset to 1.
    pub fn set_sample_scale(&self, scale: f64) {
        let scale = if scale <= 0.0 { 1.0 } else { scale };
        self.sample_scale.store(scale.to_bits(), Ordering::Relaxed);
    }

    pub fn sample_scale(&self) -> f64 {
        f64::from_bits(self.sample_scale.load(Ordering::Relaxed))
    }

    /// Times the whole table was shed due to overflow.
    pub fn shed_count(&self) -> u64 {
        self.sheds.load(Ordering::Relaxed)
    }

    fn bucketize(&self, tsc: u64) -> u64 {
        if self.window_ns == 0 {
            tsc
        } else {
            tsc / self.window_ns
        }
    }

    /// Fold one sample into the table.
    pub fn add(&self, sample: &Sample, branches: &BranchStack) {
        let key = AttributionKey {
            flow_id: sample.flow_id,
            function_id: self.symbolizer.intern_function(sample.pid, sample.ip),
            stack_id: self.symbolizer.intern_stack(sample.pid, sample.ip, branches),
            data_object_id: self
                .symbolizer
                .intern_data_object(sample.pid, sample.data_addr),
            pmu_event: sample.pmu_event,
            numa_node: sample.numa_node,
            interference_class: classify_event(sample.pmu_event) as u8,
            direction: sample.direction,
            bucket: self.bucketize(sample.tsc),
        };

        let weight = self.sample_scale() / f64::from(sample.gso_segs.max(1));

        let mut table = self.table.lock();
        let slot = table.entry(key).or_default();
        slot.samples += 1;
        slot.norm_cost += weight;

        // Shed the whole table rather than stall under overload; partial old
        // buckets are worth less than keeping the hot path moving.
        if table.len() > self.max_entries {
            table.clear();
            self.sheds.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Swap the table out and report every entry. Returns the total sample
    /// count across the reported entries. The callback runs outside the lock
    /// and the table is never partially iterated.
    pub fn flush(&self, mut report: impl FnMut(&AttributionKey, &AggregatedValue)) -> u64 {
        let snapshot = {
            let mut table = self.table.lock();
            std::mem::take(&mut *table)
        };

        let mut total = 0u64;
        for (key, value) in &snapshot {
            report(key, value);
            total += value.samples;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::event::{InterferenceClass, PmuEventKind};

    fn aggregator(window_ns: u64, max_entries: usize) -> Aggregator {
        Aggregator::new(Arc::new(Symbolizer::new()), window_ns, max_entries)
    }

    fn sample(tsc: u64, flow_id: u64, gso_segs: u32) -> Sample {
        Sample {
            tsc,
            flow_id,
            gso_segs,
            pid: u32::MAX - 9,
            ip: 0x1234,
            pmu_event: PmuEventKind::L3Miss as u32,
            ..Sample::default()
        }
    }

    #[test]
    fn test_gso_normalization() {
        let agg = aggregator(100, 1000);
        agg.set_sample_scale(1.0);
        agg.add(&sample(1000, 7, 4), &Vec::new());

        let mut entries = Vec::new();
        let total = agg.flush(|k, v| entries.push((*k, *v)));

        assert_eq!(total, 1);
        assert_eq!(entries.len(), 1);
        let (key, value) = entries[0];
        assert_eq!(key.flow_id, 7);
        assert_eq!(key.bucket, 10);
        assert_eq!(value.samples, 1);
        assert!(value.norm_cost > 0.24 && value.norm_cost < 0.26);
    }

    #[test]
    fn test_flush_total_matches_accepted_samples() {
        let agg = aggregator(100, 1000);
        for i in 0..37 {
            agg.add(&sample(i * 10, i % 3, 1), &Vec::new());
        }
        let total = agg.flush(|_, _| {});
        assert_eq!(total, 37);
        // Second flush sees an empty table.
        assert_eq!(agg.flush(|_, _| {}), 0);
    }

    #[test]
    fn test_unit_scale_costs_match_counts() {
        let agg = aggregator(1000, 1000);
        agg.set_sample_scale(1.0);
        for i in 0..20 {
            agg.add(&sample(i, 1, 1), &Vec::new());
        }
        let mut samples = 0u64;
        let mut cost = 0.0f64;
        agg.flush(|_, v| {
            samples += v.samples;
            cost += v.norm_cost;
        });
        assert_eq!(samples, 20);
        assert!((cost - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_multiplies_cost() {
        let agg = aggregator(1000, 1000);
        agg.set_sample_scale(3.0);
        agg.add(&sample(5, 1, 1), &Vec::new());
        let mut cost = 0.0;
        agg.flush(|_, v| cost += v.norm_cost);
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_nonpositive_scale_resets_to_one() {
        let agg = aggregator(1000, 1000);
        agg.set_sample_scale(0.0);
        assert_eq!(agg.sample_scale(), 1.0);
        agg.set_sample_scale(-4.0);
        assert_eq!(agg.sample_scale(), 1.0);
    }

    #[test]
    fn test_same_bucket_same_key_accumulates() {
        let agg = aggregator(100, 1000);
        agg.add(&sample(110, 1, 1), &Vec::new());
        agg.add(&sample(190, 1, 1), &Vec::new());

        let mut entries = Vec::new();
        agg.flush(|k, v| entries.push((*k, *v)));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.samples, 2);
    }

    #[test]
    fn test_zero_window_buckets_by_tsc() {
        let agg = aggregator(0, 1000);
        agg.add(&sample(42, 1, 1), &Vec::new());
        let mut buckets = Vec::new();
        agg.flush(|k, _| buckets.push(k.bucket));
        assert_eq!(buckets, vec![42]);
    }

    #[test]
    fn test_overflow_sheds_entire_table() {
        let agg = aggregator(0, 8);
        for i in 0..9 {
            // Distinct tsc with zero window makes every sample a new key.
            agg.add(&sample(i, 1, 1), &Vec::new());
        }
        assert_eq!(agg.shed_count(), 1);
        // The shed cleared everything inserted so far.
        assert_eq!(agg.flush(|_, _| {}), 0);
    }

    #[test]
    fn test_interference_class_in_key() {
        let agg = aggregator(100, 1000);
        let mut s = sample(10, 1, 1);
        s.pmu_event = PmuEventKind::RemoteDram as u32;
        agg.add(&s, &Vec::new());
        let mut classes = Vec::new();
        agg.flush(|k, _| classes.push(k.interference_class));
        assert_eq!(
            classes,
            vec![InterferenceClass::TopologyInterconnect as u8]
        );
    }

    #[test]
    fn test_zero_data_addr_interns_nothing() {
        let agg = aggregator(100, 1000);
        agg.add(&sample(10, 1, 1), &Vec::new());
        let mut ids = Vec::new();
        agg.flush(|k, _| ids.push(k.data_object_id));
        assert_eq!(ids, vec![0]);
    }
}
