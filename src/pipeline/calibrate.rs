//! Per-CPU time calibration.
//!
//! Kernel samples carry per-CPU monotonic timestamps whose base can differ
//! from the agent's own clock (and, on misconfigured hosts, from each other).
//! The calibrator maintains one affine model per CPU mapping raw sample
//! timestamps onto the shared monotonic nanosecond timebase.

use parking_lot::Mutex;

use crate::clock::monotonic_ns;
use crate::config::CalibrationConfig;

const MIN_ALPHA: f64 = 0.001;
const MAX_ALPHA: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
struct CpuModel {
    slope: f64,
    offset: f64,
    last_raw: u64,
    last_ref: u64,
    initialized: bool,
    passthrough_steady: bool,
}

/// Per-CPU affine timestamp normalizer.
pub struct TimeCalibrator {
    cfg: CalibrationConfig,
    models: Mutex<Vec<CpuModel>>,
}

impl TimeCalibrator {
    pub fn new(cfg: CalibrationConfig) -> Self {
        Self {
            cfg,
            models: Mutex::new(Vec::new()),
        }
    }

    /// Normalize one raw per-CPU timestamp into the shared domain.
    pub fn normalize(&self, cpu: u32, raw: u64) -> u64 {
        if !self.cfg.enabled {
            return raw;
        }

        let slope_alpha = self.cfg.slope_alpha.clamp(MIN_ALPHA, MAX_ALPHA);
        let offset_alpha = self.cfg.offset_alpha.clamp(MIN_ALPHA, MAX_ALPHA);

        let ref_ns = monotonic_ns();
        let mut models = self.models.lock();
        let idx = cpu as usize;
        if idx >= models.len() {
            models.resize(idx + 1, CpuModel::default());
        }
        let model = &mut models[idx];

        if !model.initialized {
            model.initialized = true;

            // If the incoming timestamp is already in the same monotonic
            // nanoseconds domain as ref_ns (e.g. produced by
            // bpf_ktime_get_ns()), bypass calibration for this CPU entirely.
            if ref_ns > 0 && raw > 0 {
                let ratio = raw as f64 / ref_ns as f64;
                if ratio > 0.75 && ratio < 1.5 {
                    model.passthrough_steady = true;
                    model.last_raw = raw;
                    model.last_ref = ref_ns;
                    return raw;
                }
            }

            model.slope = 1.0;
            model.offset = ref_ns as f64 - raw as f64;
            model.last_raw = raw;
            model.last_ref = ref_ns;
            return ref_ns;
        }

        if model.passthrough_steady {
            return raw;
        }

        let raw_delta = raw.saturating_sub(model.last_raw);
        let ref_delta = ref_ns.saturating_sub(model.last_ref);
        if raw_delta > 0 && ref_delta > 0 {
            let slope_est = ref_delta as f64 / raw_delta as f64;
            // Backlogged or reordered reads can make the estimate explode.
            if slope_est > 0.0 && slope_est < 10.0 {
                model.slope = slope_alpha * slope_est + (1.0 - slope_alpha) * model.slope;
            }
        }

        let offset_est = ref_ns as f64 - model.slope * raw as f64;
        model.offset = offset_alpha * offset_est + (1.0 - offset_alpha) * model.offset;

        model.last_raw = raw;
        model.last_ref = ref_ns;

        let normalized = model.slope * raw as f64 + model.offset;
        if normalized < 0.0 {
            0
        } else {
            normalized as u64
        }
    }

    /// Visit every initialized per-CPU model, for metrics export.
    pub fn snapshot(&self, mut visit: impl FnMut(u32, f64, f64)) {
        let models = self.models.lock();
        for (cpu, model) in models.iter().enumerate() {
            if model.initialized {
                visit(cpu as u32, model.slope, model.offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrator(enabled: bool) -> TimeCalibrator {
        TimeCalibrator::new(CalibrationConfig {
            enabled,
            slope_alpha: 0.05,
            offset_alpha: 0.05,
        })
    }

    #[test]
    fn test_disabled_is_identity() {
        let cal = calibrator(false);
        assert_eq!(cal.normalize(0, 12345), 12345);
        let mut seen = 0;
        cal.snapshot(|_, _, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_passthrough_for_steady_clock_domain() {
        let cal = calibrator(true);
        // A raw value taken from the same monotonic clock lands inside the
        // passthrough ratio window and must come back unchanged.
        let raw = monotonic_ns();
        assert_eq!(cal.normalize(0, raw), raw);
        let raw2 = monotonic_ns();
        assert_eq!(cal.normalize(0, raw2), raw2);
    }

    #[test]
    fn test_foreign_domain_initializes_offset() {
        let cal = calibrator(true);
        // A tiny raw value cannot be in the steady domain; the first result
        // is the reference clock itself.
        let before = monotonic_ns();
        let out = cal.normalize(1, 1000);
        let after = monotonic_ns();
        assert!(out >= before && out <= after);
    }

    #[test]
    fn test_monotonicity_per_cpu() {
        let cal = calibrator(true);
        let mut prev = cal.normalize(2, 1000);
        for raw in [2000u64, 3000, 4000, 10_000, 50_000] {
            let cur = cal.normalize(2, raw);
            assert!(cur >= prev, "normalize({raw}) = {cur} < {prev}");
            prev = cur;
        }
    }

    #[test]
    fn test_snapshot_reports_initialized_cpus() {
        let cal = calibrator(true);
        cal.normalize(0, 1000);
        cal.normalize(3, 1000);
        let mut cpus = Vec::new();
        cal.snapshot(|cpu, slope, _| {
            assert!(slope > 0.0);
            cpus.push(cpu);
        });
        assert_eq!(cpus, vec![0, 3]);
    }
}
