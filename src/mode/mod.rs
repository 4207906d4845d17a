//! Sampling mode control.
//!
//! The agent runs in one of two regimes: low-overhead Sentinel or
//! high-detail Diagnostic. A hysteretic state machine promotes on load or
//! anomaly pressure and demotes only once the load has fallen clearly below
//! the promotion point and any recent anomaly has gone quiet.

pub mod bucket;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::anomaly::{AnomalyKind, AnomalySignal};
use crate::clock::monotonic_ns;
use crate::config::ModeThresholds;

/// Sampling regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentMode {
    Sentinel = 0,
    Diagnostic = 1,
}

impl AgentMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sentinel => "sentinel",
            Self::Diagnostic => "diagnostic",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::Diagnostic
        } else {
            Self::Sentinel
        }
    }

    /// Parse a control-plane mode string ("diag" is accepted shorthand).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sentinel" => Some(Self::Sentinel),
            "diagnostic" | "diag" => Some(Self::Diagnostic),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overload shedding level applied on top of the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafetyLevel {
    Normal = 0,
    ShedHeavy = 1,
}

impl SafetyLevel {
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::ShedHeavy
        } else {
            Self::Normal
        }
    }
}

/// Hysteretic Sentinel/Diagnostic state machine.
pub struct ModeController {
    thresholds: ModeThresholds,
    mode: AtomicU8,
    last_anomaly_ns: AtomicU64,
}

impl ModeController {
    pub fn new(thresholds: ModeThresholds) -> Self {
        Self {
            thresholds,
            mode: AtomicU8::new(AgentMode::Sentinel as u8),
            last_anomaly_ns: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> AgentMode {
        AgentMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Control-plane override; bypasses the state machine.
    pub fn force(&self, mode: AgentMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    fn anomaly_hold_active(&self) -> bool {
        let hold_ns = self.thresholds.quiet_period.as_nanos() as u64;
        if hold_ns == 0 {
            return false;
        }
        let last = self.last_anomaly_ns.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let now = monotonic_ns();
        now >= last && now - last < hold_ns
    }

    /// Periodic update with the observed-rate-to-budget ratio.
    pub fn update(&self, load_ratio: f64) -> AgentMode {
        match self.mode() {
            AgentMode::Sentinel => {
                if load_ratio > self.thresholds.sentinel_to_diag {
                    self.force(AgentMode::Diagnostic);
                }
            }
            AgentMode::Diagnostic => {
                if !self.anomaly_hold_active() && load_ratio < self.thresholds.diag_to_sentinel {
                    self.force(AgentMode::Sentinel);
                }
            }
        }
        self.mode()
    }

    /// Anomaly input; promotes to Diagnostic when the signal crosses its
    /// trigger and arms the quiet-period hold.
    pub fn notify_anomaly(&self, signal: &AnomalySignal) -> AgentMode {
        let ts = if signal.timestamp_ns != 0 {
            signal.timestamp_ns
        } else {
            monotonic_ns()
        };
        self.last_anomaly_ns.store(ts, Ordering::Relaxed);

        match signal.kind {
            AnomalyKind::ThroughputDrop => {
                if signal.ratio > 0.0 && signal.ratio < self.thresholds.throughput_ratio_trigger {
                    self.force(AgentMode::Diagnostic);
                }
            }
            AnomalyKind::LatencySpike => {
                if signal.ratio > self.thresholds.latency_ratio_trigger {
                    self.force(AgentMode::Diagnostic);
                }
            }
        }
        self.mode()
    }
}
