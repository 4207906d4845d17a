use std::fmt;

/// Maximum branch-stack entries carried inline in a kernel sample.
/// Must match `MS_LBR_MAX` in the kernel sampler headers.
pub const MAX_BRANCH_ENTRIES: usize = 16;

/// PmuEventKind identifies the logical hardware event that produced a sample.
/// Values must match `ms_pmu_event_type` in the kernel sampler headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PmuEventKind {
    L3Miss = 1,
    BranchMispred = 2,
    ICacheStall = 3,
    AvxDownclock = 4,
    BackendStall = 5,
    CrossSnoopHitm = 6,
    RemoteDram = 7,
}

/// Maximum PmuEventKind value, used for array sizing.
pub const MAX_PMU_EVENT: u32 = 7;

impl PmuEventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L3Miss => "l3_miss",
            Self::BranchMispred => "branch_mispred",
            Self::ICacheStall => "icache_stall",
            Self::AvxDownclock => "avx_downclock",
            Self::BackendStall => "backend_stall",
            Self::CrossSnoopHitm => "xsnp_hitm",
            Self::RemoteDram => "remote_dram",
        }
    }

    /// Convert from a raw u32 value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::L3Miss),
            2 => Some(Self::BranchMispred),
            3 => Some(Self::ICacheStall),
            4 => Some(Self::AvxDownclock),
            5 => Some(Self::BackendStall),
            6 => Some(Self::CrossSnoopHitm),
            7 => Some(Self::RemoteDram),
            _ => None,
        }
    }

    /// Convert from the canonical label name (accepts the legacy
    /// "branch_misp" spelling used by older control clients).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "l3_miss" => Some(Self::L3Miss),
            "branch_mispred" | "branch_misp" => Some(Self::BranchMispred),
            "icache_stall" => Some(Self::ICacheStall),
            "avx_downclock" => Some(Self::AvxDownclock),
            "backend_stall" => Some(Self::BackendStall),
            "xsnp_hitm" => Some(Self::CrossSnoopHitm),
            "remote_dram" => Some(Self::RemoteDram),
            _ => None,
        }
    }

    /// Return all event kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::L3Miss,
            Self::BranchMispred,
            Self::ICacheStall,
            Self::AvxDownclock,
            Self::BackendStall,
            Self::CrossSnoopHitm,
            Self::RemoteDram,
        ]
    }
}

impl fmt::Display for PmuEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse bucket labeling what part of the microarchitecture an event
/// reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterferenceClass {
    DataPath = 0,
    ControlPath = 1,
    ExecutionResource = 2,
    TopologyInterconnect = 3,
    Unknown = 255,
}

impl InterferenceClass {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataPath => "data_path",
            Self::ControlPath => "control_path",
            Self::ExecutionResource => "execution_resource",
            Self::TopologyInterconnect => "topology",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::DataPath,
            1 => Self::ControlPath,
            2 => Self::ExecutionResource,
            3 => Self::TopologyInterconnect,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for InterferenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw PMU event value into its interference class.
pub fn classify_event(pmu_event: u32) -> InterferenceClass {
    match PmuEventKind::from_u32(pmu_event) {
        Some(PmuEventKind::L3Miss) => InterferenceClass::DataPath,
        Some(PmuEventKind::BranchMispred) | Some(PmuEventKind::ICacheStall) => {
            InterferenceClass::ControlPath
        }
        Some(PmuEventKind::AvxDownclock) | Some(PmuEventKind::BackendStall) => {
            InterferenceClass::ExecutionResource
        }
        Some(PmuEventKind::CrossSnoopHitm) | Some(PmuEventKind::RemoteDram) => {
            InterferenceClass::TopologyInterconnect
        }
        None => InterferenceClass::Unknown,
    }
}

/// Packet direction as stamped by the kernel flow-context hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Rx = 0,
    Tx = 1,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Rx),
            1 => Some(Self::Tx),
            _ => None,
        }
    }

    /// Metric label for a raw direction byte; out-of-range values map to
    /// "unknown" rather than being rejected.
    pub fn label(v: u8) -> &'static str {
        match v {
            0 => "rx",
            1 => "tx",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("rx"),
            Self::Tx => f.write_str("tx"),
        }
    }
}

/// One taken-branch record from the in-CPU LBR ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
}

/// Ordered branch stack attached to a sample, newest-first, 0..16 entries.
pub type BranchStack = Vec<BranchEntry>;

/// A single PMU sample as written by the kernel sampler, consumed verbatim.
///
/// `tsc` is kernel-monotonic nanoseconds in the producing CPU's time base
/// until the calibrator rewrites it into the shared domain. `flow_id == 0`
/// means the sample carried no packet context.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub tsc: u64,
    pub cpu: u32,
    pub pid: u32,
    pub tid: u32,
    pub pmu_event: u32,
    pub ip: u64,
    pub data_addr: u64,
    pub flow_id: u64,
    pub gso_segs: u32,
    pub ingress_ifindex: u16,
    pub numa_node: u16,
    pub l4_proto: u8,
    pub direction: u8,
    pub branch_count: u8,
}
