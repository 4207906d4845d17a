//! Sample pipeline stages, in flow order: calibration, skew adjustment,
//! target filtering, then the fused analyzers (aggregation, false-sharing,
//! remote-DRAM).

pub mod aggregate;
pub mod calibrate;
pub mod false_sharing;
pub mod remote_dram;
pub mod skew;
pub mod targets;
