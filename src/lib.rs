//! MicroSentinel: a host observability agent correlating microarchitectural
//! PMU events with network flows and code locations in real time.
//!
//! The crate is organized around a sample pipeline owned by
//! [`agent::AgentRuntime`]: a [`sampler`] source feeds calibrated, skew-
//! adjusted, target-filtered samples into the fused analyzers under
//! [`pipeline`], whose results flow out through the [`sink`] and the
//! [`export`] gauge endpoint. The [`api`] control plane reprograms sampling
//! policy live; [`mode`] and [`anomaly`] drive the Sentinel/Diagnostic
//! regime.

pub mod agent;
pub mod anomaly;
pub mod api;
pub mod clock;
pub mod config;
pub mod export;
pub mod mode;
pub mod pipeline;
pub mod rotate;
pub mod sampler;
pub mod sink;
pub mod symbolize;
