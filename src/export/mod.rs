//! Gauge snapshot exporter.
//!
//! Keeps a flat `name -> value` map, where the name already carries its
//! serialized label set, and serves the whole map as `name value` lines over
//! HTTP. No HELP/TYPE metadata; consumers treat every line as a gauge.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MetricsConfig;

/// In-memory gauge map served over HTTP.
pub struct MetricsExporter {
    cfg: MetricsConfig,
    gauges: Mutex<HashMap<String, f64>>,
}

impl MetricsExporter {
    pub fn new(cfg: MetricsConfig) -> Self {
        Self {
            cfg,
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Overwrite one gauge. The name may embed a label set, e.g.
    /// `ms_tsc_slope{cpu="3"}`.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.lock().insert(name.to_string(), value);
    }

    /// Render the full snapshot, sorted by name for stable output.
    pub fn render(&self) -> String {
        let gauges = self.gauges.lock();
        let mut entries: Vec<(&String, &f64)> = gauges.iter().collect();
        entries.sort_by_key(|(name, _)| name.as_str());

        let mut out = String::with_capacity(entries.len() * 48);
        for (name, value) in entries {
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.address, self.cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;

        let app = Router::new()
            .fallback(serve_snapshot)
            .with_state(Arc::clone(self));

        info!(addr = %addr, "metrics exporter listening");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
        });

        Ok(())
    }
}

async fn serve_snapshot(State(exporter): State<Arc<MetricsExporter>>) -> impl IntoResponse {
    (
        [("Content-Type", "text/plain")],
        exporter.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_render() {
        let exporter = MetricsExporter::new(MetricsConfig::default());
        exporter.set_gauge("ms_agent_mode", 1.0);
        exporter.set_gauge("ms_samples_per_sec", 2500.5);
        let body = exporter.render();
        assert_eq!(body, "ms_agent_mode 1\nms_samples_per_sec 2500.5\n");
    }

    #[test]
    fn test_overwrite() {
        let exporter = MetricsExporter::new(MetricsConfig::default());
        exporter.set_gauge("ms_pmu_scale", 1.0);
        exporter.set_gauge("ms_pmu_scale", 3.0);
        assert_eq!(exporter.render(), "ms_pmu_scale 3\n");
    }

    #[test]
    fn test_labeled_names_are_distinct() {
        let exporter = MetricsExporter::new(MetricsConfig::default());
        exporter.set_gauge("ms_tsc_slope{cpu=\"0\"}", 1.0);
        exporter.set_gauge("ms_tsc_slope{cpu=\"1\"}", 1.1);
        let body = exporter.render();
        assert!(body.contains("ms_tsc_slope{cpu=\"0\"} 1\n"));
        assert!(body.contains("ms_tsc_slope{cpu=\"1\"} 1.1\n"));
    }

    #[test]
    fn test_empty_render() {
        let exporter = MetricsExporter::new(MetricsConfig::default());
        assert_eq!(exporter.render(), "");
    }
}
