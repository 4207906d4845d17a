//! Batched export to the rollup store.
//!
//! Four independent queues (rollups, raw samples, stack interns, data-object
//! interns) are drained into `INSERT INTO <table> FORMAT JSONEachRow` POSTs.
//! Enqueues are O(1) under a mutex; a queue reaching the batch size nudges
//! the background writer, which otherwise flushes on a fixed cadence.
//! Delivery is best-effort: a failed POST is logged once and the batch is
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::pipeline::aggregate::{AggregatedValue, AttributionKey};
use crate::sampler::event::{BranchStack, Sample};
use crate::symbolize::{DataSymbol, StackTrace};

struct RawRow {
    sample: Sample,
    stack: BranchStack,
    norm_cost: f64,
}

#[derive(Default)]
struct Queues {
    rollups: Vec<(AttributionKey, AggregatedValue)>,
    stacks: Vec<StackTrace>,
    raws: Vec<RawRow>,
    data_objects: Vec<DataSymbol>,
}

/// Background writer feeding the four store tables.
pub struct SinkWriter {
    cfg: SinkConfig,
    hostname: String,
    queues: Mutex<Queues>,
    kick: Notify,
    bucket_width_ns: AtomicU64,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SinkWriter {
    pub fn new(cfg: SinkConfig) -> Self {
        Self {
            cfg,
            hostname: read_hostname(),
            queues: Mutex::new(Queues::default()),
            kick: Notify::new(),
            bucket_width_ns: AtomicU64::new(5_000_000),
            run_task: Mutex::new(None),
        }
    }

    /// Bucket width used to convert rollup bucket indices back to seconds.
    pub fn set_bucket_width(&self, ns: u64) {
        self.bucket_width_ns.store(ns, Ordering::Relaxed);
    }

    /// Spawn the background flush task.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let writer = Arc::clone(self);
        let task = tokio::spawn(async move {
            writer.run_loop(cancel).await;
        });
        *self.run_task.lock() = Some(task);
        info!(endpoint = %self.cfg.endpoint, "sink writer started");
    }

    /// Wait for the background task to finish its final flush.
    pub async fn wait_for_shutdown(&self) {
        let task = { self.run_task.lock().take() };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "sink writer task join failed");
            }
        }
    }

    pub fn enqueue_rollup(&self, key: &AttributionKey, value: &AggregatedValue) {
        let len = {
            let mut queues = self.queues.lock();
            queues.rollups.push((*key, *value));
            queues.rollups.len()
        };
        if len >= self.cfg.batch_size {
            self.kick.notify_one();
        }
    }

    pub fn enqueue_stack(&self, trace: &StackTrace) {
        if trace.frames.is_empty() {
            return;
        }
        let len = {
            let mut queues = self.queues.lock();
            queues.stacks.push(trace.clone());
            queues.stacks.len()
        };
        if len >= self.cfg.batch_size {
            self.kick.notify_one();
        }
    }

    pub fn enqueue_raw_sample(&self, sample: &Sample, stack: &BranchStack, norm_cost: f64) {
        let len = {
            let mut queues = self.queues.lock();
            queues.raws.push(RawRow {
                sample: *sample,
                stack: stack.clone(),
                norm_cost,
            });
            queues.raws.len()
        };
        if len >= self.cfg.batch_size {
            self.kick.notify_one();
        }
    }

    pub fn enqueue_data_object(&self, symbol: &DataSymbol) {
        if symbol.id == 0 {
            return;
        }
        let len = {
            let mut queues = self.queues.lock();
            queues.data_objects.push(symbol.clone());
            queues.data_objects.len()
        };
        if len >= self.cfg.batch_size {
            self.kick.notify_one();
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let client = reqwest::Client::new();
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush_all(&client).await;
                    return;
                }
                _ = self.kick.notified() => {
                    self.flush_all(&client).await;
                }
                _ = ticker.tick() => {
                    self.flush_all(&client).await;
                }
            }
        }
    }

    async fn flush_all(&self, client: &reqwest::Client) {
        let pending = {
            let mut queues = self.queues.lock();
            std::mem::take(&mut *queues)
        };

        let bucket_width = self.bucket_width_ns.load(Ordering::Relaxed);

        if !pending.rollups.is_empty() {
            let rows: Vec<String> = pending
                .rollups
                .iter()
                .map(|(key, value)| {
                    rollup_row(key, value, &self.hostname, bucket_width).to_string()
                })
                .collect();
            self.post_batch(client, &self.cfg.table, rows).await;
        }

        if !pending.stacks.is_empty() {
            let rows: Vec<String> = pending
                .stacks
                .iter()
                .map(|trace| stack_row(trace, &self.hostname).to_string())
                .collect();
            self.post_batch(client, &self.cfg.stack_table, rows).await;
        }

        if !pending.raws.is_empty() {
            let rows: Vec<String> = pending
                .raws
                .iter()
                .map(|row| raw_row(&row.sample, &row.stack, row.norm_cost, &self.hostname).to_string())
                .collect();
            self.post_batch(client, &self.cfg.raw_table, rows).await;
        }

        if !pending.data_objects.is_empty() {
            let rows: Vec<String> = pending
                .data_objects
                .iter()
                .map(|symbol| data_object_row(symbol, &self.hostname).to_string())
                .collect();
            self.post_batch(client, &self.cfg.data_table, rows).await;
        }
    }

    async fn post_batch(&self, client: &reqwest::Client, table: &str, rows: Vec<String>) {
        let count = rows.len();
        let body = insert_body(table, &rows);

        match client
            .post(self.cfg.endpoint.as_str())
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(table, rows = count, "batch flushed");
            }
            Ok(resp) => {
                warn!(table, rows = count, status = %resp.status(), "store rejected batch, dropping");
            }
            Err(e) => {
                warn!(table, rows = count, error = %e, "store unreachable, dropping batch");
            }
        }
    }
}

fn insert_body(table: &str, rows: &[String]) -> String {
    let mut body = format!("INSERT INTO {table} FORMAT JSONEachRow\n");
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    body
}

fn rollup_row(
    key: &AttributionKey,
    value: &AggregatedValue,
    hostname: &str,
    bucket_width_ns: u64,
) -> serde_json::Value {
    let window_start = (key.bucket.saturating_mul(bucket_width_ns)) as f64 / 1e9;
    json!({
        "window_start": window_start,
        "host": hostname,
        "flow_id": key.flow_id,
        "function_id": key.function_id,
        "callstack_id": key.stack_id,
        "pmu_event": key.pmu_event,
        "numa_node": key.numa_node,
        "direction": key.direction,
        "interference_class": key.interference_class,
        "data_object_id": key.data_object_id,
        "samples": value.samples,
        "norm_cost": value.norm_cost,
    })
}

fn raw_row(
    sample: &Sample,
    stack: &BranchStack,
    norm_cost: f64,
    hostname: &str,
) -> serde_json::Value {
    let lbr: Vec<[u64; 2]> = stack.iter().map(|entry| [entry.from, entry.to]).collect();
    json!({
        "ts": sample.tsc as f64 / 1e9,
        "host": hostname,
        "cpu": sample.cpu,
        "pid": sample.pid,
        "tid": sample.tid,
        "flow_id": sample.flow_id,
        "pmu_event": sample.pmu_event,
        "ip": sample.ip,
        "data_addr": sample.data_addr,
        "gso_segs": sample.gso_segs,
        "ifindex": sample.ingress_ifindex,
        "direction": sample.direction,
        "numa_node": sample.numa_node,
        "l4_proto": sample.l4_proto,
        "norm_cost": norm_cost,
        "lbr": lbr,
    })
}

fn stack_row(trace: &StackTrace, hostname: &str) -> serde_json::Value {
    let frames: Vec<serde_json::Value> = trace
        .frames
        .iter()
        .map(|frame| {
            json!({
                "binary": frame.binary,
                "function": frame.function,
                "file": frame.source_file,
                "line": frame.line,
            })
        })
        .collect();
    json!({
        "stack_id": trace.id,
        "host": hostname,
        "frames": frames,
    })
}

fn data_object_row(symbol: &DataSymbol, hostname: &str) -> serde_json::Value {
    json!({
        "object_id": symbol.id,
        "host": hostname,
        "mapping": symbol.object.mapping,
        "base": symbol.object.base,
        "size": symbol.object.size,
        "permissions": symbol.object.permissions,
    })
}

fn read_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
