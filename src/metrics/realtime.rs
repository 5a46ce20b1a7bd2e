//! Real-Time Metrics Sampler (§4.8): every 2s, snapshots current load state
//! to an append-only JSONL sidecar at `<tmp>/locust_result/<task-id>/realtime_metrics.jsonl`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::models::RealtimeSample;
use crate::swarm::EndpointAggregates;

/// Counters the sampler reads every tick; updated by the swarm's user tasks.
#[derive(Default)]
pub struct LiveCounters {
    pub current_users: AtomicU64,
    pub total_requests: AtomicU64,
    pub total_failures: AtomicU64,
}

pub fn sidecar_path(tmp_root: &Path, task_id: &str) -> PathBuf {
    tmp_root
        .join("locust_result")
        .join(task_id)
        .join("realtime_metrics.jsonl")
}

/// Runs the 2-second sampling loop until `stop_rx` fires (§4.8). Appends one
/// JSON line per tick. `endpoints` supplies the current aggregate snapshot
/// (used for avg/min/max/median/p95 response time and cumulative counts).
pub async fn run(
    task_id: String,
    sidecar: PathBuf,
    interval: Duration,
    counters: Arc<LiveCounters>,
    endpoints: Arc<EndpointAggregates>,
    mut stop_rx: watch::Receiver<bool>,
) {
    if let Some(parent) = sidecar.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(error = %e, task_id, "realtime sampler: failed to create sidecar dir");
            return;
        }
    }

    let mut prev_requests: u64 = 0;
    let mut prev_failures: u64 = 0;
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; we want period-aligned samples, so
    // consume the immediate tick before entering the loop.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let total_requests = counters.total_requests.load(Ordering::Relaxed);
        let total_failures = counters.total_failures.load(Ordering::Relaxed);
        let current_users = counters.current_users.load(Ordering::Relaxed) as u32;

        let window_requests = total_requests.saturating_sub(prev_requests);
        let window_failures = total_failures.saturating_sub(prev_failures);
        prev_requests = total_requests;
        prev_failures = total_failures;

        let interval_secs = interval.as_secs_f64().max(0.001);
        let latency = endpoints.aggregate_latency();

        let sample = RealtimeSample {
            task_id: task_id.clone(),
            timestamp: now_epoch_secs(),
            current_users,
            current_rps: window_requests as f64 / interval_secs,
            current_fail_per_sec: window_failures as f64 / interval_secs,
            avg_response_time: latency.mean,
            min_response_time: latency.min,
            max_response_time: latency.max,
            median_response_time: latency.median,
            p95_response_time: latency.p95,
            total_requests,
            total_failures,
        };

        if let Err(e) = append_line(&sidecar, &sample).await {
            tracing::warn!(error = %e, task_id, "realtime sampler: failed to append sample");
        }

        if *stop_rx.borrow() {
            break;
        }
    }
}

fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn append_line(path: &Path, sample: &RealtimeSample) -> std::io::Result<()> {
    let line = serde_json::to_string(sample).unwrap_or_default();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::other(e)))
}

/// Reads the sidecar into memory (§4.8: "Task Pipeline reads the file into
/// memory before the result directory is deleted").
pub fn read_sidecar(path: &Path) -> Vec<RealtimeSample> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
