//! Task Pipeline (§4.10): claim → optional warmup → main run → persist →
//! terminal state, plus the concurrent stop-signal poller.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::db::{ClaimOutcome, JobStore};
use crate::models::{Job, JobStatus, ResultRow, TokenMetricsRow};
use crate::observability::TaskLogSink;
use crate::supervisor;

/// Shared, process-wide bookkeeping the pipeline and the stop-poller both touch (§5).
struct SharedState {
    /// Task ids whose stop signal has been observed; consulted by a running
    /// job's own task after its subprocess exits, to resolve the race
    /// between "process exited naturally" and "operator asked to stop" (§4.10 step 4).
    stopped: Mutex<HashSet<String>>,
    /// task-id -> runner master pid, so the stop-poller can signal it (§4.9 step 4).
    active_masters: Mutex<HashMap<String, u32>>,
}

pub struct Pipeline<S: JobStore + 'static> {
    store: Arc<S>,
    config: Config,
    log_dir: PathBuf,
    tmp_root: PathBuf,
    shared: SharedState,
}

impl<S: JobStore + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>, config: Config, log_dir: PathBuf, tmp_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            log_dir,
            tmp_root,
            shared: SharedState {
                stopped: Mutex::new(HashSet::new()),
                active_masters: Mutex::new(HashMap::new()),
            },
        })
    }

    /// Startup reconciliation (§4.1, §4.9 step 7, S6): a running job whose
    /// task-id still matches a live process is killed before being marked
    /// failed, so no orphaned runner keeps load-testing after a restart.
    pub async fn reconcile_on_startup(&self) {
        let still_alive = |job: &Job| {
            let alive = supervisor::is_task_still_running(&job.id);
            if alive {
                supervisor::sweep_orphan(&job.id);
            }
            alive
        };
        self.store.reconcile_on_startup(&still_alive).await;
    }

    /// Spawns the claim-poll loop and the stop-signal poller as background tasks.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let claim_loop = self.clone();
        tokio::spawn(async move { claim_loop.poll_loop().await });

        let stop_loop = self.clone();
        tokio::spawn(async move { stop_loop.stop_poll_loop().await });
    }

    /// Claim-poll loop. On a transient DB error the next poll is delayed by
    /// the configured back-off instead of the normal poll interval — 10s
    /// normally, 30s once a "lost connection"-shaped error has been seen
    /// (§7) — so a flaky database doesn't turn into a tight retry storm.
    async fn poll_loop(self: Arc<Self>) {
        loop {
            match self.store.claim_next_pending().await {
                ClaimOutcome::Claimed(job) => {
                    let pipeline = self.clone();
                    tokio::spawn(async move { pipeline.execute_job(job).await });
                    tokio::time::sleep(self.config.engine.poll_interval).await;
                }
                ClaimOutcome::Empty => {
                    tokio::time::sleep(self.config.engine.poll_interval).await;
                }
                ClaimOutcome::TransientError { lost_connection } => {
                    let backoff = if lost_connection {
                        self.config.database.backoff_lost_connection_secs
                    } else {
                        self.config.database.backoff_normal_secs
                    };
                    tracing::warn!(lost_connection, backoff, "job store unreachable, backing off");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    /// Scans `stopping` rows every `stop_poll_interval` (§4.10 "Stop signal path").
    async fn stop_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.engine.stop_poll_interval);
        loop {
            ticker.tick().await;
            for task_id in self.store.list_stopping_ids().await {
                self.shared.stopped.lock().unwrap().insert(task_id.clone());
                let pid = self.shared.active_masters.lock().unwrap().get(&task_id).copied();
                if let Some(pid) = pid {
                    supervisor::terminate_then_kill(pid, self.config.engine.kill_grace).await;
                }
                self.store.update_status(&task_id, JobStatus::Stopped, None).await;
            }
        }
    }

    async fn execute_job(self: Arc<Self>, job: Job) {
        let log_sink = match TaskLogSink::open(&self.log_dir, &job.id) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                tracing::error!(task_id = %job.id, error = %e, "failed to open task log sink");
                self.store.update_status(&job.id, JobStatus::Failed, Some(&e.to_string())).await;
                return;
            }
        };

        if let Some(llm) = &job.llm {
            if llm.warmup_enabled {
                match self.run_warmup(&job, &log_sink).await {
                    WarmupOutcome::Aborted => {
                        self.store.update_status(&job.id, JobStatus::Stopped, None).await;
                        self.finish(&job.id);
                        return;
                    }
                    WarmupOutcome::Completed => {
                        tokio::time::sleep(self.config.engine.post_warmup_settle).await;
                    }
                }
            }
        }

        self.store.update_status(&job.id, JobStatus::Running, None).await;

        let result_dir = self.tmp_root.join("locust_result").join(&job.id);
        let mut handle = match supervisor::spawn(&job, &result_dir, false, log_sink.clone()) {
            Ok(h) => h,
            Err(e) => {
                self.store.update_status(&job.id, JobStatus::Failed, Some(&e.to_string())).await;
                self.finish(&job.id);
                return;
            }
        };
        if let Some(pid) = handle.pid() {
            self.shared.active_masters.lock().unwrap().insert(job.id.clone(), pid);
        }

        let stop_timeout = Duration::from_secs(self.config.engine.llm_stop_timeout_secs);
        let ceiling = Duration::from_secs(job.load.total_run_time_secs())
            + stop_timeout
            + self.config.engine.timeout_buffer;

        let outcome = supervisor::wait_with_timeout(&mut handle, ceiling, self.config.engine.kill_grace).await;
        supervisor::join_pumps(handle).await;
        self.shared.active_masters.lock().unwrap().remove(&job.id);

        self.resolve_terminal_state(&job, &result_dir, outcome).await;
        self.finish(&job.id);
    }

    async fn run_warmup(&self, job: &Job, log_sink: &Arc<TaskLogSink>) -> WarmupOutcome {
        let warmup_dir = self.tmp_root.join("locust_warmup").join(&job.id);
        let mut handle = match supervisor::spawn(job, &warmup_dir, true, log_sink.clone()) {
            Ok(h) => h,
            Err(_) => return WarmupOutcome::Aborted,
        };
        let duration = Duration::from_secs(
            job.llm
                .as_ref()
                .map(|l| l.warmup_duration_secs)
                .unwrap_or(self.config.engine.default_warmup_secs),
        );
        let timeout = duration + Duration::from_secs(self.config.engine.warmup_stop_timeout_secs) + self.config.engine.timeout_buffer;
        let outcome = supervisor::wait_with_timeout(&mut handle, timeout, self.config.engine.kill_grace).await;
        supervisor::join_pumps(handle).await;
        supervisor::cleanup_result_dir(&warmup_dir);

        let stopped = self.shared.stopped.lock().unwrap().contains(&job.id);
        let killed_by_signal = matches!(outcome, supervisor::RunOutcome::TimedOut);
        if stopped || killed_by_signal {
            return WarmupOutcome::Aborted;
        }
        WarmupOutcome::Completed
    }

    /// §4.10 step 4: re-read, then decide completed / failed_requests / failed.
    async fn resolve_terminal_state(&self, job: &Job, result_dir: &PathBuf, outcome: supervisor::RunOutcome) {
        let current = self.store.get_job(&job.id).await;
        let already_stopping = current
            .as_ref()
            .map(|j| matches!(j.status, JobStatus::Stopping | JobStatus::Stopped))
            .unwrap_or(false);
        if already_stopping || self.shared.stopped.lock().unwrap().contains(&job.id) {
            self.store.update_status(&job.id, JobStatus::Stopped, None).await;
            supervisor::cleanup_result_dir(result_dir);
            return;
        }

        let realtime_samples = crate::metrics::realtime::read_sidecar(&crate::metrics::realtime::sidecar_path(
            &self.tmp_root,
            &job.id,
        ));

        match (outcome, supervisor::read_result_file(result_dir)) {
            (supervisor::RunOutcome::Exited(status), Ok(result)) if status.success() || has_result_rows(&result.result_rows) => {
                self.persist_result(job, &result.result_rows, result.token_metrics.as_ref(), &realtime_samples)
                    .await;
                let failed_requests = result
                    .result_rows
                    .iter()
                    .find(|r| r.metric_type == "Aggregated")
                    .map(|r| r.num_failures > 0)
                    .unwrap_or(false);
                let final_status = if failed_requests { JobStatus::FailedRequests } else { JobStatus::Completed };
                self.store.update_status(&job.id, final_status, None).await;
            }
            _ => {
                self.store
                    .update_status(&job.id, JobStatus::Failed, Some("runner exited without a usable result"))
                    .await;
            }
        }

        supervisor::cleanup_result_dir(result_dir);
    }

    async fn persist_result(
        &self,
        job: &Job,
        rows: &[ResultRow],
        token_metrics: Option<&TokenMetricsRow>,
        realtime_samples: &[crate::models::RealtimeSample],
    ) {
        self.store.insert_result_rows(&job.id, rows).await;
        if let Some(metrics) = token_metrics {
            self.store.insert_token_metrics(&job.id, metrics).await;
        }
        if !realtime_samples.is_empty() {
            self.store.insert_realtime_samples(&job.id, realtime_samples).await;
        }
    }

    /// §4.10 step 5: always remove the log sink and forget the task id.
    fn finish(&self, task_id: &str) {
        self.shared.stopped.lock().unwrap().remove(task_id);
        self.shared.active_masters.lock().unwrap().remove(task_id);
        let log_path = self.log_dir.join(format!("{task_id}.log"));
        let _ = std::fs::remove_file(log_path);
        cleanup_task_owned_upload(task_id, &self.tmp_root);
    }
}

enum WarmupOutcome {
    Completed,
    Aborted,
}

fn has_result_rows(rows: &[ResultRow]) -> bool {
    !rows.is_empty()
}

/// Deletes a task's own uploaded dataset/cert file, identified by the
/// `<task-id>-` filename prefix convention; files without that prefix are
/// shared templates and are left alone (§4.10 step 5, Open Question).
fn cleanup_task_owned_upload(task_id: &str, tmp_root: &PathBuf) {
    let upload_dir = tmp_root.join("uploads");
    let Ok(entries) = std::fs::read_dir(&upload_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&format!("{task_id}-")) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_result_rows_detects_empty() {
        assert!(!has_result_rows(&[]));
    }
}
