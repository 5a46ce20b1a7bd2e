//! Job Store Gateway (§4.1): typed access to job, result, and real-time
//! metric tables with row-level locking for claim.

#[cfg(feature = "postgres")]
mod postgres;
mod row_mapping;

#[cfg(feature = "postgres")]
pub use postgres::PgJobStore;

use async_trait::async_trait;

use crate::models::{Job, JobStatus, RealtimeSample, ResultRow, TokenMetricsRow};

/// Outcome of a claim attempt (§4.1, §7): distinguishes "nothing to claim"
/// from "couldn't reach the database", so the poller can back off on the
/// latter without slowing down the common empty-queue case.
pub enum ClaimOutcome {
    Claimed(Job),
    Empty,
    /// `lost_connection` is set when the failure looks like a dropped
    /// connection rather than e.g. a single deadlock, selecting the longer
    /// of the two back-off tiers (§7).
    TransientError { lost_connection: bool },
}

impl ClaimOutcome {
    pub fn into_job(self) -> Option<Job> {
        match self {
            ClaimOutcome::Claimed(job) => Some(job),
            _ => None,
        }
    }
}

/// Abstraction over the job/result/real-time-metric tables (§4.1, §6).
///
/// Implemented against PostgreSQL in [`postgres::PgJobStore`]; an in-memory
/// fake is used in unit tests for the Task Pipeline and stop-poller.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claims any `created`, non-deleted job and transitions it to `locked`.
    /// Never blocks the poller loop indefinitely: row-lock contention and
    /// transient connection loss both resolve immediately rather than
    /// retrying in place (§4.1).
    async fn claim_next_pending(&self) -> ClaimOutcome;

    /// IDs of jobs currently in state `stopping` (§4.1, §4.10 stop-poller).
    async fn list_stopping_ids(&self) -> Vec<String>;

    /// Fetches one job by id, bypassing claim semantics (used to re-read a
    /// row before deciding a terminal state, §4.10 step 4).
    async fn get_job(&self, job_id: &str) -> Option<Job>;

    /// Updates status, validating the transition against the allowed-edge
    /// table (§3 invariant, §4.10). An illegal transition is logged and
    /// swallowed as a no-op rather than propagated, matching the
    /// "errors never escape the poller loop" propagation policy (§7).
    async fn update_status(&self, job_id: &str, new_status: JobStatus, error: Option<&str>);

    async fn insert_result_rows(&self, job_id: &str, rows: &[ResultRow]);
    async fn insert_token_metrics(&self, job_id: &str, row: &TokenMetricsRow);
    async fn insert_realtime_samples(&self, job_id: &str, samples: &[RealtimeSample]);

    /// Marks every job left `running`/`locked` on engine restart as failed,
    /// after the caller has had a chance to kill any live matching process
    /// (§4.1, §4.9 step 7, S6).
    async fn reconcile_on_startup(&self, still_alive: &(dyn for<'a> Fn(&'a Job) -> bool + Send + Sync));
}

#[cfg(test)]
pub mod fake {
    //! In-memory [`JobStore`] fake used by pipeline/poller unit tests.

    use std::sync::Mutex;

    use super::*;

    pub struct FakeJobStore {
        pub jobs: Mutex<Vec<Job>>,
        pub result_rows: Mutex<Vec<(String, Vec<ResultRow>)>>,
        pub token_rows: Mutex<Vec<(String, TokenMetricsRow)>>,
        pub realtime_rows: Mutex<Vec<(String, Vec<RealtimeSample>)>>,
    }

    impl FakeJobStore {
        pub fn new(jobs: Vec<Job>) -> Self {
            Self {
                jobs: Mutex::new(jobs),
                result_rows: Mutex::new(Vec::new()),
                token_rows: Mutex::new(Vec::new()),
                realtime_rows: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobStore for FakeJobStore {
        async fn claim_next_pending(&self) -> ClaimOutcome {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs
                .iter_mut()
                .find(|j| j.status == JobStatus::Created && !j.is_deleted)
            else {
                return ClaimOutcome::Empty;
            };
            job.status = JobStatus::Locked;
            ClaimOutcome::Claimed(job.clone())
        }

        async fn list_stopping_ids(&self) -> Vec<String> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.status == JobStatus::Stopping)
                .map(|j| j.id.clone())
                .collect()
        }

        async fn get_job(&self, job_id: &str) -> Option<Job> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .find(|j| j.id == job_id)
                .cloned()
        }

        async fn update_status(&self, job_id: &str, new_status: JobStatus, error: Option<&str>) {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
                if crate::models::is_allowed_transition(job.status, new_status) {
                    job.status = new_status;
                    if let Some(e) = error {
                        job.error_message = Some(crate::models::truncate_error_message(e));
                    }
                } else {
                    tracing::warn!(
                        job_id,
                        from = ?job.status,
                        to = ?new_status,
                        "rejected illegal status transition"
                    );
                }
            }
        }

        async fn insert_result_rows(&self, job_id: &str, rows: &[ResultRow]) {
            self.result_rows
                .lock()
                .unwrap()
                .push((job_id.to_string(), rows.to_vec()));
        }

        async fn insert_token_metrics(&self, job_id: &str, row: &TokenMetricsRow) {
            self.token_rows
                .lock()
                .unwrap()
                .push((job_id.to_string(), row.clone()));
        }

        async fn insert_realtime_samples(&self, job_id: &str, samples: &[RealtimeSample]) {
            self.realtime_rows
                .lock()
                .unwrap()
                .push((job_id.to_string(), samples.to_vec()));
        }

        async fn reconcile_on_startup(&self, still_alive: &(dyn for<'a> Fn(&'a Job) -> bool + Send + Sync)) {
            let mut jobs = self.jobs.lock().unwrap();
            for job in jobs.iter_mut() {
                match job.status {
                    JobStatus::Running => {
                        let msg = if still_alive(job) {
                            "Task process was found running after an engine restart and was terminated."
                        } else {
                            "Task process was not found after an engine restart."
                        };
                        job.status = JobStatus::Failed;
                        job.error_message = Some(msg.to_string());
                    }
                    JobStatus::Locked => {
                        job.status = JobStatus::Failed;
                        job.error_message =
                            Some("Task was locked but aborted before execution.".to_string());
                    }
                    _ => {}
                }
            }
        }
    }
}
