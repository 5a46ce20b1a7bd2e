//! PostgreSQL implementation of the Job Store Gateway (§4.1, §6).
//!
//! Delegates connection pooling to `deadpool-postgres`, matching the
//! teacher's `src/history/store.rs` `Store` (`Config` + `Runtime::Tokio1`
//! pool, `NoTls`, `refinery::embed_migrations!`).

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::db::row_mapping::{
    llm_extras_from_row, load_config_from_row, method_from_str, parse_headers_or_cookies,
    status_from_db,
};
use crate::db::{ClaimOutcome, JobStore};
use crate::error::DatabaseError;
use crate::models::{
    is_allowed_transition, truncate_error_message, Job, JobStatus, RealtimeSample, ResultRow,
    TokenMetricsRow,
};

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: Pool,
}

impl PgJobStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });
        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let _ = pool.get().await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        use refinery::embed_migrations;
        embed_migrations!("migrations");

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn row_to_job(&self, row: &tokio_postgres::Row) -> Result<Job, DatabaseError> {
        let status_str: String = row.get("status");
        let headers_raw: Option<String> = row.get("headers");
        let cookies_raw: Option<String> = row.get("cookies");
        let payload_raw: Option<String> = row.get("request_payload");

        Ok(Job {
            id: row.get("id"),
            name: row.get("name"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            is_deleted: row.get("is_deleted"),
            target_host: row.get("target_host"),
            api_path: row.get("api_path"),
            method: method_from_str(&row.get::<_, String>("method")),
            headers: parse_headers_or_cookies(headers_raw.as_deref()),
            cookies: parse_headers_or_cookies(cookies_raw.as_deref()),
            request_payload: payload_raw.and_then(|s| serde_json::from_str(&s).ok()),
            request_body_text: row.get("request_body_text"),
            test_data_path: row.get("test_data_path"),
            test_data_inline: row.get("test_data_inline"),
            load: load_config_from_row(
                &row.get::<_, String>("load_mode"),
                row.get("users"),
                row.get("spawn_rate"),
                row.get("duration_seconds"),
                row.get("step_start_users"),
                row.get("step_increment"),
                row.get("step_duration"),
                row.get("step_max_users"),
                row.get("step_sustain_duration"),
            ),
            llm: llm_extras_from_row(
                row.get("model"),
                row.get("api_type"),
                row.get("stream_mode"),
                row.get("chat_type"),
                row.get("field_mapping"),
                row.get("warmup_enabled"),
                row.get("warmup_duration"),
            ),
            cert_file: row.get("cert_file"),
            key_file: row.get("key_file"),
            status: status_from_db(&status_str)?,
            error_message: row.get("error_message"),
        })
    }
}

/// Selects the longer back-off tier (§7) when a failure's message looks
/// like a dropped connection rather than e.g. a single deadlock.
fn looks_like_lost_connection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("lost connection") || lower.contains("connection closed") || lower.contains("broken pipe")
}

const JOB_COLUMNS: &str = "id, name, created_by, created_at, is_deleted, target_host, api_path, \
     method, headers, cookies, request_payload, request_body_text, test_data_path, \
     test_data_inline, load_mode, users, spawn_rate, duration_seconds, step_start_users, \
     step_increment, step_duration, step_max_users, step_sustain_duration, model, api_type, \
     stream_mode, chat_type, field_mapping, warmup_enabled, warmup_duration, cert_file, \
     key_file, status, error_message";

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_next_pending(&self) -> ClaimOutcome {
        let mut conn = match self.pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "job store: pool connection failed, will retry next poll");
                return ClaimOutcome::TransientError { lost_connection: looks_like_lost_connection(&e.to_string()) };
            }
        };

        let txn = match conn.transaction().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "job store: failed to start claim transaction");
                return ClaimOutcome::TransientError { lost_connection: looks_like_lost_connection(&e.to_string()) };
            }
        };

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM tasks \
             WHERE status = 'created' AND is_deleted = false \
             ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let row = match txn.query_opt(&query, &[]).await {
            Ok(Some(r)) => r,
            Ok(None) => return ClaimOutcome::Empty,
            Err(e) => {
                tracing::warn!(error = %e, "job store: claim select failed");
                return ClaimOutcome::TransientError { lost_connection: looks_like_lost_connection(&e.to_string()) };
            }
        };

        let job = match self.row_to_job(&row).await {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "job store: failed to map claimed row");
                return ClaimOutcome::TransientError { lost_connection: false };
            }
        };

        if let Err(e) = txn
            .execute(
                "UPDATE tasks SET status = 'locked' WHERE id = $1",
                &[&job.id],
            )
            .await
        {
            tracing::warn!(error = %e, job_id = %job.id, "job store: failed to mark locked");
            return ClaimOutcome::TransientError { lost_connection: looks_like_lost_connection(&e.to_string()) };
        }

        if let Err(e) = txn.commit().await {
            tracing::warn!(error = %e, job_id = %job.id, "job store: claim commit failed");
            return ClaimOutcome::TransientError { lost_connection: looks_like_lost_connection(&e.to_string()) };
        }

        ClaimOutcome::Claimed(Job {
            status: JobStatus::Locked,
            ..job
        })
    }

    async fn list_stopping_ids(&self) -> Vec<String> {
        let conn = match self.pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "job store: pool connection failed listing stopping ids");
                return Vec::new();
            }
        };
        match conn
            .query("SELECT id FROM tasks WHERE status = 'stopping'", &[])
            .await
        {
            Ok(rows) => rows.iter().map(|r| r.get("id")).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "job store: list_stopping_ids query failed");
                Vec::new()
            }
        }
    }

    async fn get_job(&self, job_id: &str) -> Option<Job> {
        let conn = self.pool.get().await.ok()?;
        let query = format!("SELECT {JOB_COLUMNS} FROM tasks WHERE id = $1");
        let row = conn.query_opt(&query, &[&job_id]).await.ok()??;
        self.row_to_job(&row).await.ok()
    }

    async fn update_status(&self, job_id: &str, new_status: JobStatus, error: Option<&str>) {
        let Some(current) = self.get_job(job_id).await else {
            tracing::warn!(job_id, "job store: update_status on unknown job");
            return;
        };
        if !is_allowed_transition(current.status, new_status) {
            tracing::warn!(
                job_id,
                from = %current.status,
                to = %new_status,
                "job store: rejected illegal status transition"
            );
            return;
        }

        let conn = match self.pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, job_id, "job store: pool connection failed on update_status");
                return;
            }
        };

        let truncated = error.map(truncate_error_message);
        let now = Utc::now();
        let (started, completed) = match new_status {
            JobStatus::Running => (Some(now), None),
            s if s.is_terminal() => (None, Some(now)),
            _ => (None, None),
        };

        let result = conn
            .execute(
                "UPDATE tasks SET status = $2, error_message = COALESCE($3, error_message), \
                 started_at = COALESCE($4, started_at), completed_at = COALESCE($5, completed_at) \
                 WHERE id = $1",
                &[&job_id, &new_status.as_str(), &truncated, &started, &completed],
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, job_id, "job store: update_status failed");
        }
    }

    async fn insert_result_rows(&self, job_id: &str, rows: &[ResultRow]) {
        let Ok(conn) = self.pool.get().await else {
            tracing::warn!(job_id, "job store: pool connection failed inserting results");
            return;
        };
        for row in rows {
            let result = conn
                .execute(
                    "INSERT INTO task_results (task_id, metric_type, num_requests, num_failures, \
                     avg_latency, min_latency, max_latency, median_latency, p95_latency, rps, \
                     avg_content_length, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())",
                    &[
                        &job_id,
                        &row.metric_type,
                        &(row.num_requests as i64),
                        &(row.num_failures as i64),
                        &row.avg_latency,
                        &row.min_latency,
                        &row.max_latency,
                        &row.median_latency,
                        &row.p95_latency,
                        &row.rps,
                        &row.avg_content_length,
                    ],
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, job_id, metric = %row.metric_type, "job store: insert_result_rows failed");
            }
        }
    }

    async fn insert_token_metrics(&self, job_id: &str, row: &TokenMetricsRow) {
        let Ok(conn) = self.pool.get().await else {
            tracing::warn!(job_id, "job store: pool connection failed inserting token metrics");
            return;
        };
        let result = conn
            .execute(
                "INSERT INTO task_results (task_id, metric_type, num_requests, num_failures, \
                 avg_latency, min_latency, max_latency, median_latency, p95_latency, rps, \
                 avg_content_length, total_tps, completion_tps, avg_total_tokens_per_req, \
                 avg_completion_tokens_per_req, created_at) \
                 VALUES ($1, 'token_metrics', $2, 0, $3, $4, $5, $6, $7, 0, 0, $8, $9, $10, $11, NOW())",
                &[
                    &job_id,
                    &(row.total_time.count as i64),
                    &row.total_time.mean,
                    &row.time_to_first_output_token.min,
                    &row.time_to_output_completion.max,
                    &row.total_time.median,
                    &row.total_time.p95,
                    &row.total_tps,
                    &row.completion_tps,
                    &row.avg_total_tokens_per_req,
                    &row.avg_completion_tokens_per_req,
                ],
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, job_id, "job store: insert_token_metrics failed");
        }
    }

    async fn insert_realtime_samples(&self, job_id: &str, samples: &[RealtimeSample]) {
        let Ok(conn) = self.pool.get().await else {
            tracing::warn!(job_id, "job store: pool connection failed inserting realtime samples");
            return;
        };
        for sample in samples {
            let result = conn
                .execute(
                    "INSERT INTO realtime_samples (task_id, timestamp, current_users, current_rps, \
                     current_fail_per_sec, avg_response_time, min_response_time, max_response_time, \
                     median_response_time, p95_response_time, total_requests, total_failures) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                    &[
                        &job_id,
                        &sample.timestamp,
                        &(sample.current_users as i32),
                        &sample.current_rps,
                        &sample.current_fail_per_sec,
                        &sample.avg_response_time,
                        &sample.min_response_time,
                        &sample.max_response_time,
                        &sample.median_response_time,
                        &sample.p95_response_time,
                        &(sample.total_requests as i64),
                        &(sample.total_failures as i64),
                    ],
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, job_id, "job store: insert_realtime_samples failed");
            }
        }
    }

    async fn reconcile_on_startup(&self, still_alive: &(dyn for<'a> Fn(&'a Job) -> bool + Send + Sync)) {
        let Ok(conn) = self.pool.get().await else {
            tracing::warn!("job store: pool connection failed during startup reconciliation");
            return;
        };
        let query = format!("SELECT {JOB_COLUMNS} FROM tasks WHERE status IN ('running', 'locked')");
        let rows = match conn.query(&query, &[]).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "job store: reconciliation query failed");
                return;
            }
        };

        for row in &rows {
            let Ok(job) = self.row_to_job(row).await else {
                continue;
            };
            let msg = match job.status {
                JobStatus::Running if still_alive(&job) => {
                    "Task process was found running after an engine restart and was terminated."
                }
                JobStatus::Running => "Task process was not found after an engine restart.",
                JobStatus::Locked => "Task was locked but aborted before execution.",
                _ => continue,
            };
            tracing::info!(job_id = %job.id, "reconciling orphaned job on startup");
            self.update_status(&job.id, JobStatus::Failed, Some(msg)).await;
        }
    }
}
