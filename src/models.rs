//! Core data model shared across the engine (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job status (§3). Transitions are validated against [`ALLOWED_TRANSITIONS`]
/// by the Job Store Gateway before being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Locked,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    FailedRequests,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Locked => "locked",
            JobStatus::Running => "running",
            JobStatus::Stopping => "stopping",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::FailedRequests => "failed_requests",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Completed | JobStatus::Failed | JobStatus::FailedRequests
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => JobStatus::Created,
            "locked" => JobStatus::Locked,
            "running" => JobStatus::Running,
            "stopping" => JobStatus::Stopping,
            "stopped" => JobStatus::Stopped,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "failed_requests" => JobStatus::FailedRequests,
            other => return Err(format!("unknown job status '{other}'")),
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed status transitions (§4.10):
/// created -> locked -> running -> {completed | failed | failed_requests | stopping}
/// stopping -> stopped ; locked -> failed.
pub const ALLOWED_TRANSITIONS: &[(JobStatus, JobStatus)] = &[
    (JobStatus::Created, JobStatus::Locked),
    (JobStatus::Locked, JobStatus::Running),
    (JobStatus::Locked, JobStatus::Failed),
    (JobStatus::Running, JobStatus::Completed),
    (JobStatus::Running, JobStatus::Failed),
    (JobStatus::Running, JobStatus::FailedRequests),
    (JobStatus::Running, JobStatus::Stopping),
    (JobStatus::Stopping, JobStatus::Stopped),
];

pub fn is_allowed_transition(from: JobStatus, to: JobStatus) -> bool {
    from == to || ALLOWED_TRANSITIONS.contains(&(from, to))
}

/// HTTP method for the target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// Load profile mode (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoadConfig {
    Fixed {
        users: u32,
        spawn_rate: f64,
        duration_seconds: u64,
    },
    Stepped {
        start_users: u32,
        increment: u32,
        step_duration: u64,
        max_users: u32,
        sustain_duration: u64,
    },
}

impl LoadConfig {
    /// Total planned run time (§3): for stepped,
    /// `ceil((max-start)/increment + 1) * step_duration + sustain_duration`.
    pub fn total_run_time_secs(&self) -> u64 {
        match self {
            LoadConfig::Fixed { duration_seconds, .. } => *duration_seconds,
            LoadConfig::Stepped {
                start_users,
                increment,
                step_duration,
                max_users,
                sustain_duration,
            } => {
                let steps = if *increment == 0 {
                    1
                } else {
                    let span = max_users.saturating_sub(*start_users) as f64 / *increment as f64;
                    (span + 1.0).ceil() as u64
                };
                steps * step_duration + sustain_duration
            }
        }
    }
}

/// API flavor tag (§4.3 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiFlavor {
    OpenaiChat,
    ClaudeChat,
    Embeddings,
    Custom,
}

impl std::str::FromStr for ApiFlavor {
    type Err = crate::error::MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "openai-chat" => ApiFlavor::OpenaiChat,
            "claude-chat" => ApiFlavor::ClaudeChat,
            "embeddings" => ApiFlavor::Embeddings,
            "custom" => ApiFlavor::Custom,
            other => return Err(crate::error::MappingError::UnknownFlavor(other.to_string())),
        })
    }
}

/// Chat type selector (§3): 0=text, 1=image+text, 2=vision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChatType {
    Text = 0,
    ImageText = 1,
    Vision = 2,
}

impl ChatType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ChatType::ImageText,
            2 => ChatType::Vision,
            _ => ChatType::Text,
        }
    }

    pub fn allows_image(&self) -> bool {
        !matches!(self, ChatType::Text)
    }
}

/// LLM-flavor extras attached to a job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmExtras {
    pub model: String,
    pub api_flavor: ApiFlavor,
    pub stream_mode: bool,
    pub chat_type: ChatType,
    pub field_mapping: Option<serde_json::Value>,
    pub warmup_enabled: bool,
    pub warmup_duration_secs: u64,
}

/// A claimed load-test Job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,

    pub target_host: String,
    pub api_path: String,
    pub method: HttpMethod,

    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,

    pub request_payload: Option<serde_json::Value>,
    pub request_body_text: Option<String>,
    pub test_data_path: Option<String>,
    pub test_data_inline: Option<String>,

    pub load: LoadConfig,
    pub llm: Option<LlmExtras>,

    pub cert_file: Option<String>,
    pub key_file: Option<String>,

    pub status: JobStatus,
    pub error_message: Option<String>,
}

impl Job {
    pub fn is_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub fn target_url(&self) -> String {
        format!(
            "{}{}",
            self.target_host.trim_end_matches('/'),
            if self.api_path.starts_with('/') {
                self.api_path.clone()
            } else {
                format!("/{}", self.api_path)
            }
        )
    }
}

/// Truncates `error_message` to 65 KB with the contractual suffix (§4.1).
pub fn truncate_error_message(msg: &str) -> String {
    const LIMIT: usize = 65_000;
    if msg.len() <= LIMIT {
        return msg.to_string();
    }
    let cut = msg
        .char_indices()
        .take_while(|(idx, _)| *idx < LIMIT)
        .last()
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);
    format!(
        "{}... (truncated, original length: {})",
        &msg[..cut],
        msg.len()
    )
}

/// Per-metric aggregate result row (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub task_id: String,
    pub metric_type: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub median_latency: f64,
    pub p95_latency: f64,
    pub rps: f64,
    pub avg_content_length: f64,
}

/// LLM `token_metrics` row (§3): latency columns repurposed for custom
/// time-to-first-* metrics, per the result-table contract (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetricsRow {
    pub task_id: String,
    pub total_tps: f64,
    pub completion_tps: f64,
    pub avg_total_tokens_per_req: f64,
    pub avg_completion_tokens_per_req: f64,
    pub time_to_first_output_token: MetricSummary,
    pub time_to_first_reasoning_token: MetricSummary,
    pub time_to_reasoning_completion: MetricSummary,
    pub time_to_output_completion: MetricSummary,
    pub total_time: MetricSummary,
}

/// A 2-second real-time snapshot (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSample {
    pub task_id: String,
    pub timestamp: f64,
    pub current_users: u32,
    pub current_rps: f64,
    pub current_fail_per_sec: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub median_response_time: f64,
    pub p95_response_time: f64,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// An in-memory prompt queue element (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    pub prompt_text: String,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
}

/// A single metric observation (§3). Never persisted raw.
#[derive(Debug, Clone, Copy)]
pub struct MetricEvent {
    pub value_ms: f64,
    pub content_length: u64,
}

/// Aggregate summary computed from a metric series (§4.6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
}
