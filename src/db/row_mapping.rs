//! Conversions between PostgreSQL rows and the in-memory job model.
//!
//! Kept separate from the query code so the SQL-facing and domain-facing
//! halves of the gateway can be reviewed independently, mirroring the
//! teacher's split between `Store` (raw SQL) and its typed record structs
//! (`src/history/store.rs`).

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::DatabaseError;
use crate::models::{
    ApiFlavor, ChatType, HttpMethod, JobStatus, LlmExtras, LoadConfig,
};

#[cfg(feature = "postgres")]
pub fn method_from_str(s: &str) -> HttpMethod {
    match s.to_uppercase().as_str() {
        "GET" => HttpMethod::Get,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        "PATCH" => HttpMethod::Patch,
        _ => HttpMethod::Post,
    }
}

#[cfg(feature = "postgres")]
pub fn parse_headers_or_cookies(raw: Option<&str>) -> HashMap<String, String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

#[cfg(feature = "postgres")]
pub fn load_config_from_row(
    load_mode: &str,
    users: Option<i32>,
    spawn_rate: Option<f64>,
    duration_seconds: Option<i32>,
    step_start_users: Option<i32>,
    step_increment: Option<i32>,
    step_duration: Option<i32>,
    step_max_users: Option<i32>,
    step_sustain_duration: Option<i32>,
) -> LoadConfig {
    if load_mode == "stepped" {
        LoadConfig::Stepped {
            start_users: step_start_users.unwrap_or(1) as u32,
            increment: step_increment.unwrap_or(1) as u32,
            step_duration: step_duration.unwrap_or(60) as u64,
            max_users: step_max_users.unwrap_or(1) as u32,
            sustain_duration: step_sustain_duration.unwrap_or(0) as u64,
        }
    } else {
        LoadConfig::Fixed {
            users: users.unwrap_or(1) as u32,
            spawn_rate: spawn_rate.unwrap_or(1.0),
            duration_seconds: duration_seconds.unwrap_or(60) as u64,
        }
    }
}

#[cfg(feature = "postgres")]
#[allow(clippy::too_many_arguments)]
pub fn llm_extras_from_row(
    model: Option<String>,
    api_type: Option<String>,
    stream_mode: Option<bool>,
    chat_type: Option<i32>,
    field_mapping: Option<String>,
    warmup_enabled: Option<bool>,
    warmup_duration: Option<i32>,
) -> Option<LlmExtras> {
    let model = model?;
    let api_flavor = api_type
        .as_deref()
        .and_then(|s| ApiFlavor::from_str(s).ok())
        .unwrap_or(ApiFlavor::OpenaiChat);
    Some(LlmExtras {
        model,
        api_flavor,
        stream_mode: stream_mode.unwrap_or(false),
        chat_type: ChatType::from_u8(chat_type.unwrap_or(0) as u8),
        field_mapping: field_mapping.and_then(|s| serde_json::from_str(&s).ok()),
        warmup_enabled: warmup_enabled.unwrap_or(false),
        warmup_duration_secs: warmup_duration.unwrap_or(120) as u64,
    })
}

pub fn status_from_db(s: &str) -> Result<JobStatus, DatabaseError> {
    JobStatus::from_str(s).map_err(DatabaseError::Query)
}
