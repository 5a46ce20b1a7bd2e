//! Error types for the stress engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Field-mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors (Job Store Gateway, §4.1).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool creation error: {0}")]
    PoolCreate(#[from] deadpool_postgres::CreatePoolError),
}

/// Errors tied to a specific job's lifecycle/state machine (§4.10, §3 invariant).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid configuration for job {job_id}: {reason}")]
    InvalidConfig { job_id: String, reason: String },

    #[error("illegal status transition for job {job_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        job_id: String,
        from: crate::models::JobStatus,
        to: crate::models::JobStatus,
    },

    #[error("subprocess for job {job_id} timed out after {0:?}", elapsed)]
    Timeout { job_id: String, elapsed: Duration },

    #[error("process launch failed for job {job_id}: {reason}")]
    LaunchFailed { job_id: String, reason: String },
}

/// Dataset Loader errors (§4.2).
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset content is not valid JSON or JSONL: {0}")]
    Parse(String),

    #[error("dataset produced no extractable prompt records")]
    Empty,
}

/// Field-Mapping Resolver errors (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("unknown API flavor: {0}")]
    UnknownFlavor(String),

    #[error("invalid JSON path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("custom field mapping is invalid JSON: {0}")]
    InvalidJson(String),
}

/// Request Builder / Response Processor errors (§4.4, §4.5).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP status {status}: {body_preview}")]
    HttpStatus { status: u16, body_preview: String },

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("stream framing error: {0}")]
    StreamFraming(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Process Supervisor errors (§4.9).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn runner process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to wait on runner process: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error("runner process group not found for task {0}")]
    GroupNotFound(String),

    #[error("result file missing or unreadable at {path}: {reason}")]
    ResultFileUnavailable { path: String, reason: String },
}
