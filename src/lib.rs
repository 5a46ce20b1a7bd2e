//! LMeterX-style distributed load-testing engine: claims jobs from a
//! Postgres-backed queue, supervises a runner subprocess per job, and
//! persists per-endpoint and LLM-specific metrics.

pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod json_path;
pub mod mapping;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod supervisor;
pub mod swarm;

pub use error::Error;
