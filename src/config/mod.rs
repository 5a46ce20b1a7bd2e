//! Engine-wide configuration, resolved once from the environment at startup
//! (§9 "Singleton global config" design note — modeled as an immutable
//! struct passed by value rather than hidden process-wide state).

mod database;
mod engine;
mod helpers;

pub use database::DatabaseConfig;
pub use engine::{EngineConfig, HttpClientConfig};

use crate::error::ConfigError;

/// Top-level configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub http: HttpClientConfig,
}

impl Config {
    /// Resolves configuration from environment variables, loading a
    /// `.env` file first if present.
    pub fn resolve() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            engine: EngineConfig::resolve()?,
            http: HttpClientConfig::resolve()?,
        })
    }
}
