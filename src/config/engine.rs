//! Engine-wide timing and HTTP client configuration (§5, §6, §7).

use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Timing knobs for the poller, supervisor and pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between `claim_next_pending` polls.
    pub poll_interval: Duration,
    /// Interval between scans of `stopping` rows (§4.10).
    pub stop_poll_interval: Duration,
    /// Grace period after SIGTERM before SIGKILL (§4.10, §4.9 step 5).
    pub kill_grace: Duration,
    /// Extra buffer added to `duration + stop_timeout` before the
    /// supervisor treats a run as orphaned (§5, §6).
    pub timeout_buffer: Duration,
    /// Default warmup duration when a job omits the column (§4.10, Open Question).
    pub default_warmup_secs: u64,
    /// Sleep after warmup completes, before the main run starts (§4.10 step 2).
    pub post_warmup_settle: Duration,
    /// Real-time sampler tick interval (§4.8).
    pub sample_interval: Duration,
    /// Stop-timeout applied to LLM jobs (§5).
    pub llm_stop_timeout_secs: u64,
    /// Stop-timeout applied to warmup runs (§5).
    pub warmup_stop_timeout_secs: u64,
}

impl EngineConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            poll_interval: Duration::from_secs(parse_optional_env("POLL_INTERVAL_SECS", 2u64)?),
            stop_poll_interval: Duration::from_secs(parse_optional_env(
                "STOP_POLL_INTERVAL_SECS",
                5u64,
            )?),
            kill_grace: Duration::from_secs(parse_optional_env("KILL_GRACE_SECS", 10u64)?),
            timeout_buffer: Duration::from_secs(parse_optional_env("TIMEOUT_BUFFER_SECS", 30u64)?),
            default_warmup_secs: parse_optional_env("DEFAULT_WARMUP_SECS", 120u64)?,
            post_warmup_settle: Duration::from_secs(parse_optional_env(
                "POST_WARMUP_SETTLE_SECS",
                3u64,
            )?),
            sample_interval: Duration::from_secs(parse_optional_env("SAMPLE_INTERVAL_SECS", 2u64)?),
            llm_stop_timeout_secs: parse_optional_env("LLM_STOP_TIMEOUT_SECS", 99u64)?,
            warmup_stop_timeout_secs: parse_optional_env("WARMUP_STOP_TIMEOUT_SECS", 10u64)?,
        })
    }
}

/// HTTP client timeouts for requests issued against the target endpoint (§5).
#[derive(Debug, Clone, Copy)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpClientConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            connect_timeout: Duration::from_secs(parse_optional_env(
                "HTTP_CONNECT_TIMEOUT_SECS",
                default.connect_timeout.as_secs(),
            )?),
            read_timeout: Duration::from_secs(parse_optional_env(
                "HTTP_READ_TIMEOUT_SECS",
                default.read_timeout.as_secs(),
            )?),
            pool_idle_timeout: Duration::from_secs(parse_optional_env(
                "HTTP_POOL_IDLE_TIMEOUT_SECS",
                default.pool_idle_timeout.as_secs(),
            )?),
        })
    }
}
