//! Structured logging setup and per-task log sinks.
//!
//! Engine-wide events go through `tracing`, while each claimed job additionally
//! gets an append-only file sink so its runner's stdout/stderr can be
//! correlated by `task-id` alone (§5 "Log sinks").

mod sink;

pub use sink::TaskLogSink;

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Call once at startup.
///
/// `json` selects JSON-formatted output (suited to log aggregation) over the
/// default human-readable format (suited to local development).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
