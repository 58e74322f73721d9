pub mod token_counter;

use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::protocol::event::TokenUsage;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (TRACE, DEBUG, INFO, ERROR)
///
/// `RUST_LOG`, when set, takes precedence over the config value.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(tracing_level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Log token usage for a completed request, computing duration from start time.
pub fn log_request_complete(
    model: &str,
    usage: &TokenUsage,
    estimated: bool,
    start_time: Instant,
    first_chunk: Option<Duration>,
) {
    token_counter::log_request_usage(model, usage, estimated, start_time.elapsed(), first_chunk);
}
