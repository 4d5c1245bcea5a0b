use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Map a `LOG_LEVEL` value onto a tracing filter directive.
///
/// Accepts `DEBUG`, `INFO`, `WARNING` (or `WARN`), `ERROR` and `CRITICAL`,
/// case-insensitively. `CRITICAL` maps to `error`.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

/// Filter from `RUST_LOG`, else `LOG_LEVEL`, else `info`.
pub fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| level_directive(&level))
        .unwrap_or("info");
    EnvFilter::new(directive)
}

/// Install the global fmt subscriber. Safe to call more than once; only the
/// first call installs anything.
pub fn init_logging() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    fmt()
        .with_env_filter(env_filter())
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
