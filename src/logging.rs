//! Structured logging setup for the supervisor.
//!
//! Environment variables:
//! - `LRPM_LOG`: filter directives (falls back to `RUST_LOG`, then `info`)
//! - `LRPM_LOG_JSON`: emit JSON lines instead of human-readable output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILTER_ENV: &str = "LRPM_LOG";
const JSON_ENV: &str = "LRPM_LOG_JSON";

/// Installs the global tracing subscriber, writing to stderr.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json_requested() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!("tracing initialized");
    }
}

fn json_requested() -> bool {
    std::env::var(JSON_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_json_flag_parsing() {
        std::env::set_var(JSON_ENV, "TRUE");
        assert!(json_requested());
        std::env::set_var(JSON_ENV, "0");
        assert!(!json_requested());
        std::env::remove_var(JSON_ENV);
        assert!(!json_requested());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_tracing();
        init_tracing();
    }
}
