//! Tracing subscriber setup for the `qa` binary.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! `[logging].level`. Logs go to stderr so streamed answers on stdout stay
//! clean.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,qa_harness={0},qa_harness_core={0}",
            config.level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // Already installed (tests, embedding apps): keep the existing one.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
