//! Logging setup of the stresstest binary.

use std::env;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs a subscriber that writes logs to stderr, keeping stdout for the reports.
pub fn init_tracing() {
    let (level, env_filter) = parse_rust_log();
    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(level)))
        .with(env_filter)
        .init();
}

/// Reads `RUST_LOG` as a plain level or, failing that, as a full filter directive.
pub fn parse_rust_log() -> (Level, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => level,
            Err(_) => return (Level::TRACE, EnvFilter::new(value)),
        },
        Err(_) => Level::INFO,
    };

    // The most verbose level per crate, narrowed down to `level` by the format layer.
    let env_filter = EnvFilter::new(
        "WARN,\
        bulkwriter_service=TRACE,\
        stresstest=TRACE,\
        ",
    );

    (level, env_filter)
}
