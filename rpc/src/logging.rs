//! Structured logging setup.
//!
//! Builds one fmt layer from the logging settings and installs it behind an
//! `EnvFilter`. The RUST_LOG environment variable, when set, overrides the
//! configured level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber described by `config`.
pub fn init(config: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .map(|_| EnvFilter::from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let base = fmt::layer()
        .with_ansi(config.format != LogFormat::Json)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    // `json()`, `compact()`, and `without_time()` each change the layer's
    // concrete type, so the chosen combination is erased behind a box.
    let layer = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.boxed(),
        (LogFormat::Pretty, false) => base.without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
}
