//! Structured logging bootstrap.
//!
//! Initializes the global `tracing` subscriber once, early in `main`.
//! The `RUST_LOG` environment variable overrides the default filter
//! using the usual `tracing_subscriber::EnvFilter` directives, e.g.
//! `RUST_LOG=cryptopuff_node=debug,cryptopuff_protocol=info`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. Call exactly once.
pub fn init(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}
