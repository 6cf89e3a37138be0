pub mod alerts;
pub mod config;
pub mod db;
pub mod error;
pub mod session;
pub mod state;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the process-wide subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
