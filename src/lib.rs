//! 123 Cloud open-platform client
//!
//! Resumable chunked uploads, cursor-paginated listing, credentials shared
//! between mounts of the same account, and duplicate cleanup after move and
//! rename. `providers::Open123Provider` is the entry point.

pub mod cloud_config;
pub mod offline;
pub mod providers;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .try_init();
}
