//! Logging utilities with idbkit segment prefixes.
//!
//! The engine crates only emit `tracing` events; applications call one of
//! these once at startup to see them.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with idbkit defaults.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (RUST_LOG)
/// - Compact format suitable for terminal output
pub fn init() {
    init_with_filter("info");
}

/// Initialize tracing with a custom default filter.
///
/// `RUST_LOG` still wins when set. Panics if a global subscriber is
/// already installed; use [`try_init_with_filter`] where that can happen.
pub fn init_with_filter(default_filter: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().compact())
        .init();
}

/// Like [`init_with_filter`], but returns false instead of panicking when a
/// subscriber is already installed (tests, embedding applications).
pub fn try_init_with_filter(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().compact())
        .try_init()
        .is_ok()
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// idbkit segment prefixes for logging.
pub mod prefix {
    /// Database operations prefix
    pub const DB: &str = "⊔";
    /// Startup prefix
    pub const OPEN: &str = "✿";
}
