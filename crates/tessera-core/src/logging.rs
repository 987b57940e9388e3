//! Logging and tracing initialization.
//!
//! Every session decision (issuance, denial, rotation, revocation, lockout)
//! is emitted as a structured `tracing` event in addition to its audit row.
//! Nothing is printed until a subscriber is installed with one of the
//! functions below.
//!
//! The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=tessera_core=debug,sqlx=warn tessera maintain
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with `info` as the default level.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level.
///
/// `RUST_LOG` still wins when it is set.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// Security events carry structured fields (`user_id`, `session_id`, `ip`)
/// that log aggregators can index directly.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Pick the format from the environment: JSON in production, plain text otherwise.
pub fn init_for_environment(environment: &str) {
    if environment == "production" {
        init_logging_json();
    } else {
        init_logging();
    }
}
