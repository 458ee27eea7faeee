//! Logging setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rls_common::config::LoggingConfig;
use rls_common::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Audit events are
/// logged under the `rls::audit` target.
///
/// # Errors
/// Returns `InternalError` if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (plain, json) = if config.json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| Error::InternalError(e.to_string()))
}
