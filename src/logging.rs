//! Logging setup for binaries and tests embedding the client
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the application.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Installs a stderr subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when the variable is unset
///
/// # Arguments
///
/// * `default_filter` - Filter directives, e.g. `"jpip_client=debug"`
///
/// # Errors
///
/// Fails if the directives do not parse or a global subscriber is already set.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| Error::Config(format!("bad log filter '{}': {}", default_filter, e)))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // the first call may race with other tests; only the second must fail
        let _ = init_logging("jpip_client=warn");
        assert!(init_logging("jpip_client=warn").is_err());
    }
}
