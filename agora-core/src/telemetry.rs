//! Logging setup for binaries and demos

use tracing_subscriber::EnvFilter;

use crate::error::{AgoraError, Result};

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `info`
pub fn init_tracing() -> Result<()> {
    init_tracing_with("info")
}

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `default_filter`.
///
/// # Errors
///
/// Returns a configuration error if a global subscriber is already set.
pub fn init_tracing_with(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| AgoraError::Configuration(format!("Failed to install subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // the first call may lose to another test in the same binary
        let _ = init_tracing_with("debug");
        assert!(matches!(init_tracing(), Err(AgoraError::Configuration(_))));
    }
}
