//! Logging setup for hosts that embed mirrorkeep

/// Install a `tracing` subscriber. `RUST_LOG` wins over `verbose`.
///
/// Returns `false` when the host already installed a global subscriber, which is left in place.
pub fn init(verbose: bool) -> bool {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mirrorkeep={log_level}").into()),
        )
        .with_target(false)
        .try_init()
        .is_ok()
}
