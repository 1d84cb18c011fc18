use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `level`. Returns
/// false when a subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}

/// Same as [`init_logging`] but writes to stderr, for plugin processes whose
/// stdout carries the handshake.
pub fn init_stderr_logging(level: &str) -> bool {
    fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .without_time()
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
