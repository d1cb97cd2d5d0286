use crate::error::{PersistError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber with the given filter directive
/// (e.g. `"info"` or `"modelgraph=debug"`). Fails if a subscriber is
/// already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| PersistError::InvalidArgument(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| PersistError::InvalidArgument("logging already initialized".into()))
}
