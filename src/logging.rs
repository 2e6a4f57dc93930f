//! Process-wide tracing setup. Only the binary calls this; the library never installs a
//! subscriber.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{BridgeError, Result};

/// Installs a fmt subscriber. `RUST_LOG` wins over `default_level` when set.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| BridgeError::Config(format!("invalid log level {default_level:?}: {e}")))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logging already initialised: {e}")))
}
