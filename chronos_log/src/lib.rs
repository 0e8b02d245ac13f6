use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging for binaries and tests.
/// `level` is the default filter; `CHRONOS_LOG` overrides it at runtime.
pub fn init(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_env("CHRONOS_LOG")
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

/// Like [`init`], but ignores an already-installed subscriber. Meant for
/// tests, where several cases race to install one.
pub fn try_init(level: Level) {
    let _ = init(level);
}
