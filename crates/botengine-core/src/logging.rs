use tracing_subscriber::{fmt, EnvFilter};

use crate::{errors::Error, Result};

/// Initialize tracing for a BotEngine process.
///
/// Logs go to stderr: the panel uses stdout for its own view, and workers
/// inherit stderr from the panel so their output interleaves there.
pub fn init(service_name: &str) -> Result<()> {
    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,botengine=info,botengine_core=info,botengine_telegram=info,\
             botengine_whatsapp=info,botengine_openai=info,botengine_phishing=info,\
             {service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install log subscriber: {e}")))?;

    Ok(())
}
