use crate::Result;

/// Initialize structured logging for the bridge.
///
/// Default filter is `info` for our own crates and `warn` elsewhere; override
/// with `RUST_LOG`.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,ctb=info,ctb_core=info,ctb_agent_cli=info,ctb_store_sqlite=info,ctb_telegram=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();

    Ok(())
}
