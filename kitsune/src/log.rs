use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`).
///
/// `log` records from dependencies are forwarded as well.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        tracing::warn!("logging already initialized: {e}");
    }
}
