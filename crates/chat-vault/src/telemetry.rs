use tracing_subscriber::{fmt, EnvFilter};

/// Directives used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,tower_http=info,r2d2=warn";

/// Installs the global fmt subscriber. Calling it twice is harmless; the
/// second install is ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
