//! Log subscriber setup. Library crates log through the `log` facade, which
//! the subscriber picks up.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber on stderr. `level` wins over `RUST_LOG`;
/// the fallback is `info`.
pub fn init(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
