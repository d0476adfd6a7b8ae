use tracing_subscriber::EnvFilter;

/// Initialize tracing for the application.
///
/// `RUST_LOG` takes precedence over `default_level` when it is set. Uses
/// `try_init` so tests and libraries can call this repeatedly.
pub fn init(default_level: &str) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(lvl));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
