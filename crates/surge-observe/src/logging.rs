use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `SURGE_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for surge binaries:
/// - Always include `mode` on pipeline lifecycle events.
/// - Include `worker` on any event emitted from a worker loop.
/// - Include `messages` on write/flush events (the number of payloads the write covered).
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SURGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
