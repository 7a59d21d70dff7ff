use tracing_subscriber::{EnvFilter, prelude::*};

const CRATES: [&str; 5] = ["services", "db", "executors", "local_deployment", "utils"];

pub fn filter_string(level: &str) -> String {
    let mut filter = String::from("warn");
    for krate in CRATES {
        filter.push_str(&format!(",{krate}={level}"));
    }
    filter
}

/// Install the global fmt subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(filter_string(&log_level))
        .unwrap_or_else(|_| EnvFilter::new(filter_string("info")));

    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init()
    {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}
