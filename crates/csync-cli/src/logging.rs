use tracing_subscriber::EnvFilter;

const CSYNC_TARGETS: [&str; 5] = [
    "csync",
    "csync_core",
    "csync_storage",
    "csync_sources",
    "csync_sync",
];

/// `--log-level` covers the csync crates only; sqlx, reqwest and the scheduler stay at `warn`.
fn default_directives(log_level: &str) -> String {
    let mut directives = String::from("warn");
    for target in CSYNC_TARGETS {
        directives.push_str(&format!(",{target}={log_level}"));
    }
    directives
}

/// Logs go to stderr so the per-entity summary lines own stdout. A set `RUST_LOG` replaces the
/// csync defaults entirely.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
