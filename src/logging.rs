//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Pick the filter directive: `RUST_LOG` wins, then `--verbose`, then the
/// configured level.
fn filter_directive(rust_log: Option<&str>, verbose: bool, configured: &str) -> String {
    match rust_log.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ if verbose => "debug".to_string(),
        _ => configured.to_string(),
    }
}

/// Install a stderr `fmt` subscriber. Stdout is reserved for JSON responses.
///
/// Calling this twice is harmless; the second install is ignored.
pub fn init(verbose: bool, configured_level: &str) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(rust_log.as_deref(), verbose, configured_level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
