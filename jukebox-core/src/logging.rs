//! Tracing setup

use std::sync::Once;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Install the global subscriber, writing to stderr. Later calls are no-ops.
///
/// A non-empty `RUST_LOG` replaces our default filter entirely, including
/// the level picked by `verbose`.
pub fn init(verbose: bool) {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(build_filter(std::env::var("RUST_LOG").ok(), verbose))
            .with_writer(std::io::stderr)
            .init();
    });
}

fn build_filter(rust_log: Option<String>, verbose: bool) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty()) {
        match EnvFilter::try_new(&directives) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Ignoring invalid RUST_LOG {:?}: {}", directives, e),
        }
    }

    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    EnvFilter::new(format!("jukebox_core={level},jukebox={level}"))
}
