//! Tracing subscriber setup driven by the orca verbosity scale.

use tracing_subscriber::EnvFilter;

/// Map an orca verbosity level to a default filter directive.
pub fn level_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        v if v <= -3 => "off",
        -2 | -1 => "warn",
        0 => "info",
        _ => "debug",
    }
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `verbosity`. Calling this more than once
/// is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(verbosity: i32, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
