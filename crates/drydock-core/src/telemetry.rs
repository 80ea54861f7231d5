//! Tracing initialisation for the drydock binary.
//!
//! [`init_tracing`] installs the global subscriber once; later calls are
//! ignored because a process can only have one global subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `json` selects newline-delimited JSON output for log collectors. `level`
/// applies when `RUST_LOG` is unset. Logs go to stderr so stage commands can
/// print reports on stdout.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
