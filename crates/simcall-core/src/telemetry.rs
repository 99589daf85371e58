//! Tracing setup for simcall binaries.
//!
//! Logs go to stderr so that stdout stays free for results.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter: `level` for simcall crates, warnings for everything else.
fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::new(format!(
        "warn,simcall_core={lvl},simcall={lvl}",
        lvl = level.as_str().to_ascii_lowercase()
    ))
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `level` when set. With `json`, one JSON object is
/// written per event. Only the first call in a process has an effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::DEBUG);
        init_tracing(true, Level::INFO);
        tracing::info!("still logging");
    }
}
