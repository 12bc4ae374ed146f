//! Structured logging setup.
//!
//! Everything goes to stderr so stdout stays clean for command output.
//! `FOREMAN_LOG` (falling back to `RUST_LOG`) sets the filter, default `info`;
//! `FOREMAN_LOG_FORMAT=json` switches to one JSON object per line.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_ENV: &str = "FOREMAN_LOG";
const FORMAT_ENV: &str = "FOREMAN_LOG_FORMAT";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn json_requested() -> bool {
    std::env::var(FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init() {
    let json = json_requested();
    let plain_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
    });
    tracing_subscriber::registry()
        .with(filter())
        .with(plain_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
