//! Process-wide tracing setup for binaries embedding a session. The library
//! itself only emits events; installing a subscriber is the host's call.

use crate::network::LogLevel;
use tracing_subscriber::{fmt, EnvFilter};

/// Set to `1` or `true` for one JSON object per line on stderr instead of the
/// pretty multi-line format.
pub const LOG_JSON_ENV: &str = "ELECTRUM_SESSION_LOG_JSON";

fn json_requested(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true"))
}

/// Install the process-wide subscriber. `RUST_LOG` wins over `default`, which
/// normally comes from `NetworkParameters::log_level`.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default.as_str()));
    let use_json = json_requested(std::env::var(LOG_JSON_ENV).ok().as_deref());

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .pretty()
            .with_writer(std::io::stderr)
            .try_init();
    }
}
