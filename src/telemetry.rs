//! Telemetry initialization.
//!
//! Controlled by `SHARD_MERGE_LOG`:
//! - unset or `"text"` → human-readable events to stderr
//! - `"json"` → JSON spans/events to stderr
//! - `"off"` → no subscriber (tracing disabled)
//!
//! The level filter comes from `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable selecting the log output.
pub const LOG_FORMAT_ENV: &str = "SHARD_MERGE_LOG";

/// Output selected by [`LOG_FORMAT_ENV`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
    Off,
}

impl LogFormat {
    /// Parse the value of [`LOG_FORMAT_ENV`]. Unrecognised values fall back
    /// to text with a warning on stderr.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("" | "text") => Self::Text,
            Some("json") => Self::Json,
            Some("off") => Self::Off,
            Some(other) => {
                eprintln!("warning: {LOG_FORMAT_ENV}={other} is not one of text, json, off; using text");
                Self::Text
            }
        }
    }
}

/// Initialize telemetry based on `SHARD_MERGE_LOG` and `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let format = LogFormat::from_env_value(std::env::var(LOG_FORMAT_ENV).ok().as_deref());
    match format {
        LogFormat::Off => {}
        LogFormat::Text => init_text(),
        LogFormat::Json => init_json(),
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_text() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

/// JSON spans/events to stderr via tracing-subscriber's JSON formatter.
fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
        )
        .try_init();
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn format_from_env_value() {
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("")), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some(" off ")), LogFormat::Off);
        assert_eq!(LogFormat::from_env_value(Some("yaml")), LogFormat::Text);
    }
}
