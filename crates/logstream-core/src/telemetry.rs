//! Tracing setup shared by `logstreamd` and the `logstream` CLI.
//!
//! The filter is read from `LOGSTREAM_LOG`, falling back to `RUST_LOG` and
//! then to the level the binary asks for, so the daemon's verbosity can be
//! tuned without touching other Rust processes on the host.
//!
//! JSON lines carry the fields of the span they were emitted in. Poll loops
//! run inside [`crate::obs::stream_span`], so every poller event is tagged
//! with its `stream_key` even when the event itself does not name it.

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::format::{Format, Json, JsonFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "LOGSTREAM_LOG";

/// Install the global subscriber. Only the first call in a process has an
/// effect.
pub fn init_tracing(json: bool, level: Level) {
    let directives = filter_directives(level, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("ignoring invalid log filter {:?}: {}", directives, err);
        EnvFilter::new(level.as_str())
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(json_layer()).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    // A subscriber installed earlier (tests, embedding apps) stays in charge.
    drop(installed);
}

/// First non-blank value of `LOGSTREAM_LOG` or `RUST_LOG`, else `level`.
fn filter_directives(level: Level, var: impl Fn(&str) -> Option<String>) -> String {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|key| var(key))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| level.as_str().to_lowercase())
}

fn json_layer<S>() -> fmt::Layer<S, JsonFields, Format<Json>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .with_span_list(false)
}
