//! Telemetry and Observability
//!
//! Handles setting up `tracing-subscriber` for structured logging.
//! The subscriber is installed once; later calls only swap the level
//! filter, so the configured level can replace the bootstrap default.
//! Every assistant turn runs inside a `turn` span carrying the assistant,
//! chat and request ids.

use std::sync::OnceLock;
use tracing::Span;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Filter directives for `log_level`
///
/// Dependencies that log per request or per compiled module stay at `warn`.
pub fn filter_directives(log_level: &str) -> String {
    format!(
        "{0},atrium_engine={0},sqlx=warn,hyper=warn,reqwest=warn,wasmtime=warn,cranelift_codegen=warn",
        log_level
    )
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)))
}

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
///
/// In debug builds: pretty-printed terminal output on stderr.
/// In release builds: JSON structured output with spans.
pub fn init_telemetry_with_level(log_level: &str) {
    if let Some(handle) = FILTER.get() {
        if let Err(e) = handle.reload(env_filter(log_level)) {
            tracing::warn!("Failed to change log level to '{}': {}", log_level, e);
        }
        return;
    }

    let (filter, handle) = reload::Layer::new(env_filter(log_level));

    #[cfg(debug_assertions)]
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .pretty()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();

    #[cfg(not(debug_assertions))]
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr),
        )
        .try_init();

    if installed.is_ok() {
        let _ = FILTER.set(handle);
    }
}

/// Initialize the tracing subscriber with default settings.
///
/// Falls back to "info" level if no `RUST_LOG` env var is set.
/// Call `init_telemetry_with_level` again once config is available.
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}

/// Span covering one assistant turn
pub fn turn_span(assistant_id: &str, chat_id: &str, request_id: &str) -> Span {
    tracing::info_span!(
        "turn",
        assistant = %assistant_id,
        chat = %chat_id,
        request = %request_id,
    )
}
