//! Optional structured trace log for relay lifecycle events.

use crate::config::RelayConfig;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;

const TRACE_LOG_ENV: &str = "PTYRELAY_TRACE_LOG";
/// Only relay events reach the trace file; dependency chatter is dropped.
const TRACE_TARGET: &str = env!("CARGO_CRATE_NAME");

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn tracing_log_path() -> PathBuf {
    env::var(TRACE_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("ptyrelay_trace.jsonl"))
}

/// Debug and above for relay modules, nothing from anywhere else.
pub(crate) fn relay_trace_filter() -> Targets {
    Targets::new().with_target(TRACE_TARGET, Level::DEBUG)
}

fn init_tracing_once(config: &RelayConfig, once: &OnceLock<()>) {
    if !config.logging_enabled() {
        return;
    }

    let _ = once.get_or_init(|| {
        let path = tracing_log_path();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(file)
            .with_ansi(false)
            .with_current_span(false)
            .with_span_list(false);
        let subscriber = tracing_subscriber::registry()
            .with(json_layer)
            .with(relay_trace_filter());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub(crate) fn init_tracing(config: &RelayConfig) {
    init_tracing_once(config, &TRACING_INIT);
}
