//! Library side of `ptyrelay`, shared by the binary and its tests.

pub mod config;
mod logging;
mod process_signal;
pub mod pty_relay;
mod telemetry;

pub use config::RelayConfig;
pub use logging::{init_logging, log_debug, log_debug_content, log_file_path};
pub use pty_relay::{run_supervisor, run_with_endpoints, RelayEndpoints};

/// Serializes tests that read or write process environment variables.
#[cfg(test)]
pub(crate) fn env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
