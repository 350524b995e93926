//! Relay a terminal-only CLI over plain stdio pipes.
//!
//! Runs `claude auth login` under a pseudo-terminal, forwards our stdin to it,
//! copies its terminal output to our stdout, and exits with its exit code.

use clap::Parser;
use ptyrelay::{init_logging, log_debug, run_supervisor, RelayConfig};

fn main() {
    let config = RelayConfig::parse();
    init_logging(&config);
    log_debug(&format!(
        "ptyrelay {} starting: {} {}",
        env!("CARGO_PKG_VERSION"),
        config.command,
        config.command_args
    ));
    let code = run_supervisor(&config);
    std::process::exit(code);
}
