//! Relay configuration so the fixed invocation stays overridable for diagnostics and tests.

use anyhow::{anyhow, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::time::Duration;

pub const DEFAULT_COMMAND: &str = "claude";
pub const DEFAULT_COMMAND_ARGS: &str = "auth login";
/// Minimal terminal type so the wrapped CLI skips cursor-addressed rendering.
pub const DEFAULT_TERM: &str = "dumb";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const MIN_POLL_INTERVAL_MS: u64 = 50;
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_EXIT_GRACE_MS: u64 = 500;
pub const DEFAULT_KILL_GRACE_MS: u64 = 3000;

/// Variable marking a nested automated session; never handed to the child.
pub const NESTED_SESSION_ENV: &str = "CLAUDECODE";
pub const TERM_ENV: &str = "TERM";

/// Runtime options for the relay supervisor.
///
/// Every option is hidden from `--help`: the supported invocation takes no flags.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ptyrelay",
    about = "Run a terminal-only CLI under a pseudo-terminal and relay it over stdio",
    version
)]
pub struct RelayConfig {
    /// Program launched inside the pseudo-terminal
    #[arg(long, env = "PTYRELAY_COMMAND", default_value = DEFAULT_COMMAND, hide = true)]
    pub command: String,

    /// Arguments for the program, split with shell quoting rules
    #[arg(
        long,
        env = "PTYRELAY_ARGS",
        default_value = DEFAULT_COMMAND_ARGS,
        allow_hyphen_values = true,
        hide = true
    )]
    pub command_args: String,

    /// TERM value exported to the child
    #[arg(long, env = "PTYRELAY_TERM", default_value = DEFAULT_TERM, hide = true)]
    pub term: String,

    /// Upper bound on one multiplexed wait before re-checking the child
    #[arg(
        long,
        env = "PTYRELAY_POLL_MS",
        default_value_t = DEFAULT_POLL_INTERVAL_MS,
        value_parser = clap::value_parser!(u64).range(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS),
        hide = true
    )]
    pub poll_interval_ms: u64,

    /// Time a child gets to exit on its own after its terminal closed
    #[arg(long, env = "PTYRELAY_EXIT_GRACE_MS", default_value_t = DEFAULT_EXIT_GRACE_MS, hide = true)]
    pub exit_grace_ms: u64,

    /// Time between SIGTERM and SIGKILL during shutdown
    #[arg(long, env = "PTYRELAY_KILL_GRACE_MS", default_value_t = DEFAULT_KILL_GRACE_MS, hide = true)]
    pub kill_grace_ms: u64,

    /// Enable debug logging to a temp file
    #[arg(
        long,
        env = "PTYRELAY_LOGS",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        hide = true
    )]
    pub logs: bool,

    /// Disable all logging (overrides --logs)
    #[arg(
        long,
        env = "PTYRELAY_NO_LOGS",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        hide = true
    )]
    pub no_logs: bool,

    /// Allow relayed bytes to appear in debug logs
    #[arg(
        long,
        env = "PTYRELAY_LOG_CONTENT",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        hide = true
    )]
    pub log_content: bool,
}

impl RelayConfig {
    /// Split `command_args` the way a POSIX shell would.
    ///
    /// # Errors
    ///
    /// Returns an error when quoting is unbalanced.
    pub fn resolved_args(&self) -> Result<Vec<String>> {
        shell_words::split(&self.command_args)
            .map_err(|err| anyhow!("invalid command arguments {:?}: {err}", self.command_args))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    #[must_use]
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    #[must_use]
    pub fn logging_enabled(&self) -> bool {
        self.logs && !self.no_logs
    }
}
