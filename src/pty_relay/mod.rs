//! PTY relay supervisor: runs a terminal-only CLI on a pseudo-terminal and
//! shuttles bytes between it and our own stdio pipes.

mod child;
mod io;
mod launch;
mod pty;
mod relay;
mod signals;
mod spawn;
mod supervisor;

pub use child::{exit_code_for, ABNORMAL_EXIT_CODE};
pub use relay::{RelayEndpoints, RelayExit, RelayOutcome, RelayPhase, RelayState};
pub use supervisor::{run_supervisor, run_with_endpoints, SupervisorOptions};
