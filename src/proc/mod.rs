//! Child-process spawning and process-group control.
//!
//! Every execution runs `<shell> -c "<command>"` in its **own process group**
//! so control signals reach the whole descendant tree:
//!
//! - PAUSE → SIGSTOP to `-pgid`
//! - RESUME → SIGCONT to `-pgid`
//! - CANCEL → SIGTERM to `-pgid`, then SIGKILL after a grace period
//!
//! Output is line-buffered at the child side to avoid the 64 KiB pipe-buffer
//! stall: when `stdbuf` is available the command is wrapped with `stdbuf -oL
//! -eL`; otherwise stdout and stderr are each connected to their own PTY
//! slave so libc switches to line buffering on its own.

pub mod group;
pub mod pty;

pub use group::{spawn_group, ControlError, ControlKind, GroupController, ProcState, Spawned};
