//! PTY plumbing for the no-`stdbuf` fallback.
//!
//! Uses the `nix` crate for POSIX PTY APIs. One PTY pair is allocated per
//! output stream so stdout and stderr stay distinct; the child only needs
//! `isatty()` to return true for libc to line-buffer, it never uses the PTYs
//! as a controlling terminal.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{self, OutputFlags, SetArg, Termios};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair. Window size is irrelevant here — the slave is only a
/// line-buffering device, never an interactive terminal.
///
/// ONLCR is cleared on the slave so the child's `\n` arrives as `\n`, not
/// `\r\n`; output bytes must match what the pipe path would deliver.
pub fn allocate_pty() -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(None::<&Winsize>, None::<&Termios>)?;
    let mut attrs = termios::tcgetattr(&slave)?;
    attrs.output_flags.remove(OutputFlags::ONLCR);
    termios::tcsetattr(&slave, SetArg::TCSANOW, &attrs)?;
    Ok(PtyPair { master, slave })
}

/// Turn a PTY master into an async reader.
///
/// The fd is dup'd so the returned `File` owns its descriptor independently
/// of the original `OwnedFd` (which the caller drops after spawn).
pub fn master_reader(master: &OwnedFd) -> std::io::Result<tokio::fs::File> {
    let raw: RawFd = master.as_raw_fd();
    let dup: RawFd = unsafe { libc::dup(raw) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: we own `dup` — it was just created and is transferred here.
    let file = unsafe { std::fs::File::from_raw_fd(dup) };
    Ok(tokio::fs::File::from_std(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn allocate_yields_distinct_fds() {
        let pair = allocate_pty().unwrap();
        assert_ne!(pair.master.as_raw_fd(), pair.slave.as_raw_fd());
    }

    #[test]
    fn master_reader_dups_the_fd() {
        let pair = allocate_pty().unwrap();
        let reader = master_reader(&pair.master).unwrap();
        drop(reader);
        // Original master must still be usable after the dup is closed.
        let again = master_reader(&pair.master).unwrap();
        drop(again);
    }
}
