//! Process-group spawning and signal-based control.
//!
//! [`spawn_group`] launches the command with `setpgid(0, 0)` via `pre_exec`
//! so the shell becomes a process group leader and `kill(-pgid, sig)` reaches
//! every descendant. [`GroupController`] owns the control state machine:
//!
//! ```text
//! starting → running ↔ paused
//!     \         \        /
//!      `────→ terminating → exited
//! ```
//!
//! `exited` is terminal. Signals that race process death (ESRCH) are treated
//! as success — the state machine, not the kernel, is the source of truth for
//! what the caller asked for.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::pty;

/// Lifecycle state of a spawned process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Starting,
    Running,
    Paused,
    Terminating,
    Exited,
}

impl ProcState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
            Self::Exited => "exited",
        }
    }
}

/// A control command addressed to the whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Pause,
    Resume,
    Cancel,
}

impl ControlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Cancel => "CANCEL",
        }
    }
}

impl std::str::FromStr for ControlKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "CANCEL" => Ok(Self::Cancel),
            _ => Err(()),
        }
    }
}

/// Errors from [`GroupController`] operations.
#[derive(Debug)]
pub enum ControlError {
    /// The control is not legal in the group's current state.
    InvalidState {
        control: ControlKind,
        state: ProcState,
    },
    /// The kernel rejected the signal for a reason other than ESRCH.
    SignalFailed(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState { control, state } => {
                write!(f, "{} not valid in state {}", control.as_str(), state.as_str())
            }
            Self::SignalFailed(e) => write!(f, "signal delivery failed: {e}"),
        }
    }
}

/// A freshly spawned process group with its output streams.
///
/// `stdout`/`stderr` are boxed because the transport differs between the
/// pipe (`stdbuf`) and PTY spawn paths.
pub struct Spawned {
    pub pid: u32,
    pub pgid: i32,
    pub child: Child,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

/// Locate `stdbuf` once per process. `None` means the PTY fallback is used.
fn stdbuf_path() -> Option<&'static str> {
    static STDBUF: OnceLock<Option<&'static str>> = OnceLock::new();
    *STDBUF.get_or_init(|| {
        ["/usr/bin/stdbuf", "/bin/stdbuf", "/usr/local/bin/stdbuf"]
            .into_iter()
            .find(|p| std::path::Path::new(p).exists())
    })
}

/// Spawn `<shell> -c <command>` as a new process group leader.
///
/// When `stdbuf` exists the child's stdio stays on pipes and the preloader
/// forces line buffering. Otherwise stdout and stderr are each wired to a
/// dedicated PTY slave, which makes `isatty()` true and line-buffers them
/// without merging the two streams.
///
/// The returned [`Child`] has `kill_on_drop(true)`, so dropping the handle
/// without a clean wait sends SIGKILL.
pub fn spawn_group(
    shell: &str,
    command: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Spawned> {
    if let Some(stdbuf) = stdbuf_path() {
        spawn_piped(stdbuf, shell, command, working_dir, env)
    } else {
        spawn_dual_pty(shell, command, working_dir, env)
    }
}

fn spawn_piped(
    stdbuf: &str,
    shell: &str,
    command: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Spawned> {
    let mut cmd = Command::new(stdbuf);
    cmd.args(["-oL", "-eL", shell, "-c", command])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout pipe missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr pipe missing"))?;

    Ok(Spawned {
        pid,
        pgid,
        child,
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
    })
}

fn spawn_dual_pty(
    shell: &str,
    command: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Spawned> {
    use std::os::fd::AsRawFd;

    let out_pty = pty::allocate_pty().map_err(std::io::Error::other)?;
    let err_pty = pty::allocate_pty().map_err(std::io::Error::other)?;
    let out_slave = out_pty.slave.as_raw_fd();
    let err_slave = err_pty.slave.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.args(["-c", command])
        .current_dir(working_dir)
        .kill_on_drop(true)
        // Stdio handled by pre_exec dup2, so no pipes from tokio.
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid/dup2/close are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            libc::setpgid(0, 0);
            if libc::dup2(out_slave, 1) == -1 || libc::dup2(err_slave, 2) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if out_slave > 2 {
                libc::close(out_slave);
            }
            if err_slave > 2 {
                libc::close(err_slave);
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;

    let stdout = pty::master_reader(&out_pty.master)?;
    let stderr = pty::master_reader(&err_pty.master)?;
    // Slaves (and original masters) drop here; the child holds its own slave
    // fds and the readers hold dup'd masters. When the child exits the
    // masters read EIO, which the drain loop treats as end of stream.

    Ok(Spawned {
        pid,
        pgid,
        child,
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
    })
}

/// Signal-based control over one process group.
///
/// Cloneable — all clones share the state machine. The controller never owns
/// the `Child` (the execution driver waits on it); it only addresses the
/// group by pgid.
#[derive(Clone, Debug)]
pub struct GroupController {
    pgid: i32,
    state: Arc<Mutex<ProcState>>,
    kill_grace: Duration,
    /// Fired (with a stored permit) when the group enters `terminating`, so
    /// the execution driver can start its drain grace without polling.
    terminating: Arc<Notify>,
}

impl GroupController {
    pub fn new(pgid: i32, kill_grace: Duration) -> Self {
        Self {
            pgid,
            state: Arc::new(Mutex::new(ProcState::Starting)),
            kill_grace,
            terminating: Arc::new(Notify::new()),
        }
    }

    /// Notify handle fired when the group enters `terminating`.
    pub fn terminating_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.terminating)
    }

    pub async fn state(&self) -> ProcState {
        *self.state.lock().await
    }

    /// Mark the group as running. Called once the driver is draining.
    pub async fn mark_running(&self) {
        let mut state = self.state.lock().await;
        if *state == ProcState::Starting {
            *state = ProcState::Running;
        }
    }

    /// Mark the group as exited. Called by the driver after `wait()` returns.
    pub async fn mark_exited(&self) {
        *self.state.lock().await = ProcState::Exited;
    }

    /// Apply a control command. Returns the resulting state.
    ///
    /// All three controls are idempotent: re-applying a control whose target
    /// state already holds succeeds without touching the process.
    pub async fn apply(&self, control: ControlKind) -> Result<ProcState, ControlError> {
        let mut state = self.state.lock().await;
        match (control, *state) {
            (ControlKind::Pause, ProcState::Running) => {
                self.signal(libc::SIGSTOP)?;
                *state = ProcState::Paused;
            }
            (ControlKind::Pause, ProcState::Paused) => {}
            (ControlKind::Resume, ProcState::Paused) => {
                self.signal(libc::SIGCONT)?;
                *state = ProcState::Running;
            }
            (ControlKind::Resume, ProcState::Running) => {}
            (ControlKind::Cancel, ProcState::Terminating | ProcState::Exited) => {}
            (ControlKind::Cancel, current) => {
                // A stopped group never handles SIGTERM; wake it first.
                if current == ProcState::Paused {
                    self.signal(libc::SIGCONT)?;
                }
                self.signal(libc::SIGTERM)?;
                *state = ProcState::Terminating;
                self.terminating.notify_one();
                self.spawn_kill_watchdog();
            }
            (control, current) => {
                return Err(ControlError::InvalidState {
                    control,
                    state: current,
                });
            }
        }
        Ok(*state)
    }

    /// SIGKILL the group after the grace period unless it exits first.
    fn spawn_kill_watchdog(&self) {
        let pgid = self.pgid;
        if pgid <= 0 {
            return;
        }
        let state = Arc::clone(&self.state);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if *state.lock().await != ProcState::Exited {
                warn!(
                    "pgid {pgid}: still alive {}s after SIGTERM, sending SIGKILL",
                    grace.as_secs()
                );
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        });
    }

    /// Deliver a signal to the whole group, swallowing ESRCH.
    fn signal(&self, signal: i32) -> Result<(), ControlError> {
        if self.pgid <= 0 {
            return Ok(());
        }
        let ret = unsafe { libc::kill(-self.pgid, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("pgid {}: signal {signal} raced process exit", self.pgid);
            return Ok(());
        }
        Err(ControlError::SignalFailed(format!(
            "kill(-{}, {signal}): {err}",
            self.pgid
        )))
    }

    /// Immediate SIGKILL to the group. Used by shutdown paths.
    pub fn kill_now(&self) {
        if self.pgid > 0 {
            unsafe {
                libc::kill(-self.pgid, libc::SIGKILL);
            }
        }
    }

    /// SIGTERM the group without entering the state machine. Used by the
    /// shutdown sweep which terminates all groups at once.
    pub fn term_now(&self) {
        if self.pgid > 0 {
            unsafe {
                libc::kill(-self.pgid, libc::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> GroupController {
        // pgid 0 makes every signal a no-op, leaving only the state machine.
        GroupController::new(0, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let ctl = controller();
        ctl.mark_running().await;
        assert_eq!(ctl.apply(ControlKind::Pause).await.unwrap(), ProcState::Paused);
        assert_eq!(ctl.apply(ControlKind::Resume).await.unwrap(), ProcState::Running);
    }

    #[tokio::test]
    async fn controls_are_idempotent() {
        let ctl = controller();
        ctl.mark_running().await;
        ctl.apply(ControlKind::Pause).await.unwrap();
        assert_eq!(ctl.apply(ControlKind::Pause).await.unwrap(), ProcState::Paused);
        ctl.apply(ControlKind::Cancel).await.unwrap();
        // CANCEL; CANCEL never raises.
        assert_eq!(
            ctl.apply(ControlKind::Cancel).await.unwrap(),
            ProcState::Terminating
        );
    }

    #[tokio::test]
    async fn pause_rejected_after_exit() {
        let ctl = controller();
        ctl.mark_running().await;
        ctl.mark_exited().await;
        let err = ctl.apply(ControlKind::Pause).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_valid_from_any_live_state() {
        let ctl = controller();
        // Cancel straight out of `starting`.
        assert_eq!(
            ctl.apply(ControlKind::Cancel).await.unwrap(),
            ProcState::Terminating
        );
    }

    #[tokio::test]
    async fn cancel_after_exit_is_noop_success() {
        let ctl = controller();
        ctl.mark_running().await;
        ctl.mark_exited().await;
        assert_eq!(ctl.apply(ControlKind::Cancel).await.unwrap(), ProcState::Exited);
    }

    #[test]
    fn control_kind_parses() {
        assert_eq!("PAUSE".parse::<ControlKind>(), Ok(ControlKind::Pause));
        assert_eq!("CANCEL".parse::<ControlKind>(), Ok(ControlKind::Cancel));
        assert!("pause".parse::<ControlKind>().is_err());
    }
}
