//! Child-exit collection. The manager loop drains pending signals and asks
//! this module to reap every exited child without blocking.

use log::trace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// How a child ended. `success()` is what the service state machines care
/// about: clean exit 0 versus everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildTermination {
    Exit(i32),
    Signal(i32),
}

impl ChildTermination {
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exit(0))
    }
}

impl std::fmt::Display for ChildTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Reap all currently-exited children. Returns an empty vec when nothing
/// is waiting; never blocks.
pub fn drain_exited_children() -> Vec<(i32, ChildTermination)> {
    let mut exited = Vec::new();
    loop {
        match waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                trace!("child {pid} exited with code {code}");
                exited.push((pid.as_raw(), ChildTermination::Exit(code)));
            }
            Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                trace!("child {pid} killed by {signal}");
                exited.push((pid.as_raw(), ChildTermination::Signal(signal as i32)));
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => {
                // Stopped/continued children are not ours to track.
                continue;
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                trace!("waitpid failed: {e}");
                break;
            }
        }
    }
    exited
}
