//! Process execution capability.
//!
//! The manager never forks inline; everything that creates or signals a
//! process goes through the [`ProcessBroker`] owned by the manager. The
//! production broker uses the OS. Tests install a scripted broker so the
//! job engine can be driven deterministically without real children.

use std::collections::HashMap;
use std::path::PathBuf;

use log::trace;

use crate::fd_store::FdStore;
use crate::units::{Commandline, EnvVars, UnitId};

/// Why a spawned process belongs to a unit: its long-running main process
/// or a short-lived control helper (stop/reload/swapon commands).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidRole {
    Main,
    Control,
}

/// pid → owning unit and role. Owned by the manager, updated on spawn and
/// on SIGCHLD.
pub type PidTable = HashMap<i32, (UnitId, PidRole)>;

/// Everything beyond argv that shapes the child: environment, credentials,
/// working directory, and the listen fds whose ownership transfers to the
/// child (duped to fd 3 and up, announced via `LISTEN_FDS`).
#[derive(Clone, Debug, Default)]
pub struct ExecParams {
    pub env: EnvVars,
    pub user: Option<String>,
    pub group: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub inherit_fds: Vec<i32>,
}

#[derive(Debug)]
pub enum SpawnError {
    Io(std::io::Error),
    NoSuchUser(String),
    NoSuchGroup(String),
    NoSuchProcess(i32),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::NoSuchUser(name) => write!(f, "no such user: {name}"),
            Self::NoSuchGroup(name) => write!(f, "no such group: {name}"),
            Self::NoSuchProcess(pid) => write!(f, "no such process: {pid}"),
        }
    }
}

impl std::error::Error for SpawnError {}

pub trait ProcessBroker {
    fn spawn(&mut self, cmd: &Commandline, params: &ExecParams) -> Result<i32, SpawnError>;
    fn kill(&mut self, pid: i32, signal: i32) -> Result<(), SpawnError>;
}

/// Spawn and kill context handed to unit operations: routes through the
/// broker and keeps the pid table and fd store in sync.
pub struct ExecContext<'a> {
    pub broker: &'a mut dyn ProcessBroker,
    pub pids: &'a mut PidTable,
    pub fd_store: &'a mut FdStore,
}

impl ExecContext<'_> {
    pub fn spawn(
        &mut self,
        unit: &UnitId,
        role: PidRole,
        cmd: &Commandline,
        params: &ExecParams,
    ) -> Result<i32, SpawnError> {
        let pid = self.broker.spawn(cmd, params)?;
        trace!("{unit}: spawned {cmd} as pid {pid} ({role:?})");
        self.pids.insert(pid, (unit.clone(), role));
        Ok(pid)
    }

    pub fn kill(&mut self, pid: i32, signal: i32) -> Result<(), SpawnError> {
        self.broker.kill(pid, signal)
    }
}

/// The real broker: `std::process` for spawning, `nix` for credential
/// lookup and signalling.
#[derive(Default)]
pub struct OsProcessBroker;

impl ProcessBroker for OsProcessBroker {
    fn spawn(&mut self, cmd: &Commandline, params: &ExecParams) -> Result<i32, SpawnError> {
        use std::os::unix::process::CommandExt;

        let mut command = std::process::Command::new(&cmd.cmd);
        command.args(&cmd.args);
        for (key, value) in &params.env.vars {
            command.env(key, value);
        }
        if let Some(dir) = &params.working_directory {
            command.current_dir(dir);
        }

        if let Some(name) = &params.user {
            let user = nix::unistd::User::from_name(name)
                .map_err(|e| SpawnError::Io(e.into()))?
                .ok_or_else(|| SpawnError::NoSuchUser(name.clone()))?;
            command.uid(user.uid.as_raw());
            // A User= without Group= also switches to the user's primary
            // group.
            if params.group.is_none() {
                command.gid(user.gid.as_raw());
            }
        }
        if let Some(name) = &params.group {
            let group = nix::unistd::Group::from_name(name)
                .map_err(|e| SpawnError::Io(e.into()))?
                .ok_or_else(|| SpawnError::NoSuchGroup(name.clone()))?;
            command.gid(group.gid.as_raw());
        }

        if !params.inherit_fds.is_empty() {
            command.env("LISTEN_FDS", params.inherit_fds.len().to_string());
            let fds = params.inherit_fds.clone();
            unsafe {
                command.pre_exec(move || {
                    // Map the inherited fds to 3..N the way activated
                    // services expect them. dup2 clears close-on-exec on
                    // the duplicate, so the originals can stay flagged.
                    for (index, fd) in fds.iter().enumerate() {
                        let target = 3 + index as i32;
                        if *fd != target && libc::dup2(*fd, target) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(SpawnError::Io)?;
        Ok(child.id() as i32)
    }

    fn kill(&mut self, pid: i32, signal: i32) -> Result<(), SpawnError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = Signal::try_from(signal).map_err(|_| SpawnError::NoSuchProcess(pid))?;
        kill(Pid::from_raw(pid), signal).map_err(|_| SpawnError::NoSuchProcess(pid))
    }
}

/// Test broker: hands out fake pids and records every spawn and kill, so
/// scenario tests can observe the order of operations and deliver exits
/// whenever they choose. Spawns of a command whose program name is listed
/// in `refuse` fail synchronously. The log is shared so tests keep a
/// handle after the broker moves into the manager.
#[cfg(test)]
pub struct BrokerLog {
    next_pid: i32,
    pub spawned: Vec<(i32, Commandline)>,
    /// Listen fds each spawn was asked to hand over, by pid.
    pub inherited: Vec<(i32, Vec<i32>)>,
    pub killed: Vec<(i32, i32)>,
    pub refuse: Vec<String>,
}

#[cfg(test)]
impl Default for BrokerLog {
    fn default() -> Self {
        Self {
            next_pid: 100,
            spawned: Vec::new(),
            inherited: Vec::new(),
            killed: Vec::new(),
            refuse: Vec::new(),
        }
    }
}

#[cfg(test)]
impl BrokerLog {
    pub fn spawned_pid_of(&self, program: &str) -> Option<i32> {
        self.spawned
            .iter()
            .find(|(_, cmd)| cmd.cmd == program)
            .map(|(pid, _)| *pid)
    }

    pub fn inherited_fds_of(&self, pid: i32) -> Vec<i32> {
        self.inherited
            .iter()
            .find(|(spawned_pid, _)| *spawned_pid == pid)
            .map(|(_, fds)| fds.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub struct ScriptedBroker {
    pub log: std::rc::Rc<std::cell::RefCell<BrokerLog>>,
}

#[cfg(test)]
impl ProcessBroker for ScriptedBroker {
    fn spawn(&mut self, cmd: &Commandline, params: &ExecParams) -> Result<i32, SpawnError> {
        let mut log = self.log.borrow_mut();
        if log.refuse.contains(&cmd.cmd) {
            return Err(SpawnError::Io(std::io::Error::other(format!(
                "refusing to spawn {}",
                cmd.cmd
            ))));
        }
        let pid = log.next_pid;
        log.next_pid += 1;
        log.spawned.push((pid, cmd.clone()));
        log.inherited.push((pid, params.inherit_fds.clone()));
        Ok(pid)
    }

    fn kill(&mut self, pid: i32, signal: i32) -> Result<(), SpawnError> {
        self.log.borrow_mut().killed.push((pid, signal));
        Ok(())
    }
}
