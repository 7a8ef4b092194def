use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::{trace, warn};

use crate::broker::{ExecContext, ExecParams, PidRole};
use crate::conditions::Condition;
use crate::fd_store::FdRole;
use crate::sockets;
use crate::units::{ActiveState, Dependencies, LoadState, UnitId, UnitIdKind};

/// A unit has a common part shared by every type (names, dependencies,
/// conditions, the installed job) and a type-specific part carrying the
/// type's configuration and mutable state machine.
#[derive(Debug)]
pub struct Unit {
    pub id: UnitId,
    /// All names resolving to this unit, including `id.name`.
    pub names: BTreeSet<String>,
    pub load_state: LoadState,
    pub fragment_path: Option<PathBuf>,
    pub fragment_mtime: Option<SystemTime>,
    pub description: String,
    pub documentation: Vec<String>,
    pub conditions: Vec<Condition>,
    pub dependencies: Dependencies,
    pub config: UnitConfig,
    /// The single installed job for this unit, if any.
    pub job: Option<u32>,
    pub specific: Specific,
}

/// Knobs from the `[Unit]` section that apply to every type.
#[derive(Clone, Debug)]
pub struct UnitConfig {
    pub default_dependencies: bool,
    pub allow_isolate: bool,
    pub ignore_on_isolate: bool,
    pub refuse_manual_start: bool,
    pub refuse_manual_stop: bool,
    pub stop_when_unneeded: bool,
    pub job_timeout: Option<Duration>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            default_dependencies: true,
            allow_isolate: false,
            ignore_on_isolate: false,
            refuse_manual_start: false,
            refuse_manual_stop: false,
            stop_when_unneeded: false,
            job_timeout: None,
        }
    }
}

/// A single executable invocation: program plus argv tail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commandline {
    pub cmd: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for Commandline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cmd)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvVars {
    pub vars: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct UnitOpError {
    pub unit: UnitId,
    pub reason: UnitOpErrorReason,
}

#[derive(Clone, Debug)]
pub enum UnitOpErrorReason {
    SpawnFailed(String),
    KillFailed(String),
    SocketOpenError(String),
    SocketCloseError(String),
    MountError(String),
    MissingExecutable(&'static str),
    OperationNotSupported(&'static str),
}

impl std::fmt::Display for UnitOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            UnitOpErrorReason::SpawnFailed(e) => {
                write!(f, "{}: failed to spawn process: {}", self.unit, e)
            }
            UnitOpErrorReason::KillFailed(e) => {
                write!(f, "{}: failed to signal process: {}", self.unit, e)
            }
            UnitOpErrorReason::SocketOpenError(e) => {
                write!(f, "{}: failed to open sockets: {}", self.unit, e)
            }
            UnitOpErrorReason::SocketCloseError(e) => {
                write!(f, "{}: failed to close sockets: {}", self.unit, e)
            }
            UnitOpErrorReason::MountError(e) => {
                write!(f, "{}: mount operation failed: {}", self.unit, e)
            }
            UnitOpErrorReason::MissingExecutable(which) => {
                write!(f, "{}: no {} command configured", self.unit, which)
            }
            UnitOpErrorReason::OperationNotSupported(op) => {
                write!(f, "{}: operation {} not supported for this unit type", self.unit, op)
            }
        }
    }
}

impl std::error::Error for UnitOpError {}

/// Type-specific configuration and state.
#[derive(Debug)]
pub enum Specific {
    Service(ServiceSpecific),
    Socket(SocketSpecific),
    Target(TargetSpecific),
    Device(DeviceSpecific),
    Mount(MountSpecific),
    Automount(AutomountSpecific),
    Timer(TimerSpecific),
    Path(PathSpecific),
    Snapshot(SnapshotSpecific),
    Swap(SwapSpecific),
}

impl Specific {
    pub fn empty_for(kind: UnitIdKind) -> Self {
        match kind {
            UnitIdKind::Service => Self::Service(ServiceSpecific::default()),
            UnitIdKind::Socket => Self::Socket(SocketSpecific::default()),
            UnitIdKind::Target => Self::Target(TargetSpecific::default()),
            UnitIdKind::Device => Self::Device(DeviceSpecific::default()),
            UnitIdKind::Mount => Self::Mount(MountSpecific::default()),
            UnitIdKind::Automount => Self::Automount(AutomountSpecific::default()),
            UnitIdKind::Timer => Self::Timer(TimerSpecific::default()),
            UnitIdKind::Path => Self::Path(PathSpecific::default()),
            UnitIdKind::Snapshot => Self::Snapshot(SnapshotSpecific::default()),
            UnitIdKind::Swap => Self::Swap(SwapSpecific::default()),
        }
    }
}

// ── Service ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServiceType {
    #[default]
    Simple,
    Oneshot,
}

#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub service_type: ServiceType,
    pub exec_start: Option<Commandline>,
    pub exec_stop: Option<Commandline>,
    pub exec_reload: Option<Commandline>,
    pub remain_after_exit: bool,
    pub environment: EnvVars,
    pub user: Option<String>,
    pub group: Option<String>,
    pub nice: Option<i8>,
    pub oom_score_adjust: Option<i32>,
    pub working_directory: Option<PathBuf>,
    /// Socket units whose listen fds this service receives on start
    /// (`Sockets=`).
    pub sockets: Vec<UnitId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServiceSub {
    #[default]
    Dead,
    Start,
    Running,
    Exited,
    Reload,
    StopSigterm,
    StopSigkill,
    Failed,
}

impl ServiceSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Start => "start",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Reload => "reload",
            Self::StopSigterm => "stop-sigterm",
            Self::StopSigkill => "stop-sigkill",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(Self::Dead),
            "start" => Some(Self::Start),
            "running" => Some(Self::Running),
            "exited" => Some(Self::Exited),
            "reload" => Some(Self::Reload),
            "stop-sigterm" => Some(Self::StopSigterm),
            "stop-sigkill" => Some(Self::StopSigkill),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceSpecific {
    pub conf: ServiceConfig,
    pub sub: ServiceSub,
    pub main_pid: Option<i32>,
    pub control_pid: Option<i32>,
}

impl ServiceSpecific {
    const fn active_state(&self) -> ActiveState {
        match self.sub {
            ServiceSub::Dead => ActiveState::Inactive,
            ServiceSub::Start => ActiveState::Activating,
            ServiceSub::Running | ServiceSub::Exited => ActiveState::Active,
            ServiceSub::Reload => ActiveState::Reloading,
            ServiceSub::StopSigterm | ServiceSub::StopSigkill => ActiveState::Deactivating,
            ServiceSub::Failed => ActiveState::Failed,
        }
    }

    /// Spawn parameters for the main process, including the listen fds of
    /// the socket units this service is activated by.
    fn main_params(&self, ctx: &ExecContext) -> ExecParams {
        ExecParams {
            env: self.conf.environment.clone(),
            user: self.conf.user.clone(),
            group: self.conf.group.clone(),
            working_directory: self.conf.working_directory.clone(),
            inherit_fds: self
                .conf
                .sockets
                .iter()
                .flat_map(|socket| ctx.fd_store.listen_fds_of(socket))
                .collect(),
        }
    }

    /// Spawn parameters for control helpers (stop/reload commands); no
    /// listen fds change hands.
    fn control_params(&self) -> ExecParams {
        ExecParams {
            env: self.conf.environment.clone(),
            user: self.conf.user.clone(),
            group: self.conf.group.clone(),
            working_directory: self.conf.working_directory.clone(),
            inherit_fds: Vec::new(),
        }
    }

    fn start(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        let Some(cmd) = self.conf.exec_start.clone() else {
            self.sub = ServiceSub::Failed;
            return Err(UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::MissingExecutable("ExecStart"),
            });
        };

        let params = self.main_params(ctx);
        let pid = ctx.spawn(id, PidRole::Main, &cmd, &params).map_err(|e| {
            self.sub = ServiceSub::Failed;
            UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::SpawnFailed(e.to_string()),
            }
        })?;

        self.main_pid = Some(pid);
        self.sub = match self.conf.service_type {
            // A simple service counts as running as soon as the main
            // process exists.
            ServiceType::Simple => ServiceSub::Running,
            // A oneshot service is activating until the process exits.
            ServiceType::Oneshot => ServiceSub::Start,
        };
        Ok(())
    }

    fn stop(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        if let Some(cmd) = self.conf.exec_stop.clone() {
            let params = self.control_params();
            match ctx.spawn(id, PidRole::Control, &cmd, &params) {
                Ok(pid) => {
                    self.control_pid = Some(pid);
                    self.sub = ServiceSub::StopSigterm;
                    return Ok(());
                }
                Err(e) => {
                    warn!("{id}: ExecStop failed to spawn ({e}), falling back to SIGTERM");
                }
            }
        }

        match self.main_pid {
            Some(pid) => {
                ctx.kill(pid, libc::SIGTERM).map_err(|e| UnitOpError {
                    unit: id.clone(),
                    reason: UnitOpErrorReason::KillFailed(e.to_string()),
                })?;
                self.sub = ServiceSub::StopSigterm;
            }
            None => {
                self.sub = ServiceSub::Dead;
            }
        }
        Ok(())
    }

    fn reload(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        let Some(cmd) = self.conf.exec_reload.clone() else {
            return Err(UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::MissingExecutable("ExecReload"),
            });
        };
        let params = self.control_params();
        let pid = ctx
            .spawn(id, PidRole::Control, &cmd, &params)
            .map_err(|e| UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::SpawnFailed(e.to_string()),
            })?;
        self.control_pid = Some(pid);
        self.sub = ServiceSub::Reload;
        Ok(())
    }

    fn escalate_stop(&mut self, id: &UnitId, ctx: &mut ExecContext) {
        if let Some(pid) = self.main_pid {
            if ctx.kill(pid, libc::SIGKILL).is_err() {
                trace!("{id}: SIGKILL target already gone");
            }
            self.sub = ServiceSub::StopSigkill;
        } else {
            self.sub = ServiceSub::Dead;
        }
    }

    fn notify_exited(&mut self, id: &UnitId, role: PidRole, success: bool, ctx: &mut ExecContext) {
        match role {
            PidRole::Main => self.main_pid = None,
            PidRole::Control => self.control_pid = None,
        }

        match self.sub {
            ServiceSub::Start => {
                // Oneshot activation settled.
                self.sub = if success {
                    if self.conf.remain_after_exit {
                        ServiceSub::Exited
                    } else {
                        ServiceSub::Dead
                    }
                } else {
                    ServiceSub::Failed
                };
            }
            ServiceSub::Running => {
                if role == PidRole::Main {
                    self.sub = if success {
                        ServiceSub::Dead
                    } else {
                        ServiceSub::Failed
                    };
                }
            }
            ServiceSub::Reload => {
                if role == PidRole::Control {
                    if success {
                        self.sub = ServiceSub::Running;
                    } else {
                        warn!("{id}: reload command failed");
                        self.sub = ServiceSub::Failed;
                    }
                } else {
                    // Main process died mid-reload.
                    self.sub = if success {
                        ServiceSub::Dead
                    } else {
                        ServiceSub::Failed
                    };
                }
            }
            ServiceSub::StopSigterm | ServiceSub::StopSigkill => {
                if role == PidRole::Control {
                    // ExecStop helper finished; now take down the main
                    // process if it is still around.
                    if let Some(pid) = self.main_pid {
                        let _ = ctx.kill(pid, libc::SIGTERM);
                        return;
                    }
                }
                if self.main_pid.is_none() {
                    self.sub = ServiceSub::Dead;
                }
            }
            ServiceSub::Dead | ServiceSub::Exited | ServiceSub::Failed => {
                trace!("{id}: stray exit notification in sub-state {:?}", self.sub);
            }
        }
    }
}

// ── Socket ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenSpec {
    Stream(String),
    Datagram(String),
    FifoPath(PathBuf),
}

#[derive(Clone, Debug, Default)]
pub struct SocketConfig {
    pub listen: Vec<ListenSpec>,
    pub socket_mode: u32,
    pub ip_tos: Option<IpTos>,
    pub accept: bool,
    pub service: Option<UnitId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpTos {
    LowDelay,
    Throughput,
    Reliability,
    MinCost,
}

impl IpTos {
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "low-delay" => Some(Self::LowDelay),
            "throughput" => Some(Self::Throughput),
            "reliability" => Some(Self::Reliability),
            "min-cost" => Some(Self::MinCost),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SocketSub {
    #[default]
    Dead,
    Listening,
    Running,
    Failed,
}

impl SocketSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Listening => "listening",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(Self::Dead),
            "listening" => Some(Self::Listening),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SocketSpecific {
    pub conf: SocketConfig,
    pub sub: SocketSub,
}

impl SocketSpecific {
    const fn active_state(&self) -> ActiveState {
        match self.sub {
            SocketSub::Dead => ActiveState::Inactive,
            SocketSub::Listening | SocketSub::Running => ActiveState::Active,
            SocketSub::Failed => ActiveState::Failed,
        }
    }

    /// Open every configured listen address and hand the fds to the fd
    /// store, tagged with this unit. A failure closes whatever was
    /// already opened so a failed socket leaves nothing behind.
    fn start(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        if matches!(self.sub, SocketSub::Listening | SocketSub::Running) {
            return Ok(());
        }

        let mut opened: Vec<i32> = Vec::new();
        for spec in &self.conf.listen {
            match sockets::open_listen_fd(spec, self.conf.socket_mode) {
                Ok(fd) => opened.push(fd),
                Err(e) => {
                    for (spec, fd) in self.conf.listen.iter().zip(&opened) {
                        let _ = sockets::close_listen_fd(spec, *fd);
                    }
                    self.sub = SocketSub::Failed;
                    return Err(UnitOpError {
                        unit: id.clone(),
                        reason: UnitOpErrorReason::SocketOpenError(e),
                    });
                }
            }
        }
        for fd in opened {
            ctx.fd_store.insert(id, FdRole::Listen, fd);
        }
        self.sub = SocketSub::Listening;
        Ok(())
    }

    /// Close the listen fds and reclaim them from the fd store. The unit
    /// ends up dead either way; a node that would not go away is reported.
    fn stop(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        let stored = ctx.fd_store.remove_unit(id);
        let mut close_error = None;
        for (spec, stored_fd) in self.conf.listen.iter().zip(stored.iter()) {
            if let Err(e) = sockets::close_listen_fd(spec, stored_fd.fd) {
                close_error.get_or_insert(e);
            }
        }
        // Fds beyond the listen list (store-role) are just closed.
        for stored_fd in stored.iter().skip(self.conf.listen.len()) {
            sockets::close_raw_fd(stored_fd.fd);
        }
        self.sub = SocketSub::Dead;
        match close_error {
            None => Ok(()),
            Some(e) => Err(UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::SocketCloseError(e),
            }),
        }
    }
}

// ── Simple state types (target, device, snapshot) ──────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlainSub {
    #[default]
    Dead,
    Active,
}

impl PlainSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Active => "active",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(Self::Dead),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TargetSpecific {
    pub sub: PlainSub,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub sysfs: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceSub {
    #[default]
    Dead,
    Plugged,
}

impl DeviceSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Plugged => "plugged",
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceSpecific {
    pub conf: DeviceConfig,
    pub sub: DeviceSub,
}

#[derive(Clone, Debug, Default)]
pub struct SnapshotConfig {
    pub cleanup: bool,
}

#[derive(Debug, Default)]
pub struct SnapshotSpecific {
    pub conf: SnapshotConfig,
    pub sub: PlainSub,
}

// ── Mount / Swap / Automount ───────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct MountConfig {
    pub what: String,
    pub where_: String,
    pub fs_type: Option<String>,
    pub options: Option<String>,
    pub directory_mode: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MountSub {
    #[default]
    Dead,
    Mounting,
    Mounted,
    Unmounting,
    Failed,
}

impl MountSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Unmounting => "unmounting",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(Self::Dead),
            "mounting" => Some(Self::Mounting),
            "mounted" => Some(Self::Mounted),
            "unmounting" => Some(Self::Unmounting),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MountSpecific {
    pub conf: MountConfig,
    pub sub: MountSub,
}

impl MountSpecific {
    const fn active_state(&self) -> ActiveState {
        match self.sub {
            MountSub::Dead => ActiveState::Inactive,
            MountSub::Mounting => ActiveState::Activating,
            MountSub::Mounted => ActiveState::Active,
            MountSub::Unmounting => ActiveState::Deactivating,
            MountSub::Failed => ActiveState::Failed,
        }
    }

    /// mount(2) directly; the call is short and settles synchronously.
    #[cfg(target_os = "linux")]
    fn start(&mut self, id: &UnitId) -> Result<(), UnitOpError> {
        if is_already_mounted(&self.conf.where_) {
            trace!("{id}: {} is already mounted", self.conf.where_);
            self.sub = MountSub::Mounted;
            return Ok(());
        }

        let where_path = std::path::Path::new(&self.conf.where_);
        if !where_path.exists() {
            if let Err(e) = std::fs::create_dir_all(where_path) {
                self.sub = MountSub::Failed;
                return Err(UnitOpError {
                    unit: id.clone(),
                    reason: UnitOpErrorReason::MountError(format!(
                        "cannot create mount point {}: {e}",
                        self.conf.where_
                    )),
                });
            }
            if self.conf.directory_mode != 0 {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    where_path,
                    std::fs::Permissions::from_mode(self.conf.directory_mode),
                );
            }
        }

        let (flags, data) = mount_flags_from_options(self.conf.options.as_deref());
        let what: Option<&str> = if self.conf.what.is_empty() {
            None
        } else {
            Some(self.conf.what.as_str())
        };
        let result = nix::mount::mount(
            what,
            self.conf.where_.as_str(),
            self.conf.fs_type.as_deref(),
            flags,
            data.as_deref(),
        );
        match result {
            Ok(()) => {
                self.sub = MountSub::Mounted;
                Ok(())
            }
            Err(e) => {
                self.sub = MountSub::Failed;
                Err(UnitOpError {
                    unit: id.clone(),
                    reason: UnitOpErrorReason::MountError(format!(
                        "mount({}, {}): {e}",
                        self.conf.what, self.conf.where_
                    )),
                })
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn stop(&mut self, id: &UnitId) -> Result<(), UnitOpError> {
        if !is_already_mounted(&self.conf.where_) {
            self.sub = MountSub::Dead;
            return Ok(());
        }
        match nix::mount::umount2(self.conf.where_.as_str(), nix::mount::MntFlags::empty()) {
            Ok(()) => {
                self.sub = MountSub::Dead;
                Ok(())
            }
            Err(e) => {
                self.sub = MountSub::Failed;
                Err(UnitOpError {
                    unit: id.clone(),
                    reason: UnitOpErrorReason::MountError(format!(
                        "umount({}): {e}",
                        self.conf.where_
                    )),
                })
            }
        }
    }

    /// Forced unmount for deadline escalation: detach lazily.
    #[cfg(target_os = "linux")]
    fn force_unmount(&mut self) {
        let _ = nix::mount::umount2(
            self.conf.where_.as_str(),
            nix::mount::MntFlags::MNT_DETACH | nix::mount::MntFlags::MNT_FORCE,
        );
        self.sub = MountSub::Failed;
    }

    // Mounting is a no-op off Linux; the unit just tracks state.
    #[cfg(not(target_os = "linux"))]
    fn start(&mut self, id: &UnitId) -> Result<(), UnitOpError> {
        trace!("{id}: mount activation is a no-op on this platform");
        self.sub = MountSub::Mounted;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn stop(&mut self, id: &UnitId) -> Result<(), UnitOpError> {
        trace!("{id}: mount deactivation is a no-op on this platform");
        self.sub = MountSub::Dead;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn force_unmount(&mut self) {
        self.sub = MountSub::Failed;
    }
}

/// Translate `Options=` into mount flags plus pass-through data for the
/// filesystem driver.
#[cfg(target_os = "linux")]
fn mount_flags_from_options(options: Option<&str>) -> (nix::mount::MsFlags, Option<String>) {
    use nix::mount::MsFlags;

    let mut flags = MsFlags::empty();
    let mut data: Vec<String> = Vec::new();

    for opt in options.unwrap_or("").split(',') {
        match opt.trim() {
            "" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            // fstab-only options are not passed to mount(2)
            "auto" | "noauto" | "user" | "nouser" | "nofail" | "_netdev" => {}
            other => data.push(other.to_owned()),
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}

/// Check /proc/mounts for an existing mount on `path`.
#[cfg(target_os = "linux")]
fn is_already_mounted(path: &str) -> bool {
    let normalized = path.trim_end_matches('/');
    let wanted = if normalized.is_empty() { "/" } else { normalized };

    let Ok(contents) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    for line in contents.lines() {
        // format: device mountpoint fstype options dump pass
        if let Some(mountpoint) = line.split_whitespace().nth(1) {
            let mp = mountpoint.trim_end_matches('/');
            let mp = if mp.is_empty() { "/" } else { mp };
            if mp == wanted {
                return true;
            }
        }
    }
    false
}

#[derive(Clone, Debug, Default)]
pub struct SwapConfig {
    pub what: String,
    pub priority: Option<i32>,
}

#[derive(Debug, Default)]
pub struct SwapSpecific {
    pub conf: SwapConfig,
    pub sub: MountSub,
    pub control_pid: Option<i32>,
}

impl SwapSpecific {
    fn start(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        let mut args = Vec::new();
        if let Some(prio) = self.conf.priority {
            args.push("-p".to_owned());
            args.push(prio.to_string());
        }
        args.push(self.conf.what.clone());
        let cmd = Commandline {
            cmd: "/sbin/swapon".to_owned(),
            args,
        };
        let pid = ctx
            .spawn(id, PidRole::Control, &cmd, &ExecParams::default())
            .map_err(|e| {
                self.sub = MountSub::Failed;
                UnitOpError {
                    unit: id.clone(),
                    reason: UnitOpErrorReason::SpawnFailed(e.to_string()),
                }
            })?;
        self.control_pid = Some(pid);
        self.sub = MountSub::Mounting;
        Ok(())
    }

    fn stop(&mut self, id: &UnitId, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        let cmd = Commandline {
            cmd: "/sbin/swapoff".to_owned(),
            args: vec![self.conf.what.clone()],
        };
        let pid = ctx
            .spawn(id, PidRole::Control, &cmd, &ExecParams::default())
            .map_err(|e| UnitOpError {
                unit: id.clone(),
                reason: UnitOpErrorReason::SpawnFailed(e.to_string()),
            })?;
        self.control_pid = Some(pid);
        self.sub = MountSub::Unmounting;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct AutomountConfig {
    pub where_: String,
    pub directory_mode: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WaitingSub {
    #[default]
    Dead,
    Waiting,
    Running,
    Failed,
}

impl WaitingSub {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(Self::Dead),
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct AutomountSpecific {
    pub conf: AutomountConfig,
    pub sub: WaitingSub,
}

// ── Timer / Path ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct TimerConfig {
    pub on_boot: Option<Duration>,
    pub on_startup: Option<Duration>,
    pub on_unit_active: Option<Duration>,
    pub unit: Option<UnitId>,
}

#[derive(Debug, Default)]
pub struct TimerSpecific {
    pub conf: TimerConfig,
    pub sub: WaitingSub,
    pub next_elapse: Option<std::time::Instant>,
}

#[derive(Clone, Debug, Default)]
pub struct PathConfig {
    pub path_exists: Vec<PathBuf>,
    pub path_changed: Vec<PathBuf>,
    pub directory_not_empty: Vec<PathBuf>,
    pub unit: Option<UnitId>,
}

#[derive(Debug, Default)]
pub struct PathSpecific {
    pub conf: PathConfig,
    pub sub: WaitingSub,
}

// ── Unit operations ────────────────────────────────────────────────────────

impl Unit {
    /// A fresh stub unit of the kind implied by `id`.
    pub fn stub(id: UnitId) -> Self {
        let mut names = BTreeSet::new();
        names.insert(id.name.clone());
        let specific = Specific::empty_for(id.kind);
        Self {
            id,
            names,
            load_state: LoadState::Stub,
            fragment_path: None,
            fragment_mtime: None,
            description: String::new(),
            documentation: Vec::new(),
            conditions: Vec::new(),
            dependencies: Dependencies::default(),
            config: UnitConfig::default(),
            job: None,
            specific,
        }
    }

    pub fn active_state(&self) -> ActiveState {
        match &self.specific {
            Specific::Service(s) => s.active_state(),
            Specific::Socket(s) => s.active_state(),
            Specific::Target(s) => match s.sub {
                PlainSub::Dead => ActiveState::Inactive,
                PlainSub::Active => ActiveState::Active,
            },
            Specific::Device(s) => match s.sub {
                DeviceSub::Dead => ActiveState::Inactive,
                DeviceSub::Plugged => ActiveState::Active,
            },
            Specific::Mount(s) => s.active_state(),
            Specific::Automount(s) => waiting_active_state(s.sub),
            Specific::Timer(s) => waiting_active_state(s.sub),
            Specific::Path(s) => waiting_active_state(s.sub),
            Specific::Snapshot(s) => match s.sub {
                PlainSub::Dead => ActiveState::Inactive,
                PlainSub::Active => ActiveState::Active,
            },
            Specific::Swap(s) => match s.sub {
                MountSub::Dead => ActiveState::Inactive,
                MountSub::Mounting => ActiveState::Activating,
                MountSub::Mounted => ActiveState::Active,
                MountSub::Unmounting => ActiveState::Deactivating,
                MountSub::Failed => ActiveState::Failed,
            },
        }
    }

    pub fn sub_state(&self) -> &'static str {
        match &self.specific {
            Specific::Service(s) => s.sub.as_str(),
            Specific::Socket(s) => s.sub.as_str(),
            Specific::Target(s) => s.sub.as_str(),
            Specific::Device(s) => s.sub.as_str(),
            Specific::Mount(s) => s.sub.as_str(),
            Specific::Automount(s) => s.sub.as_str(),
            Specific::Timer(s) => s.sub.as_str(),
            Specific::Path(s) => s.sub.as_str(),
            Specific::Snapshot(s) => s.sub.as_str(),
            Specific::Swap(s) => s.sub.as_str(),
        }
    }

    /// Drive the unit towards active. State settles either synchronously
    /// (targets, sockets) or when a child exit arrives (services, mounts).
    pub fn start(&mut self, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        trace!("start {}", self.id);
        match &mut self.specific {
            Specific::Service(s) => {
                let id = self.id.clone();
                s.start(&id, ctx)
            }
            Specific::Socket(s) => {
                let id = self.id.clone();
                s.start(&id, ctx)
            }
            Specific::Target(s) => {
                s.sub = PlainSub::Active;
                Ok(())
            }
            Specific::Device(_) => Err(UnitOpError {
                unit: self.id.clone(),
                reason: UnitOpErrorReason::OperationNotSupported("start"),
            }),
            Specific::Mount(s) => {
                let id = self.id.clone();
                s.start(&id)
            }
            Specific::Automount(s) => {
                s.sub = WaitingSub::Waiting;
                Ok(())
            }
            Specific::Timer(s) => {
                let interval = s.conf.on_boot.or(s.conf.on_startup);
                s.next_elapse = interval.map(|d| std::time::Instant::now() + d);
                s.sub = WaitingSub::Waiting;
                Ok(())
            }
            Specific::Path(s) => {
                s.sub = WaitingSub::Waiting;
                Ok(())
            }
            Specific::Snapshot(s) => {
                s.sub = PlainSub::Active;
                Ok(())
            }
            Specific::Swap(s) => {
                let id = self.id.clone();
                s.start(&id, ctx)
            }
        }
    }

    /// Drive the unit towards inactive.
    pub fn stop(&mut self, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        trace!("stop {}", self.id);
        match &mut self.specific {
            Specific::Service(s) => {
                let id = self.id.clone();
                s.stop(&id, ctx)
            }
            Specific::Socket(s) => {
                let id = self.id.clone();
                s.stop(&id, ctx)
            }
            Specific::Target(s) => {
                s.sub = PlainSub::Dead;
                Ok(())
            }
            Specific::Device(_) => Err(UnitOpError {
                unit: self.id.clone(),
                reason: UnitOpErrorReason::OperationNotSupported("stop"),
            }),
            Specific::Mount(s) => {
                let id = self.id.clone();
                s.stop(&id)
            }
            Specific::Automount(s) => {
                s.sub = WaitingSub::Dead;
                Ok(())
            }
            Specific::Timer(s) => {
                s.next_elapse = None;
                s.sub = WaitingSub::Dead;
                Ok(())
            }
            Specific::Path(s) => {
                s.sub = WaitingSub::Dead;
                Ok(())
            }
            Specific::Snapshot(s) => {
                s.sub = PlainSub::Dead;
                Ok(())
            }
            Specific::Swap(s) => {
                let id = self.id.clone();
                s.stop(&id, ctx)
            }
        }
    }

    /// Ask the unit to reload its configuration in place.
    pub fn reload(&mut self, ctx: &mut ExecContext) -> Result<(), UnitOpError> {
        trace!("reload {}", self.id);
        match &mut self.specific {
            Specific::Service(s) => {
                let id = self.id.clone();
                s.reload(&id, ctx)
            }
            _ => Err(UnitOpError {
                unit: self.id.clone(),
                reason: UnitOpErrorReason::OperationNotSupported("reload"),
            }),
        }
    }

    /// Deadline escalation: SIGTERM was not enough, move to SIGKILL.
    pub fn escalate_stop(&mut self, ctx: &mut ExecContext) {
        match &mut self.specific {
            Specific::Service(s) => {
                let id = self.id.clone();
                s.escalate_stop(&id, ctx)
            }
            Specific::Mount(s) => {
                s.force_unmount();
            }
            Specific::Swap(s) => {
                if let Some(pid) = s.control_pid.take() {
                    let _ = ctx.kill(pid, libc::SIGKILL);
                }
                s.sub = MountSub::Failed;
            }
            _ => {}
        }
    }

    /// A child process belonging to this unit exited.
    pub fn notify_exited(
        &mut self,
        role: PidRole,
        success: bool,
        ctx: &mut ExecContext,
    ) {
        match &mut self.specific {
            Specific::Service(s) => {
                let id = self.id.clone();
                s.notify_exited(&id, role, success, ctx);
            }
            Specific::Swap(s) => {
                s.control_pid = None;
                s.sub = match s.sub {
                    MountSub::Mounting => {
                        if success {
                            MountSub::Mounted
                        } else {
                            MountSub::Failed
                        }
                    }
                    MountSub::Unmounting => {
                        if success {
                            MountSub::Dead
                        } else {
                            MountSub::Failed
                        }
                    }
                    other => other,
                };
            }
            _ => {
                trace!("{}: ignoring child exit for unit type without processes", self.id);
            }
        }
    }

    /// Reset a failed unit back to inactive.
    pub fn reset_failed(&mut self) {
        match &mut self.specific {
            Specific::Service(s) => {
                if s.sub == ServiceSub::Failed {
                    s.sub = ServiceSub::Dead;
                }
            }
            Specific::Socket(s) => {
                if s.sub == SocketSub::Failed {
                    s.sub = SocketSub::Dead;
                }
            }
            Specific::Mount(s) => {
                if s.sub == MountSub::Failed {
                    s.sub = MountSub::Dead;
                }
            }
            Specific::Swap(s) => {
                if s.sub == MountSub::Failed {
                    s.sub = MountSub::Dead;
                }
            }
            Specific::Automount(s) => {
                if s.sub == WaitingSub::Failed {
                    s.sub = WaitingSub::Dead;
                }
            }
            Specific::Timer(s) => {
                if s.sub == WaitingSub::Failed {
                    s.sub = WaitingSub::Dead;
                }
            }
            Specific::Path(s) => {
                if s.sub == WaitingSub::Failed {
                    s.sub = WaitingSub::Dead;
                }
            }
            _ => {}
        }
    }

    /// Force the unit's state machine from serialized state; used when
    /// re-adopting state across re-execution.
    pub fn coldplug(&mut self, sub_state: &str, main_pid: Option<i32>) {
        match &mut self.specific {
            Specific::Service(s) => {
                if let Some(sub) = ServiceSub::from_str(sub_state) {
                    s.sub = sub;
                    s.main_pid = main_pid;
                }
            }
            Specific::Socket(s) => {
                if let Some(sub) = SocketSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Target(s) => {
                if let Some(sub) = PlainSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Device(s) => {
                if sub_state == "plugged" {
                    s.sub = DeviceSub::Plugged;
                }
            }
            Specific::Mount(s) => {
                if let Some(sub) = MountSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Automount(s) => {
                if let Some(sub) = WaitingSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Timer(s) => {
                if let Some(sub) = WaitingSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Path(s) => {
                if let Some(sub) = WaitingSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Snapshot(s) => {
                if let Some(sub) = PlainSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
            Specific::Swap(s) => {
                if let Some(sub) = MountSub::from_str(sub_state) {
                    s.sub = sub;
                }
            }
        }
    }

    pub fn main_pid(&self) -> Option<i32> {
        match &self.specific {
            Specific::Service(s) => s.main_pid,
            _ => None,
        }
    }
}

const fn waiting_active_state(sub: WaitingSub) -> ActiveState {
    match sub {
        WaitingSub::Dead => ActiveState::Inactive,
        WaitingSub::Waiting | WaitingSub::Running => ActiveState::Active,
        WaitingSub::Failed => ActiveState::Failed,
    }
}
