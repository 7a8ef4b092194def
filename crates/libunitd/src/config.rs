//! Manager configuration: lookup paths, the default target, logging knobs,
//! and kernel command line handling for the PID 1 case.
//!
//! There is no configuration file. Everything comes from compiled-in
//! defaults, CLI flags, and (as PID 1) `/proc/cmdline` tokens.

use std::path::PathBuf;

use log::warn;

/// Whether the manager runs the whole system or one user session. Decides
/// the lookup paths and the control socket location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunningAs {
    System,
    Session,
}

impl RunningAs {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Session => "session",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogTarget {
    Console,
    Kmsg,
    Null,
}

impl LogTarget {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "console" => Some(Self::Console),
            "kmsg" => Some(Self::Kmsg),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Kmsg => "kmsg",
            Self::Null => "null",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: log::LevelFilter,
    pub target: LogTarget,
    pub color: bool,
    pub location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: log::LevelFilter::Info,
            target: LogTarget::Console,
            color: true,
            location: false,
        }
    }
}

/// System-wide unit search directories, in priority order.
const SYSTEM_UNIT_DIRS: &[&str] = &[
    "/etc/unitd/system",
    "/run/unitd/system",
    "/usr/local/lib/unitd/system",
    "/usr/lib/unitd/system",
    "/lib/unitd/system",
];

/// Per-session unit search directories, relative to $HOME where noted.
const SESSION_UNIT_DIRS: &[&str] = &["/etc/unitd/session", "/usr/lib/unitd/session"];

#[derive(Clone, Debug)]
pub struct Config {
    pub running_as: RunningAs,
    pub unit_dirs: Vec<PathBuf>,
    pub default_target: String,
    pub control_socket: PathBuf,
    pub show_status: bool,
    pub confirm_spawn: bool,
    pub dump_core: bool,
    pub crash_shell: bool,
    pub log: LogConfig,
}

impl Config {
    pub fn default_for(running_as: RunningAs) -> Self {
        let unit_dirs = match running_as {
            RunningAs::System => SYSTEM_UNIT_DIRS.iter().map(PathBuf::from).collect(),
            RunningAs::Session => {
                let mut dirs: Vec<PathBuf> =
                    SESSION_UNIT_DIRS.iter().map(PathBuf::from).collect();
                if let Ok(home) = std::env::var("HOME") {
                    dirs.insert(0, PathBuf::from(home).join(".config/unitd/session"));
                }
                dirs
            }
        };
        let control_socket = match running_as {
            RunningAs::System => PathBuf::from("/run/unitd/control.socket"),
            RunningAs::Session => {
                let runtime = std::env::var("XDG_RUNTIME_DIR")
                    .unwrap_or_else(|_| "/tmp".to_owned());
                PathBuf::from(runtime).join("unitd-control.socket")
            }
        };
        Self {
            running_as,
            unit_dirs,
            default_target: "default.target".to_owned(),
            control_socket,
            show_status: false,
            confirm_spawn: false,
            dump_core: true,
            crash_shell: false,
            log: LogConfig::default(),
        }
    }

    /// Keep only lookup directories that exist, preserving order.
    pub fn prune_missing_unit_dirs(&mut self) {
        self.unit_dirs.retain(|dir| dir.is_dir());
    }

    /// Apply recognized kernel command line tokens. Only meaningful as
    /// PID 1; unknown tokens are someone else's business and ignored
    /// silently, malformed recognized tokens get a warning.
    pub fn apply_kernel_cmdline(&mut self, cmdline: &str) {
        for word in cmdline.split_whitespace() {
            self.apply_cmdline_word(word);
        }
    }

    fn apply_cmdline_word(&mut self, word: &str) {
        if let Some(value) = word.strip_prefix("systemd.unit=") {
            self.default_target = value.to_owned();
        } else if let Some(value) = word.strip_prefix("systemd.log_level=") {
            match parse_log_level(value) {
                Some(level) => self.log.level = level,
                None => warn!("unknown log level on kernel command line: {value}"),
            }
        } else if let Some(value) = word.strip_prefix("systemd.log_target=") {
            match LogTarget::from_str(value) {
                Some(target) => self.log.target = target,
                None => warn!("unknown log target on kernel command line: {value}"),
            }
        } else if let Some(value) = word.strip_prefix("systemd.log_color=") {
            self.log.color = parse_cmdline_bool(value);
        } else if let Some(value) = word.strip_prefix("systemd.log_location=") {
            self.log.location = parse_cmdline_bool(value);
        } else if let Some(value) = word.strip_prefix("systemd.dump_core=") {
            self.dump_core = parse_cmdline_bool(value);
        } else if let Some(value) = word.strip_prefix("systemd.crash_shell=") {
            self.crash_shell = parse_cmdline_bool(value);
        } else if word.starts_with("systemd.crash_chvt=") {
            // Accepted for compatibility; VT switching happens in the
            // crash handler, outside this core.
        } else if let Some(value) = word.strip_prefix("systemd.confirm_spawn=") {
            self.confirm_spawn = parse_cmdline_bool(value);
        } else if let Some(value) = word.strip_prefix("systemd.show_status=") {
            self.show_status = parse_cmdline_bool(value);
        } else if let Some(value) = word.strip_prefix("console=") {
            // A serial console suppresses status output; a VT console is
            // not our concern.
            if !value.starts_with("tty") {
                self.show_status = false;
            }
        } else if word == "quiet" {
            self.show_status = false;
        } else if let Some(target) = runlevel_target(word) {
            self.default_target = target.to_owned();
        }
    }
}

/// SysV compatibility: runlevel words select targets.
pub fn runlevel_target(word: &str) -> Option<&'static str> {
    match word {
        "single" | "s" | "S" | "1" => Some("rescue.target"),
        "2" => Some("runlevel2.target"),
        "3" => Some("runlevel3.target"),
        "4" => Some("runlevel4.target"),
        "5" => Some("runlevel5.target"),
        "emergency" | "-b" => Some("emergency.target"),
        _ => None,
    }
}

pub fn parse_log_level(s: &str) -> Option<log::LevelFilter> {
    match s {
        "emerg" | "alert" | "crit" | "err" | "error" => Some(log::LevelFilter::Error),
        "warning" | "warn" => Some(log::LevelFilter::Warn),
        "notice" | "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

/// Kernel command line booleans are lenient: an unparseable value means
/// "enabled", matching how a bare flag is usually intended.
fn parse_cmdline_bool(s: &str) -> bool {
    !matches!(s, "no" | "false" | "off" | "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runlevel_aliases() {
        assert_eq!(runlevel_target("single"), Some("rescue.target"));
        assert_eq!(runlevel_target("1"), Some("rescue.target"));
        assert_eq!(runlevel_target("3"), Some("runlevel3.target"));
        assert_eq!(runlevel_target("5"), Some("runlevel5.target"));
        assert_eq!(runlevel_target("emergency"), Some("emergency.target"));
        assert_eq!(runlevel_target("7"), None);
    }

    #[test]
    fn cmdline_tokens() {
        let mut config = Config::default_for(RunningAs::System);
        config.show_status = true;
        config.apply_kernel_cmdline(
            "root=/dev/sda1 quiet systemd.unit=rescue.target systemd.log_level=debug \
             systemd.log_target=null systemd.dump_core=no unknown.option=1",
        );
        assert_eq!(config.default_target, "rescue.target");
        assert_eq!(config.log.level, log::LevelFilter::Debug);
        assert_eq!(config.log.target, LogTarget::Null);
        assert!(!config.dump_core);
        assert!(!config.show_status);
    }

    #[test]
    fn runlevel_word_on_cmdline() {
        let mut config = Config::default_for(RunningAs::System);
        config.apply_kernel_cmdline("ro 3");
        assert_eq!(config.default_target, "runlevel3.target");
    }
}
