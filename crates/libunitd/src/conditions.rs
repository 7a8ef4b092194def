//! Condition predicates that gate unit activation.
//!
//! A condition is `{kind, parameter, trigger, negate}`. In a list,
//! non-trigger conditions are AND-combined and trigger conditions are
//! OR-combined: the list holds if every non-trigger condition holds and, if
//! any trigger conditions are present, at least one of them holds. An empty
//! list always holds.
//!
//! In unit files the value syntax is `ConditionPathExists=|!/foo/bar`:
//! a leading `|` marks the condition as a trigger, a following `!` negates.

use log::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    PathExists,
    PathIsDirectory,
    DirectoryNotEmpty,
    KernelCommandLine,
    Virtualization,
    Security,
    Null,
}

impl ConditionKind {
    pub fn from_directive(key: &str) -> Option<Self> {
        match key {
            "CONDITIONPATHEXISTS" => Some(Self::PathExists),
            "CONDITIONPATHISDIRECTORY" => Some(Self::PathIsDirectory),
            "CONDITIONDIRECTORYNOTEMPTY" => Some(Self::DirectoryNotEmpty),
            "CONDITIONKERNELCOMMANDLINE" => Some(Self::KernelCommandLine),
            "CONDITIONVIRTUALIZATION" => Some(Self::Virtualization),
            "CONDITIONSECURITY" => Some(Self::Security),
            "CONDITIONNULL" => Some(Self::Null),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PathExists => "ConditionPathExists",
            Self::PathIsDirectory => "ConditionPathIsDirectory",
            Self::DirectoryNotEmpty => "ConditionDirectoryNotEmpty",
            Self::KernelCommandLine => "ConditionKernelCommandLine",
            Self::Virtualization => "ConditionVirtualization",
            Self::Security => "ConditionSecurity",
            Self::Null => "ConditionNull",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub parameter: String,
    pub trigger: bool,
    pub negate: bool,
}

impl Condition {
    pub fn new(kind: ConditionKind, parameter: &str, trigger: bool, negate: bool) -> Self {
        Self {
            kind,
            parameter: parameter.to_owned(),
            trigger,
            negate,
        }
    }

    /// Parse a unit-file condition value: `[|][!]parameter`.
    pub fn parse(kind: ConditionKind, value: &str) -> Self {
        let (trigger, rest) = match value.strip_prefix('|') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (negate, rest) = match rest.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        Self::new(kind, rest, trigger, negate)
    }

    /// Evaluate this condition against host state. Probe failures
    /// (e.g. ENOENT) count as "does not hold", never as errors.
    pub fn test(&self) -> bool {
        self.test_with(&HostProbes::default())
    }

    fn test_with(&self, probes: &HostProbes) -> bool {
        let holds = match self.kind {
            ConditionKind::PathExists => std::path::Path::new(&self.parameter).exists(),
            ConditionKind::PathIsDirectory => {
                // Does not follow a trailing symlink, matching lstat semantics.
                std::fs::symlink_metadata(&self.parameter)
                    .map(|m| m.file_type().is_dir())
                    .unwrap_or(false)
            }
            ConditionKind::DirectoryNotEmpty => std::fs::read_dir(&self.parameter)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false),
            ConditionKind::KernelCommandLine => {
                test_kernel_command_line(&self.parameter, &probes.kernel_cmdline())
            }
            ConditionKind::Virtualization => {
                test_virtualization(&self.parameter, probes.virtualization().as_deref())
            }
            ConditionKind::Security => test_security(&self.parameter),
            ConditionKind::Null => true,
        };
        holds != self.negate
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}{}{}",
            self.kind.as_str(),
            if self.trigger { "|" } else { "" },
            if self.negate { "!" } else { "" },
            self.parameter
        )
    }
}

/// Evaluate a condition list: all non-trigger conditions must hold, and if
/// any trigger conditions exist, at least one must hold.
pub fn test_list(conditions: &[Condition]) -> bool {
    let mut triggered: Option<bool> = None;

    for c in conditions {
        let b = c.test();

        if !c.trigger && !b {
            return false;
        }
        if c.trigger && triggered != Some(true) {
            triggered = Some(b);
        }
    }

    triggered != Some(false)
}

/// Host probes, separated so the expensive ones are read lazily and at
/// most once per evaluation.
#[derive(Default)]
struct HostProbes;

impl HostProbes {
    fn kernel_cmdline(&self) -> String {
        match std::fs::read_to_string("/proc/cmdline") {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read /proc/cmdline, ignoring: {e}");
                String::new()
            }
        }
    }

    fn virtualization(&self) -> Option<String> {
        detect_virtualization()
    }
}

/// Match a parameter against the kernel command line tokens. `KEY=VALUE`
/// parameters need an exact token match; a bare `KEY` matches both the
/// standalone token and any `KEY=...` assignment.
fn test_kernel_command_line(parameter: &str, cmdline: &str) -> bool {
    let wants_assignment = parameter.contains('=');

    for word in cmdline.split_whitespace() {
        if wants_assignment {
            if word == parameter {
                return true;
            }
        } else if let Some(rest) = word.strip_prefix(parameter) {
            if rest.is_empty() || rest.starts_with('=') {
                return true;
            }
        }
    }
    false
}

/// `yes`/`no` test for any/no virtualization; any other parameter is an
/// exact match against the detected hypervisor id.
fn test_virtualization(parameter: &str, detected: Option<&str>) -> bool {
    match parameter {
        "yes" | "true" | "on" | "1" => detected.is_some(),
        "no" | "false" | "off" | "0" => detected.is_none(),
        other => detected == Some(other),
    }
}

/// Only "selinux" is recognized for now; holds when the SELinux filesystem
/// is mounted and enabled.
fn test_security(parameter: &str) -> bool {
    if parameter != "selinux" {
        return false;
    }
    std::fs::read_to_string("/sys/fs/selinux/enforce").is_ok()
        || std::path::Path::new("/selinux/enforce").exists()
}

/// A small subset of hypervisor detection: container markers first, then
/// CPUID-less filesystem markers for the common VMMs.
fn detect_virtualization() -> Option<String> {
    if std::path::Path::new("/.dockerenv").exists() {
        return Some("docker".to_owned());
    }
    if std::path::Path::new("/run/.containerenv").exists() {
        return Some("podman".to_owned());
    }
    if let Ok(env) = std::fs::read_to_string("/run/systemd/container") {
        let env = env.trim();
        if !env.is_empty() {
            return Some(env.to_owned());
        }
    }
    if let Ok(pid1env) = std::fs::read_to_string("/proc/1/environ") {
        for entry in pid1env.split('\0') {
            if let Some(v) = entry.strip_prefix("container=") {
                if !v.is_empty() {
                    return Some(v.to_owned());
                }
            }
        }
    }
    // DMI vendor strings cover kvm/qemu/vmware/oracle/microsoft/xen.
    if let Ok(vendor) = std::fs::read_to_string("/sys/class/dmi/id/sys_vendor") {
        let vendor = vendor.trim().to_lowercase();
        for (marker, id) in &[
            ("kvm", "kvm"),
            ("qemu", "qemu"),
            ("vmware", "vmware"),
            ("innotek", "oracle"),
            ("virtualbox", "oracle"),
            ("microsoft", "microsoft"),
            ("xen", "xen"),
            ("bochs", "bochs"),
        ] {
            if vendor.contains(marker) {
                return Some((*id).to_owned());
            }
        }
    }
    if std::path::Path::new("/proc/xen").exists() {
        return Some("xen".to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(trigger: bool, negate: bool) -> Condition {
        Condition::new(ConditionKind::Null, "", trigger, negate)
    }

    #[test]
    fn empty_list_holds() {
        assert!(test_list(&[]));
    }

    #[test]
    fn non_trigger_and_combined() {
        assert!(test_list(&[always(false, false), always(false, false)]));
        assert!(!test_list(&[always(false, false), always(false, true)]));
    }

    #[test]
    fn trigger_or_combined() {
        // one true trigger is enough
        assert!(test_list(&[always(true, true), always(true, false)]));
        // only false triggers -> false
        assert!(!test_list(&[always(true, true), always(true, true)]));
        // false trigger does not save a failed non-trigger
        assert!(!test_list(&[always(false, true), always(true, false)]));
    }

    #[test]
    fn negate_inverts() {
        assert!(!always(false, true).test());
        assert!(always(false, false).test());
    }

    #[test]
    fn parse_prefixes() {
        let c = Condition::parse(ConditionKind::PathExists, "|!/etc/passwd");
        assert!(c.trigger);
        assert!(c.negate);
        assert_eq!(c.parameter, "/etc/passwd");

        let c = Condition::parse(ConditionKind::PathExists, "!/etc/passwd");
        assert!(!c.trigger);
        assert!(c.negate);

        let c = Condition::parse(ConditionKind::PathExists, "/etc/passwd");
        assert!(!c.trigger);
        assert!(!c.negate);
    }

    #[test]
    fn path_exists_probe() {
        let c = Condition::new(ConditionKind::PathExists, "/", false, false);
        assert!(c.test());
        let c = Condition::new(
            ConditionKind::PathExists,
            "/nonexistent-bJkQ3/xyz",
            false,
            false,
        );
        assert!(!c.test());
        // ENOENT is "false", so negate makes it hold
        let c = Condition::new(
            ConditionKind::PathExists,
            "/nonexistent-bJkQ3/xyz",
            false,
            true,
        );
        assert!(c.test());
    }

    #[test]
    fn directory_probe() {
        let c = Condition::new(ConditionKind::PathIsDirectory, "/", false, false);
        assert!(c.test());
        let c = Condition::new(ConditionKind::DirectoryNotEmpty, "/", false, false);
        assert!(c.test());
    }

    #[test]
    fn kernel_cmdline_matching() {
        let line = "root=/dev/sda1 quiet console=ttyS0 rd.break";
        assert!(test_kernel_command_line("quiet", line));
        assert!(test_kernel_command_line("root", line));
        assert!(test_kernel_command_line("root=/dev/sda1", line));
        assert!(!test_kernel_command_line("root=/dev/sdb1", line));
        assert!(!test_kernel_command_line("roo", line));
        assert!(!test_kernel_command_line("verbose", line));
    }

    #[test]
    fn virtualization_matching() {
        assert!(test_virtualization("yes", Some("kvm")));
        assert!(!test_virtualization("yes", None));
        assert!(test_virtualization("no", None));
        assert!(!test_virtualization("no", Some("kvm")));
        assert!(test_virtualization("kvm", Some("kvm")));
        assert!(!test_virtualization("xen", Some("kvm")));
    }
}
