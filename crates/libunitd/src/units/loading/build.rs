//! Turn a parsed fragment into a typed [`Unit`], collecting declared
//! dependencies and aliases for the registry to wire up afterwards.
//!
//! Invalid values never fail the load: the directive is skipped with a
//! warning, matching the rule that fragment problems are survivable.

use std::path::PathBuf;
use std::time::SystemTime;

use log::{debug, warn};

use crate::conditions::{Condition, ConditionKind};
use crate::units::loading::parse::{
    expand_specifiers, parse_bool, parse_duration, parse_mode, parse_nice,
    parse_oom_score_adjust, ParsedFile, ParsedSection,
};
use crate::units::{
    Commandline, DepKind, IpTos, ListenSpec, LoadState, ServiceType, Specific, Unit, UnitId,
    UnitIdKind,
};

/// A freshly built unit plus the relations that can only be wired once the
/// rest of the registry is visible.
#[derive(Debug)]
pub struct LoadedUnit {
    pub unit: Unit,
    pub declared_deps: Vec<(DepKind, String)>,
    pub aliases: Vec<String>,
}

pub fn build_unit(
    id: UnitId,
    mut parsed: ParsedFile,
    fragment_path: PathBuf,
    fragment_mtime: Option<SystemTime>,
) -> LoadedUnit {
    let mut unit = Unit::stub(id);
    unit.load_state = LoadState::Loaded;
    unit.fragment_path = Some(fragment_path);
    unit.fragment_mtime = fragment_mtime;

    let mut declared_deps = Vec::new();
    let mut aliases = Vec::new();

    let name = unit.id.name.clone();

    if let Some(section) = parsed.remove("Unit") {
        apply_unit_section(&mut unit, &name, section, &mut declared_deps, &mut aliases);
    }
    if let Some(_section) = parsed.remove("Install") {
        // [Install] drives enablement tooling; it has no runtime effect.
        debug!("{name}: ignoring [Install] section at runtime");
    }

    let type_section = match unit.id.kind {
        UnitIdKind::Service => Some("Service"),
        UnitIdKind::Socket => Some("Socket"),
        UnitIdKind::Mount => Some("Mount"),
        UnitIdKind::Automount => Some("Automount"),
        UnitIdKind::Timer => Some("Timer"),
        UnitIdKind::Path => Some("Path"),
        UnitIdKind::Swap => Some("Swap"),
        UnitIdKind::Target => Some("Target"),
        UnitIdKind::Device | UnitIdKind::Snapshot => None,
    };

    if let Some(section_name) = type_section {
        if let Some(section) = parsed.remove(section_name) {
            match &mut unit.specific {
                Specific::Service(s) => {
                    apply_service_section(&name, section, &mut s.conf, &mut declared_deps)
                }
                Specific::Socket(s) => {
                    apply_socket_section(&name, section, &mut s.conf, &mut declared_deps)
                }
                Specific::Mount(s) => apply_mount_section(&name, section, &mut s.conf),
                Specific::Automount(s) => apply_automount_section(&name, section, &mut s.conf),
                Specific::Timer(s) => {
                    apply_timer_section(&name, section, &mut s.conf, &mut declared_deps)
                }
                Specific::Path(s) => {
                    apply_path_section(&name, section, &mut s.conf, &mut declared_deps)
                }
                Specific::Swap(s) => apply_swap_section(&name, section, &mut s.conf),
                Specific::Target(_) => {
                    // Targets carry no type-specific settings.
                    warn_unknown_keys(&name, "Target", &section, &[]);
                }
                Specific::Device(_) | Specific::Snapshot(_) => {}
            }
        }
    }

    for section_name in parsed.keys() {
        warn!("{name}: ignoring unknown section [{section_name}]");
    }

    LoadedUnit {
        unit,
        declared_deps,
        aliases,
    }
}

fn single_value(name: &str, key: &str, values: Vec<(u32, String)>) -> Option<String> {
    let mut values = values;
    if values.len() > 1 {
        warn!("{name}: {key} given more than once, using the last value");
    }
    values.pop().map(|(_, v)| v)
}

fn list_values(values: Vec<(u32, String)>) -> Vec<String> {
    values
        .into_iter()
        .flat_map(|(_, v)| {
            v.split_whitespace()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn parse_commandline(name: &str, key: &str, value: &str) -> Option<Commandline> {
    let mut parts = match shlex::split(value) {
        Some(parts) if !parts.is_empty() => parts,
        _ => {
            warn!("{name}: cannot parse {key}={value}, skipping");
            return None;
        }
    };
    let cmd = parts.remove(0);
    Some(Commandline { cmd, args: parts })
}

fn apply_unit_section(
    unit: &mut Unit,
    name: &str,
    section: ParsedSection,
    declared_deps: &mut Vec<(DepKind, String)>,
    aliases: &mut Vec<String>,
) {
    for (key, values) in section {
        if let Some(kind) = DepKind::from_directive(&key) {
            for target in list_values(values) {
                declared_deps.push((kind, expand_specifiers(&target, name)));
            }
            continue;
        }
        if let Some(kind) = ConditionKind::from_directive(&key) {
            for (_, value) in values {
                unit.conditions
                    .push(Condition::parse(kind.clone(), &expand_specifiers(&value, name)));
            }
            continue;
        }
        match key.as_str() {
            "DESCRIPTION" => {
                if let Some(v) = single_value(name, "Description", values) {
                    unit.description = expand_specifiers(&v, name);
                }
            }
            "DOCUMENTATION" => {
                unit.documentation.extend(list_values(values));
            }
            "NAMES" => {
                aliases.extend(list_values(values));
            }
            "DEFAULTDEPENDENCIES" => {
                apply_bool(name, "DefaultDependencies", values, &mut unit.config.default_dependencies);
            }
            "ALLOWISOLATE" => {
                apply_bool(name, "AllowIsolate", values, &mut unit.config.allow_isolate);
            }
            "IGNOREONISOLATE" => {
                apply_bool(name, "IgnoreOnIsolate", values, &mut unit.config.ignore_on_isolate);
            }
            "REFUSEMANUALSTART" => {
                apply_bool(name, "RefuseManualStart", values, &mut unit.config.refuse_manual_start);
            }
            "REFUSEMANUALSTOP" => {
                apply_bool(name, "RefuseManualStop", values, &mut unit.config.refuse_manual_stop);
            }
            "STOPWHENUNNEEDED" => {
                apply_bool(name, "StopWhenUnneeded", values, &mut unit.config.stop_when_unneeded);
            }
            "JOBTIMEOUTSEC" => {
                if let Some(v) = single_value(name, "JobTimeoutSec", values) {
                    match parse_duration(&v) {
                        Some(timeout) if !timeout.is_zero() => {
                            unit.config.job_timeout = Some(timeout);
                        }
                        Some(_) => unit.config.job_timeout = None,
                        None => warn!("{name}: invalid JobTimeoutSec={v}, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Unit] setting {other}");
            }
        }
    }
}

fn apply_bool(name: &str, key: &str, values: Vec<(u32, String)>, out: &mut bool) {
    if let Some(v) = single_value(name, key, values) {
        match parse_bool(&v) {
            Some(b) => *out = b,
            None => warn!("{name}: invalid boolean {key}={v}, skipping"),
        }
    }
}

fn apply_service_section(
    name: &str,
    section: ParsedSection,
    conf: &mut crate::units::ServiceConfig,
    declared_deps: &mut Vec<(DepKind, String)>,
) {
    for (key, values) in section {
        match key.as_str() {
            "TYPE" => {
                if let Some(v) = single_value(name, "Type", values) {
                    match v.as_str() {
                        "simple" => conf.service_type = ServiceType::Simple,
                        "oneshot" => conf.service_type = ServiceType::Oneshot,
                        other => warn!("{name}: unsupported Type={other}, keeping simple"),
                    }
                }
            }
            "EXECSTART" => {
                if let Some(v) = single_value(name, "ExecStart", values) {
                    conf.exec_start =
                        parse_commandline(name, "ExecStart", &expand_specifiers(&v, name));
                }
            }
            "EXECSTOP" => {
                if let Some(v) = single_value(name, "ExecStop", values) {
                    conf.exec_stop =
                        parse_commandline(name, "ExecStop", &expand_specifiers(&v, name));
                }
            }
            "EXECRELOAD" => {
                if let Some(v) = single_value(name, "ExecReload", values) {
                    conf.exec_reload =
                        parse_commandline(name, "ExecReload", &expand_specifiers(&v, name));
                }
            }
            "REMAINAFTEREXIT" => {
                apply_bool(name, "RemainAfterExit", values, &mut conf.remain_after_exit);
            }
            "ENVIRONMENT" => {
                for (_, value) in values {
                    let expanded = expand_specifiers(&value, name);
                    let Some(assignments) = shlex::split(&expanded) else {
                        warn!("{name}: cannot parse Environment={value}, skipping");
                        continue;
                    };
                    for assignment in assignments {
                        match assignment.split_once('=') {
                            Some((k, v)) => {
                                conf.environment.vars.push((k.to_owned(), v.to_owned()));
                            }
                            None => {
                                warn!("{name}: Environment entry without '=': {assignment}");
                            }
                        }
                    }
                }
            }
            "USER" => {
                if let Some(v) = single_value(name, "User", values) {
                    conf.user = Some(expand_specifiers(&v, name));
                }
            }
            "GROUP" => {
                if let Some(v) = single_value(name, "Group", values) {
                    conf.group = Some(expand_specifiers(&v, name));
                }
            }
            "NICE" => {
                if let Some(v) = single_value(name, "Nice", values) {
                    match parse_nice(&v) {
                        Some(nice) => conf.nice = Some(nice),
                        None => warn!("{name}: Nice={v} outside -20..19, skipping"),
                    }
                }
            }
            "OOMSCOREADJUST" => {
                if let Some(v) = single_value(name, "OOMScoreAdjust", values) {
                    match parse_oom_score_adjust(&v) {
                        Some(adjust) => conf.oom_score_adjust = Some(adjust),
                        None => warn!("{name}: OOMScoreAdjust={v} outside -1000..1000, skipping"),
                    }
                }
            }
            "WORKINGDIRECTORY" => {
                if let Some(v) = single_value(name, "WorkingDirectory", values) {
                    conf.working_directory = Some(PathBuf::from(expand_specifiers(&v, name)));
                }
            }
            "SOCKETS" => {
                for target in list_values(values) {
                    match UnitId::new(&target) {
                        Ok(id) if id.kind == UnitIdKind::Socket => {
                            declared_deps.push((DepKind::TriggeredBy, target));
                            conf.sockets.push(id);
                        }
                        _ => warn!("{name}: Sockets={target} is not a socket unit, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Service] setting {other}");
            }
        }
    }
}

fn apply_socket_section(
    name: &str,
    section: ParsedSection,
    conf: &mut crate::units::SocketConfig,
    declared_deps: &mut Vec<(DepKind, String)>,
) {
    for (key, values) in section {
        match key.as_str() {
            "LISTENSTREAM" => {
                for (_, v) in values {
                    conf.listen.push(ListenSpec::Stream(expand_specifiers(&v, name)));
                }
            }
            "LISTENDATAGRAM" => {
                for (_, v) in values {
                    conf.listen
                        .push(ListenSpec::Datagram(expand_specifiers(&v, name)));
                }
            }
            "LISTENFIFO" => {
                for (_, v) in values {
                    conf.listen
                        .push(ListenSpec::FifoPath(PathBuf::from(expand_specifiers(&v, name))));
                }
            }
            "SOCKETMODE" => {
                if let Some(v) = single_value(name, "SocketMode", values) {
                    match parse_mode(&v) {
                        Some(mode) => conf.socket_mode = mode,
                        None => warn!("{name}: SocketMode={v} outside 0000-07777, skipping"),
                    }
                }
            }
            "IPTOS" => {
                if let Some(v) = single_value(name, "IPTOS", values) {
                    match IpTos::from_keyword(&v) {
                        Some(tos) => conf.ip_tos = Some(tos),
                        None => warn!("{name}: unknown IPTOS keyword {v}, skipping"),
                    }
                }
            }
            "ACCEPT" => {
                apply_bool(name, "Accept", values, &mut conf.accept);
            }
            "SERVICE" => {
                if let Some(v) = single_value(name, "Service", values) {
                    match UnitId::new(&v) {
                        Ok(id) if id.kind == UnitIdKind::Service => {
                            declared_deps.push((DepKind::Triggers, v.clone()));
                            conf.service = Some(id);
                        }
                        _ => warn!("{name}: Service={v} is not a service unit, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Socket] setting {other}");
            }
        }
    }
}

fn apply_mount_section(name: &str, section: ParsedSection, conf: &mut crate::units::MountConfig) {
    for (key, values) in section {
        match key.as_str() {
            "WHAT" => {
                if let Some(v) = single_value(name, "What", values) {
                    conf.what = expand_specifiers(&v, name);
                }
            }
            "WHERE" => {
                if let Some(v) = single_value(name, "Where", values) {
                    conf.where_ = expand_specifiers(&v, name);
                }
            }
            "TYPE" => {
                if let Some(v) = single_value(name, "Type", values) {
                    conf.fs_type = Some(v);
                }
            }
            "OPTIONS" => {
                if let Some(v) = single_value(name, "Options", values) {
                    conf.options = Some(v);
                }
            }
            "DIRECTORYMODE" => {
                if let Some(v) = single_value(name, "DirectoryMode", values) {
                    match parse_mode(&v) {
                        Some(mode) => conf.directory_mode = mode,
                        None => warn!("{name}: DirectoryMode={v} outside 0000-07777, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Mount] setting {other}");
            }
        }
    }
}

fn apply_automount_section(
    name: &str,
    section: ParsedSection,
    conf: &mut crate::units::AutomountConfig,
) {
    for (key, values) in section {
        match key.as_str() {
            "WHERE" => {
                if let Some(v) = single_value(name, "Where", values) {
                    conf.where_ = expand_specifiers(&v, name);
                }
            }
            "DIRECTORYMODE" => {
                if let Some(v) = single_value(name, "DirectoryMode", values) {
                    match parse_mode(&v) {
                        Some(mode) => conf.directory_mode = mode,
                        None => warn!("{name}: DirectoryMode={v} outside 0000-07777, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Automount] setting {other}");
            }
        }
    }
}

fn apply_timer_section(
    name: &str,
    section: ParsedSection,
    conf: &mut crate::units::TimerConfig,
    declared_deps: &mut Vec<(DepKind, String)>,
) {
    for (key, values) in section {
        match key.as_str() {
            "ONBOOTSEC" => {
                if let Some(v) = single_value(name, "OnBootSec", values) {
                    match parse_duration(&v) {
                        Some(d) => conf.on_boot = Some(d),
                        None => warn!("{name}: invalid OnBootSec={v}, skipping"),
                    }
                }
            }
            "ONSTARTUPSEC" => {
                if let Some(v) = single_value(name, "OnStartupSec", values) {
                    match parse_duration(&v) {
                        Some(d) => conf.on_startup = Some(d),
                        None => warn!("{name}: invalid OnStartupSec={v}, skipping"),
                    }
                }
            }
            "ONUNITACTIVESEC" => {
                if let Some(v) = single_value(name, "OnUnitActiveSec", values) {
                    match parse_duration(&v) {
                        Some(d) => conf.on_unit_active = Some(d),
                        None => warn!("{name}: invalid OnUnitActiveSec={v}, skipping"),
                    }
                }
            }
            "UNIT" => {
                if let Some(v) = single_value(name, "Unit", values) {
                    match UnitId::new(&v) {
                        Ok(id) => {
                            declared_deps.push((DepKind::Triggers, v));
                            conf.unit = Some(id);
                        }
                        Err(e) => warn!("{name}: {e}, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Timer] setting {other}");
            }
        }
    }
}

fn apply_path_section(
    name: &str,
    section: ParsedSection,
    conf: &mut crate::units::PathConfig,
    declared_deps: &mut Vec<(DepKind, String)>,
) {
    for (key, values) in section {
        match key.as_str() {
            "PATHEXISTS" => {
                for (_, v) in values {
                    conf.path_exists
                        .push(PathBuf::from(expand_specifiers(&v, name)));
                }
            }
            "PATHCHANGED" => {
                for (_, v) in values {
                    conf.path_changed
                        .push(PathBuf::from(expand_specifiers(&v, name)));
                }
            }
            "DIRECTORYNOTEMPTY" => {
                for (_, v) in values {
                    conf.directory_not_empty
                        .push(PathBuf::from(expand_specifiers(&v, name)));
                }
            }
            "UNIT" => {
                if let Some(v) = single_value(name, "Unit", values) {
                    match UnitId::new(&v) {
                        Ok(id) => {
                            declared_deps.push((DepKind::Triggers, v));
                            conf.unit = Some(id);
                        }
                        Err(e) => warn!("{name}: {e}, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Path] setting {other}");
            }
        }
    }
}

fn apply_swap_section(name: &str, section: ParsedSection, conf: &mut crate::units::SwapConfig) {
    for (key, values) in section {
        match key.as_str() {
            "WHAT" => {
                if let Some(v) = single_value(name, "What", values) {
                    conf.what = expand_specifiers(&v, name);
                }
            }
            "PRIORITY" => {
                if let Some(v) = single_value(name, "Priority", values) {
                    match v.parse::<i32>() {
                        Ok(priority) => conf.priority = Some(priority),
                        Err(_) => warn!("{name}: invalid Priority={v}, skipping"),
                    }
                }
            }
            other => {
                warn!("{name}: ignoring unknown [Swap] setting {other}");
            }
        }
    }
}

fn warn_unknown_keys(name: &str, section: &str, parsed: &ParsedSection, known: &[&str]) {
    for key in parsed.keys() {
        if !known.contains(&key.as_str()) {
            warn!("{name}: ignoring unknown [{section}] setting {key}");
        }
    }
}
