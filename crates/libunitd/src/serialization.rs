//! The re-execution blob: a newline-terminated stream of `key=value`
//! entries. Manager-level entries come first, then one block per unit,
//! each terminated by an empty line.
//!
//! File descriptors are not sent through the blob itself — exec preserves
//! fd numbers, so each unit block records `fd=<number> <role>` lines and
//! the fd store re-adopts those numbers on the other side. The caller is
//! responsible for clearing close-on-exec on the stored fds before the
//! exec (see `FdStore::prepare_inherit`).
//!
//! The format is deliberately dumb: it only has to survive an exec of the
//! same binary, not interchange.

use log::warn;

use crate::fd_store::{FdRole, FdStore};
use crate::jobs::{Job, JobKind, JobMode, JobState, JobTable};
use crate::units::{UnitId, UnitRegistry};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SerializedUnit {
    pub name: String,
    pub sub_state: String,
    pub main_pid: Option<i32>,
    pub job: Option<(u32, String)>,
    /// Inherited fd numbers with their roles, in store order.
    pub fds: Vec<(i32, String)>,
}

#[derive(Debug, Default)]
pub struct SerializedState {
    pub environment: Vec<(String, String)>,
    pub next_job_id: u32,
    pub units: Vec<SerializedUnit>,
}

pub fn serialize(
    registry: &UnitRegistry,
    jobs: &JobTable,
    environment: &[(String, String)],
    fd_store: &FdStore,
) -> String {
    let mut out = String::new();

    for (key, value) in environment {
        out.push_str(&format!("env={key}={value}\n"));
    }
    out.push_str(&format!("next-job-id={}\n", jobs.next_id()));
    out.push('\n');

    let mut ids: Vec<&UnitId> = registry.units().map(|u| &u.id).collect();
    ids.sort();
    for id in ids {
        let unit = registry.get_by_id(id).unwrap();
        out.push_str(&format!("unit={}\n", unit.id.name));
        out.push_str(&format!("sub-state={}\n", unit.sub_state()));
        if let Some(pid) = unit.main_pid() {
            out.push_str(&format!("main-pid={pid}\n"));
        }
        if let Some(job_id) = unit.job {
            if let Some(job) = jobs.get(job_id) {
                out.push_str(&format!("job={} {}\n", job.id, job.kind));
            }
        }
        for stored in fd_store.stored_for(&unit.id) {
            out.push_str(&format!("fd={} {}\n", stored.fd, stored.role.as_str()));
        }
        out.push('\n');
    }

    out
}

pub fn deserialize(input: &str) -> SerializedState {
    let mut state = SerializedState::default();
    let mut current: Option<SerializedUnit> = None;

    for line in input.lines() {
        if line.is_empty() {
            if let Some(unit) = current.take() {
                state.units.push(unit);
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("ignoring malformed serialization entry: {line}");
            continue;
        };
        match (&mut current, key) {
            (None, "env") => {
                if let Some((k, v)) = value.split_once('=') {
                    state.environment.push((k.to_owned(), v.to_owned()));
                }
            }
            (None, "next-job-id") => {
                state.next_job_id = value.parse().unwrap_or(0);
            }
            (_, "unit") => {
                if let Some(unit) = current.take() {
                    state.units.push(unit);
                }
                current = Some(SerializedUnit {
                    name: value.to_owned(),
                    ..Default::default()
                });
            }
            (Some(unit), "sub-state") => {
                unit.sub_state = value.to_owned();
            }
            (Some(unit), "main-pid") => {
                unit.main_pid = value.parse().ok();
            }
            (Some(unit), "job") => {
                if let Some((id, kind)) = value.split_once(' ') {
                    if let Ok(id) = id.parse() {
                        unit.job = Some((id, kind.to_owned()));
                    }
                }
            }
            (Some(unit), "fd") => {
                if let Some((fd, role)) = value.split_once(' ') {
                    if let Ok(fd) = fd.parse() {
                        unit.fds.push((fd, role.to_owned()));
                    }
                }
            }
            _ => {
                warn!("ignoring serialization entry {key}={value}");
            }
        }
    }
    if let Some(unit) = current.take() {
        state.units.push(unit);
    }

    state
}

/// Re-apply deserialized state onto a freshly loaded registry: sub-states
/// and main pids are coldplugged, installed jobs are re-created with their
/// old ids, and the inherited fds are adopted back into the fd store under
/// their owners.
pub fn apply(
    state: SerializedState,
    registry: &mut UnitRegistry,
    jobs: &mut JobTable,
    fd_store: &mut FdStore,
) {
    jobs.bump_next_id(state.next_job_id);

    for serialized in state.units {
        let Some(canonical) = registry.canonical_id(&serialized.name) else {
            warn!(
                "serialized state for unknown unit {}, discarding",
                serialized.name
            );
            for (fd, _) in &serialized.fds {
                // Nothing owns it anymore; do not leak it into children.
                crate::sockets::close_raw_fd(*fd);
            }
            continue;
        };
        let Some(unit) = registry.get_by_id_mut(&canonical) else {
            continue;
        };
        unit.coldplug(&serialized.sub_state, serialized.main_pid);

        if let Some((job_id, kind)) = serialized.job {
            let Some(kind) = JobKind::from_str(&kind) else {
                warn!("serialized job {job_id} has unknown kind {kind}, discarding");
                continue;
            };
            unit.job = Some(job_id);
            jobs.insert(Job {
                id: job_id,
                kind,
                unit: canonical.clone(),
                state: JobState::Waiting,
                mode: JobMode::Replace,
                override_: false,
                in_run_queue: false,
                deadline: None,
            });
            jobs.bump_next_id(job_id + 1);
        }

        for (fd, role) in serialized.fds {
            match FdRole::from_str(&role) {
                Some(role) => fd_store.adopt(&canonical, role, fd),
                None => {
                    warn!("fd {fd} of {canonical} has unknown role {role}, closing");
                    crate::sockets::close_raw_fd(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Unit, UnitId};

    #[test]
    fn roundtrip() {
        let mut registry = UnitRegistry::default();
        let mut jobs = JobTable::default();
        let mut fd_store = FdStore::default();

        let a = UnitId::new("a.service").unwrap();
        let b = UnitId::new("b.target").unwrap();
        let sock = UnitId::new("a.socket").unwrap();
        let mut unit_a = Unit::stub(a.clone());
        unit_a.coldplug("running", Some(4242));
        registry.insert(unit_a).unwrap();
        let mut unit_b = Unit::stub(b.clone());
        unit_b.coldplug("active", None);
        registry.insert(unit_b).unwrap();
        let mut unit_sock = Unit::stub(sock.clone());
        unit_sock.coldplug("listening", None);
        registry.insert(unit_sock).unwrap();
        // deliberately out-of-range numbers: the flag fiddling on
        // insert/adopt must tolerate fds this process does not hold
        fd_store.insert(&sock, FdRole::Listen, 907);
        fd_store.insert(&sock, FdRole::Listen, 908);

        let job_id = jobs.allocate_id();
        jobs.insert(Job {
            id: job_id,
            kind: JobKind::Stop,
            unit: a.clone(),
            state: JobState::Waiting,
            mode: JobMode::Replace,
            override_: false,
            in_run_queue: false,
            deadline: None,
        });
        registry.get_by_id_mut(&a).unwrap().job = Some(job_id);

        let env = vec![("PATH".to_owned(), "/bin".to_owned())];
        let blob = serialize(&registry, &jobs, &env, &fd_store);

        // rebuild a fresh world with stub units, as after reexec + reload
        let mut registry2 = UnitRegistry::default();
        registry2.insert(Unit::stub(a.clone())).unwrap();
        registry2.insert(Unit::stub(b.clone())).unwrap();
        registry2.insert(Unit::stub(sock.clone())).unwrap();
        let mut jobs2 = JobTable::default();
        let mut fd_store2 = FdStore::default();

        let state = deserialize(&blob);
        assert_eq!(state.environment, env);
        apply(state, &mut registry2, &mut jobs2, &mut fd_store2);

        let unit_a = registry2.get_by_id(&a).unwrap();
        assert_eq!(unit_a.sub_state(), "running");
        assert_eq!(unit_a.main_pid(), Some(4242));
        assert_eq!(unit_a.job, Some(job_id));
        assert_eq!(jobs2.get(job_id).unwrap().kind, JobKind::Stop);
        assert_eq!(registry2.get_by_id(&b).unwrap().sub_state(), "active");
        // the socket's fds came back under the same owner, same numbers
        assert_eq!(registry2.get_by_id(&sock).unwrap().sub_state(), "listening");
        assert_eq!(fd_store2.listen_fds_of(&sock), vec![907, 908]);
        // fresh ids keep increasing past the serialized ones
        assert!(jobs2.allocate_id() > job_id);
    }
}
