//! The manager: the single owning value behind the event loop. It holds
//! the registry, the job table, the process broker, and the pid table, and
//! implements the propagation rules that turn unit state changes into new
//! work (OnFailure=, reload propagation, BindsTo= stop cascades, trigger
//! re-arming, snapshot cleanup).
//!
//! Everything here runs on the loop task; methods take `&mut self` and no
//! locks exist anywhere.

use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::broker::{ExecContext, PidTable, ProcessBroker};
use crate::config::Config;
use crate::fd_store::FdStore;
use crate::jobs::{
    engine, BusEvent, JobKind, JobMode, JobResult, StateChange, JobTable, Transaction,
    TransactionError,
};
use crate::serialization;
use crate::signal_handler::ChildTermination;
use crate::units::loading::{self, FragmentLoader};
use crate::units::{
    ActiveState, DepKind, LoadState, PlainSub, SnapshotSpecific, Specific, SocketSub, Unit,
    UnitId, UnitIdKind, WaitingSub,
};
use crate::units::UnitRegistry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set by control commands; the event loop acts on it between iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Objective {
    Reload,
    Reexecute,
    Exit,
}

pub struct Manager {
    pub config: Config,
    pub registry: UnitRegistry,
    pub jobs: JobTable,
    pub broker: Box<dyn ProcessBroker>,
    pub pids: PidTable,
    /// Unit-owned fds (listen sockets), kept across re-execution.
    pub fd_store: FdStore,
    pub environment: Vec<(String, String)>,
    /// Signals not yet flushed to control subscribers.
    pub bus_events: Vec<BusEvent>,
    pub objective: Option<Objective>,
    pub boot_timestamp: chrono::DateTime<chrono::Local>,
    snapshot_counter: u32,
    pending_changes: Vec<StateChange>,
}

impl Manager {
    pub fn new(config: Config, broker: Box<dyn ProcessBroker>) -> Self {
        Self {
            config,
            registry: UnitRegistry::default(),
            jobs: JobTable::default(),
            broker,
            pids: PidTable::default(),
            fd_store: FdStore::default(),
            environment: Vec::new(),
            bus_events: Vec::new(),
            objective: None,
            boot_timestamp: chrono::Local::now(),
            snapshot_counter: 0,
            pending_changes: Vec::new(),
        }
    }

    /// Eagerly load every fragment in the lookup paths.
    pub fn load_all(&mut self) {
        loading::load_all_units(&self.config.unit_dirs, &mut self.registry);
        info!(
            "loaded {} units ({} names)",
            self.registry.len(),
            self.registry.n_names()
        );
    }

    /// Alias-aware lookup, loading the unit on demand.
    pub fn load_unit(&mut self, name: &str) -> Result<UnitId, String> {
        let id = UnitId::new(name)?;
        let loader = FragmentLoader::new(self.config.unit_dirs.clone());
        match loader.load_into(&mut self.registry, &id) {
            LoadState::Loaded | LoadState::Merged | LoadState::Masked => {}
            LoadState::Stub | LoadState::NotFound => {
                return Err(format!("unit {name} not found"));
            }
            LoadState::Error => return Err(format!("unit {name} failed to load")),
        }
        self.registry
            .canonical_id(name)
            .ok_or_else(|| format!("unit {name} not found"))
    }

    /// Install a transaction and drive the run-queue until it settles.
    /// This is the entry point for control requests.
    pub fn enqueue_job(
        &mut self,
        kind: JobKind,
        name: &str,
        mode: JobMode,
        override_: bool,
    ) -> Result<u32, TransactionError> {
        let anchor_job = self.install_job(kind, name, mode, override_)?;
        self.drive();
        Ok(anchor_job)
    }

    /// Install without driving; used by the propagation rules so the outer
    /// drive loop picks the new jobs up.
    fn install_job(
        &mut self,
        kind: JobKind,
        name: &str,
        mode: JobMode,
        override_: bool,
    ) -> Result<u32, TransactionError> {
        let mut loader = FragmentLoader::new(self.config.unit_dirs.clone());
        let tx = Transaction::build(
            &mut self.registry,
            &mut loader,
            kind,
            name,
            mode,
            override_,
        )?;
        let outcome = tx.commit(&mut self.registry, &mut self.jobs)?;

        for displaced in outcome.displaced_jobs {
            debug!(
                "job {} ({} {}) cancelled by replacing transaction",
                displaced.id, displaced.kind, displaced.unit
            );
            self.bus_events.push(BusEvent::JobRemoved {
                id: displaced.id,
                unit: displaced.unit,
                result: JobResult::Cancelled,
            });
        }
        for job_id in &outcome.new_jobs {
            if let Some(job) = self.jobs.get(*job_id) {
                self.bus_events.push(BusEvent::JobNew {
                    id: *job_id,
                    unit: job.unit.clone(),
                });
            }
        }
        engine::rescan_run_queue(&self.registry, &mut self.jobs);
        Ok(outcome.anchor_job)
    }

    /// Run jobs and apply propagation until nothing moves anymore.
    pub fn drive(&mut self) {
        loop {
            engine::rescan_run_queue(&self.registry, &mut self.jobs);

            let mut progressed = false;
            loop {
                let mut changes: Vec<StateChange> = Vec::new();
                let ran = {
                    let mut ctx = ExecContext {
                        broker: self.broker.as_mut(),
                        pids: &mut self.pids,
                        fd_store: &mut self.fd_store,
                    };
                    engine::run_next(
                        &mut self.registry,
                        &mut self.jobs,
                        &mut ctx,
                        &mut self.bus_events,
                        &mut changes,
                    )
                };
                if !ran {
                    break;
                }
                progressed = true;
                self.pending_changes.extend(changes);
                self.apply_pending_changes();
            }

            if self.apply_pending_changes() {
                continue;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Apply the §4.5-style side effects for every recorded state change.
    /// Returns whether any new jobs were installed.
    fn apply_pending_changes(&mut self) -> bool {
        let mut installed_any = false;
        while !self.pending_changes.is_empty() {
            let changes = std::mem::take(&mut self.pending_changes);
            for (id, old, new) in changes {
                trace!("{id}: {old} -> {new}");
                installed_any |= self.propagate_state_change(&id, old, new);
            }
        }
        installed_any
    }

    fn propagate_state_change(&mut self, id: &UnitId, _old: ActiveState, new: ActiveState) -> bool {
        let mut installed = false;

        // Failure handlers: each OnFailure= target is started.
        if new == ActiveState::Failed {
            let handlers: Vec<UnitId> = self
                .registry
                .get_by_id(id)
                .map(|u| u.dependencies.of_kind(DepKind::OnFailure).cloned().collect())
                .unwrap_or_default();
            for handler in handlers {
                info!("{id} failed, starting {handler}");
                match self.install_job(JobKind::Start, &handler.name, JobMode::Replace, false) {
                    Ok(_) => installed = true,
                    Err(e) => warn!("{id}: cannot start failure handler {handler}: {e}"),
                }
            }
        }

        if new.is_inactive_or_failed() {
            // Re-arm triggering sockets: a socket whose service went down
            // goes back to listening for the next connection.
            let triggered_by: Vec<UnitId> = self
                .registry
                .get_by_id(id)
                .map(|u| u.dependencies.of_kind(DepKind::TriggeredBy).cloned().collect())
                .unwrap_or_default();
            for source in triggered_by {
                if let Some(unit) = self.registry.get_by_id_mut(&source) {
                    if let Specific::Socket(s) = &mut unit.specific {
                        if s.sub == SocketSub::Running {
                            trace!("{source}: back to listening");
                            s.sub = SocketSub::Listening;
                        }
                    }
                }
            }

            // Bound units follow this unit down.
            let bound: Vec<UnitId> = self
                .registry
                .get_by_id(id)
                .map(|u| u.dependencies.of_kind(DepKind::BoundBy).cloned().collect())
                .unwrap_or_default();
            for dependent in bound {
                let needs_stop = self
                    .registry
                    .get_by_id(&dependent)
                    .map(|u| !u.active_state().is_inactive_or_failed())
                    .unwrap_or(false);
                if needs_stop {
                    debug!("{dependent} is bound to {id}, stopping");
                    match self.install_job(JobKind::Stop, &dependent.name, JobMode::Replace, false)
                    {
                        Ok(_) => installed = true,
                        Err(e) => warn!("{id}: cannot stop bound unit {dependent}: {e}"),
                    }
                }
            }
        }

        // Reload propagation to dependents that opted in.
        if new == ActiveState::Reloading {
            let propagate: Vec<UnitId> = self
                .registry
                .get_by_id(id)
                .map(|u| {
                    u.dependencies
                        .of_kind(DepKind::PropagatesReloadTo)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for dependent in propagate {
                let active = self
                    .registry
                    .get_by_id(&dependent)
                    .map(|u| u.active_state().is_active_or_reloading())
                    .unwrap_or(false);
                if active {
                    match self.install_job(
                        JobKind::Reload,
                        &dependent.name,
                        JobMode::Replace,
                        false,
                    ) {
                        Ok(_) => installed = true,
                        Err(e) => warn!("{id}: cannot propagate reload to {dependent}: {e}"),
                    }
                }
            }
        }

        // A snapshot created with cleanup=true disappears once activated.
        if new == ActiveState::Active && id.kind == UnitIdKind::Snapshot {
            let cleanup = matches!(
                self.registry.get_by_id(id).map(|u| &u.specific),
                Some(Specific::Snapshot(SnapshotSpecific { conf, .. })) if conf.cleanup
            );
            if cleanup {
                debug!("removing snapshot {id} after activation");
                self.remove_unit(id);
            }
        }

        installed
    }

    /// A reaped child is routed to its unit's state machine by pid.
    pub fn notify_child_exit(&mut self, pid: i32, termination: ChildTermination) {
        let Some((unit_id, role)) = self.pids.remove(&pid) else {
            trace!("exit of unknown child {pid} ({termination})");
            return;
        };
        debug!("{unit_id}: child {pid} {termination}");

        let Some(unit) = self.registry.get_by_id_mut(&unit_id) else {
            return;
        };
        let old = unit.active_state();
        {
            let mut ctx = ExecContext {
                broker: self.broker.as_mut(),
                pids: &mut self.pids,
                fd_store: &mut self.fd_store,
            };
            unit.notify_exited(role, termination.success(), &mut ctx);
        }
        let new = unit.active_state();
        if old != new {
            engine::on_unit_state_change(
                &mut self.registry,
                &mut self.jobs,
                &unit_id,
                old,
                new,
                &mut self.bus_events,
            );
            self.pending_changes.push((unit_id, old, new));
        }
        self.drive();
    }

    /// Deadline enforcement plus timer elapses; called from the event loop.
    pub fn tick(&mut self, now: Instant) {
        {
            let mut changes: Vec<StateChange> = Vec::new();
            let mut ctx = ExecContext {
                broker: self.broker.as_mut(),
                pids: &mut self.pids,
                fd_store: &mut self.fd_store,
            };
            engine::check_timeouts(
                &mut self.registry,
                &mut self.jobs,
                &mut ctx,
                &mut self.bus_events,
                &mut changes,
                now,
            );
            self.pending_changes.extend(changes);
        }

        let elapsed: Vec<UnitId> = self
            .registry
            .units()
            .filter_map(|u| match &u.specific {
                Specific::Timer(t)
                    if t.sub == WaitingSub::Waiting && t.next_elapse.is_some_and(|e| e <= now) =>
                {
                    Some(u.id.clone())
                }
                _ => None,
            })
            .collect();
        for id in elapsed {
            info!("timer {id} elapsed");
            if let Some(unit) = self.registry.get_by_id_mut(&id) {
                if let Specific::Timer(t) = &mut unit.specific {
                    t.next_elapse = t.conf.on_unit_active.map(|d| now + d);
                    if t.next_elapse.is_none() {
                        t.sub = WaitingSub::Running;
                    }
                }
            }
            self.fire_trigger(&id);
        }

        self.drive();
    }

    /// A trigger source (socket connection, timer elapse, path event)
    /// fired: pull every `Triggers` target active.
    pub fn fire_trigger(&mut self, id: &UnitId) {
        let targets: Vec<UnitId> = self
            .registry
            .get_by_id(id)
            .map(|u| u.dependencies.of_kind(DepKind::Triggers).cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            return;
        }
        if let Some(unit) = self.registry.get_by_id_mut(id) {
            match &mut unit.specific {
                Specific::Socket(s) if s.sub == SocketSub::Listening => {
                    s.sub = SocketSub::Running;
                }
                Specific::Path(p) if p.sub == WaitingSub::Waiting => {
                    p.sub = WaitingSub::Running;
                }
                _ => {}
            }
        }
        for target in targets {
            match self.install_job(JobKind::Start, &target.name, JobMode::Replace, false) {
                Ok(_) => {}
                Err(e) => warn!("{id}: cannot start triggered unit {target}: {e}"),
            }
        }
        self.drive();
    }

    /// The earliest instant `tick` needs to run again.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let deadline = engine::next_deadline(&self.jobs);
        let timer = self
            .registry
            .units()
            .filter_map(|u| match &u.specific {
                Specific::Timer(t) if t.sub == WaitingSub::Waiting => t.next_elapse,
                _ => None,
            })
            .min();
        match (deadline, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Device appeared/disappeared (from the uevent collaborator).
    pub fn device_event(&mut self, sysfs_path: &str, plugged: bool) {
        let name = crate::unit_name::name_from_path(sysfs_path, ".device");
        let id = match UnitId::new(&name) {
            Ok(id) => id,
            Err(e) => {
                warn!("cannot map device path {sysfs_path}: {e}");
                return;
            }
        };
        if !self.registry.contains(&id) {
            let mut unit = Unit::stub(id.clone());
            unit.load_state = LoadState::Loaded;
            if let Specific::Device(d) = &mut unit.specific {
                d.conf.sysfs = Some(sysfs_path.to_owned());
            }
            if self.registry.insert(unit).is_err() {
                return;
            }
            self.bus_events.push(BusEvent::UnitNew { id: id.clone() });
        }

        let Some(unit) = self.registry.get_by_id_mut(&id) else {
            return;
        };
        let old = unit.active_state();
        if let Specific::Device(d) = &mut unit.specific {
            d.sub = if plugged {
                crate::units::DeviceSub::Plugged
            } else {
                crate::units::DeviceSub::Dead
            };
        }
        let new = unit.active_state();
        if old != new {
            engine::on_unit_state_change(
                &mut self.registry,
                &mut self.jobs,
                &id,
                old,
                new,
                &mut self.bus_events,
            );
            self.pending_changes.push((id, old, new));
            self.drive();
        }
    }

    /// Rescan fragments in place, carrying runtime state over. The control
    /// layer holds its reply until this returns.
    pub fn reload(&mut self) {
        info!("reloading unit fragments");
        let mut fresh = UnitRegistry::default();
        loading::load_all_units(&self.config.unit_dirs, &mut fresh);

        // Carry live state onto the freshly loaded units.
        for unit in self.registry.units() {
            if fresh.canonical_id(&unit.id.name).is_some() {
                let sub = unit.sub_state().to_owned();
                let pid = unit.main_pid();
                let job = unit.job;
                if let Some(new_unit) = fresh.get_mut(&unit.id.name) {
                    new_unit.coldplug(&sub, pid);
                    new_unit.job = job;
                }
            }
        }

        // Units that disappeared take their jobs with them.
        let mut removed: Vec<UnitId> = Vec::new();
        for unit in self.registry.units() {
            if fresh.canonical_id(&unit.id.name).is_none() {
                removed.push(unit.id.clone());
            }
        }
        for id in &removed {
            if let Some(job_id) = self.registry.get_by_id(id).and_then(|u| u.job) {
                if self.jobs.remove(job_id).is_some() {
                    self.bus_events.push(BusEvent::JobRemoved {
                        id: job_id,
                        unit: id.clone(),
                        result: JobResult::Cancelled,
                    });
                }
            }
            self.fd_store.close_unit(id);
            self.bus_events.push(BusEvent::UnitRemoved { id: id.clone() });
        }
        let mut added: Vec<UnitId> = Vec::new();
        for unit in fresh.units() {
            if self.registry.canonical_id(&unit.id.name).is_none() {
                added.push(unit.id.clone());
            }
        }
        for id in added {
            self.bus_events.push(BusEvent::UnitNew { id });
        }

        self.registry = fresh;
        engine::rescan_run_queue(&self.registry, &mut self.jobs);
        self.drive();
    }

    pub fn serialize_state(&self) -> String {
        serialization::serialize(&self.registry, &self.jobs, &self.environment, &self.fd_store)
    }

    /// Re-adopt state after re-execution: call after `load_all`.
    pub fn deserialize_state(&mut self, blob: &str) {
        let state = serialization::deserialize(blob);
        self.environment = state.environment.clone();
        serialization::apply(
            state,
            &mut self.registry,
            &mut self.jobs,
            &mut self.fd_store,
        );
        // Re-adopt running processes by pid.
        let mains: Vec<(i32, UnitId)> = self
            .registry
            .units()
            .filter_map(|u| u.main_pid().map(|pid| (pid, u.id.clone())))
            .collect();
        for (pid, id) in mains {
            self.pids.insert(pid, (id, crate::broker::PidRole::Main));
        }
        engine::rescan_run_queue(&self.registry, &mut self.jobs);
    }

    /// Record the currently-active units as a snapshot unit that can be
    /// isolated back to later.
    pub fn create_snapshot(
        &mut self,
        name: Option<&str>,
        cleanup: bool,
    ) -> Result<UnitId, String> {
        let name = match name {
            Some(name) => {
                let name = if name.ends_with(".snapshot") {
                    name.to_owned()
                } else {
                    format!("{name}.snapshot")
                };
                if self.registry.canonical_id(&name).is_some() {
                    return Err(format!("snapshot name {name} already taken"));
                }
                name
            }
            None => loop {
                self.snapshot_counter += 1;
                let candidate = format!("snapshot-{}.snapshot", self.snapshot_counter);
                if self.registry.canonical_id(&candidate).is_none() {
                    break candidate;
                }
            },
        };

        let id = UnitId::new(&name)?;
        let members: Vec<UnitId> = self
            .registry
            .units()
            .filter(|u| {
                !u.id.kind.no_snapshots()
                    && u.active_state().is_active_or_reloading()
                    && u.load_state != LoadState::Merged
            })
            .map(|u| u.id.clone())
            .collect();

        let mut unit = Unit::stub(id.clone());
        unit.load_state = LoadState::Loaded;
        unit.description = format!("Snapshot {name}");
        unit.config.allow_isolate = true;
        if let Specific::Snapshot(s) = &mut unit.specific {
            s.conf.cleanup = cleanup;
            s.sub = PlainSub::Dead;
        }
        self.registry.insert(unit).map_err(|e| e.to_string())?;

        for member in &members {
            let _ = self.registry.add_dependency(&id, DepKind::Wants, member, true);
            let _ = self.registry.add_dependency(&id, DepKind::After, member, true);
        }
        info!("created snapshot {id} with {} members", members.len());
        self.bus_events.push(BusEvent::UnitNew { id: id.clone() });
        Ok(id)
    }

    /// Drop a unit from the registry, cancelling its job and closing any
    /// fds it left in the store.
    pub fn remove_unit(&mut self, id: &UnitId) {
        if let Some(job_id) = self.registry.get_by_id(id).and_then(|u| u.job) {
            if self.jobs.remove(job_id).is_some() {
                self.bus_events.push(BusEvent::JobRemoved {
                    id: job_id,
                    unit: id.clone(),
                    result: JobResult::Cancelled,
                });
            }
        }
        self.fd_store.close_unit(id);
        if self.registry.remove(id).is_some() {
            self.bus_events.push(BusEvent::UnitRemoved { id: id.clone() });
        }
    }

    /// Cancel every installed job.
    pub fn clear_jobs(&mut self) {
        for job_id in self.jobs.ids() {
            if let Some(job) = self.jobs.remove(job_id) {
                if let Some(unit) = self.registry.get_by_id_mut(&job.unit) {
                    unit.job = None;
                }
                self.bus_events.push(BusEvent::JobRemoved {
                    id: job_id,
                    unit: job.unit,
                    result: JobResult::Cancelled,
                });
            }
        }
    }

    pub fn set_environment(&mut self, assignments: &[String]) {
        for assignment in assignments {
            match assignment.split_once('=') {
                Some((key, value)) => {
                    self.environment.retain(|(k, _)| k != key);
                    self.environment.push((key.to_owned(), value.to_owned()));
                }
                None => warn!("ignoring environment assignment without '=': {assignment}"),
            }
        }
    }

    pub fn unset_environment(&mut self, names: &[String]) {
        for name in names {
            self.environment.retain(|(k, _)| k != name);
        }
    }

    /// The human-readable state dump, also served over the control socket.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "-> manager: {} units, {} jobs", self.registry.len(), self.jobs.len());

        let mut ids = self.registry.ids();
        ids.sort();
        for id in ids {
            let unit = self.registry.get_by_id(&id).unwrap();
            let _ = writeln!(
                out,
                "-> unit {} ({})",
                unit.id,
                unit.load_state.as_str()
            );
            if unit.load_state == LoadState::Merged {
                continue;
            }
            let _ = writeln!(
                out,
                "\tactive: {} ({})",
                unit.active_state(),
                unit.sub_state()
            );
            if !unit.description.is_empty() {
                let _ = writeln!(out, "\tdescription: {}", unit.description);
            }
            for name in &unit.names {
                if *name != unit.id.name {
                    let _ = writeln!(out, "\talias: {name}");
                }
            }
            if let Some(path) = &unit.fragment_path {
                let _ = writeln!(out, "\tfragment: {}", path.display());
            }
            for condition in &unit.conditions {
                let _ = writeln!(out, "\tcondition: {condition}");
            }
            for (kind, targets) in unit.dependencies.kinds() {
                for target in targets {
                    let _ = writeln!(out, "\t{}: {target}", kind.as_str());
                }
            }
            if let Some(job_id) = unit.job {
                if let Some(job) = self.jobs.get(job_id) {
                    let _ = writeln!(out, "\tjob: {} {} ({})", job.id, job.kind, job.state.as_str());
                }
            }
            for stored in self.fd_store.stored_for(&unit.id) {
                let _ = writeln!(out, "\tfd: {} ({})", stored.fd, stored.role.as_str());
            }
        }

        let mut job_ids = self.jobs.ids();
        job_ids.sort_unstable();
        for job_id in job_ids {
            let job = self.jobs.get(job_id).unwrap();
            let _ = writeln!(
                out,
                "-> job {}: {} {} ({})",
                job.id,
                job.kind,
                job.unit,
                job.state.as_str()
            );
        }
        out
    }
}
