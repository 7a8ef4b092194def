//! Cross-component scenarios: transactions, the job engine, propagation,
//! and the control surface, driven end to end against a scripted broker.

mod control_socket;
mod lifecycle;
mod scenarios;

use std::cell::RefCell;
use std::rc::Rc;

use crate::broker::{BrokerLog, PidRole, ScriptedBroker};
use crate::config::{Config, RunningAs};
use crate::jobs::{BusEvent, JobResult};
use crate::manager::Manager;
use crate::units::{
    ActiveState, Commandline, DepKind, ListenSpec, LoadState, ServiceType, Specific, Unit,
    UnitId,
};

pub(crate) struct World {
    pub manager: Manager,
    pub broker: Rc<RefCell<BrokerLog>>,
}

pub(crate) fn world() -> World {
    let mut config = Config::default_for(RunningAs::Session);
    config.unit_dirs = Vec::new();
    let broker = ScriptedBroker::default();
    let log = broker.log.clone();
    World {
        manager: Manager::new(config, Box::new(broker)),
        broker: log,
    }
}

pub(crate) fn id(name: &str) -> UnitId {
    UnitId::new(name).unwrap()
}

impl World {
    /// A loaded simple service whose ExecStart program is `/bin/<stem>`.
    pub fn add_service(&mut self, name: &str) -> UnitId {
        self.add_service_of_type(name, ServiceType::Simple)
    }

    pub fn add_service_of_type(&mut self, name: &str, service_type: ServiceType) -> UnitId {
        let unit_id = id(name);
        let mut unit = Unit::stub(unit_id.clone());
        unit.load_state = LoadState::Loaded;
        if let Specific::Service(s) = &mut unit.specific {
            s.conf.service_type = service_type;
            s.conf.exec_start = Some(Commandline {
                cmd: format!("/bin/{}", name.trim_end_matches(".service")),
                args: Vec::new(),
            });
        }
        self.manager.registry.insert(unit).unwrap();
        unit_id
    }

    pub fn add_target(&mut self, name: &str) -> UnitId {
        let unit_id = id(name);
        let mut unit = Unit::stub(unit_id.clone());
        unit.load_state = LoadState::Loaded;
        self.manager.registry.insert(unit).unwrap();
        unit_id
    }

    pub fn add_socket(&mut self, name: &str, listen: Vec<ListenSpec>) -> UnitId {
        let unit_id = id(name);
        let mut unit = Unit::stub(unit_id.clone());
        unit.load_state = LoadState::Loaded;
        if let Specific::Socket(s) = &mut unit.specific {
            s.conf.listen = listen;
        }
        self.manager.registry.insert(unit).unwrap();
        unit_id
    }

    pub fn dep(&mut self, from: &UnitId, kind: DepKind, to: &UnitId) {
        self.manager.registry.add_dependency(from, kind, to, true).unwrap();
    }

    /// Requirement plus ordering in one call, the common shape.
    pub fn requires_after(&mut self, from: &UnitId, to: &UnitId) {
        self.dep(from, DepKind::Requires, to);
        self.dep(from, DepKind::After, to);
    }

    /// Force a service to look running, with a live main pid known to the
    /// pid table.
    pub fn make_running(&mut self, unit_id: &UnitId, pid: i32) {
        let unit = self.manager.registry.get_by_id_mut(unit_id).unwrap();
        unit.coldplug("running", Some(pid));
        self.manager.pids.insert(pid, (unit_id.clone(), PidRole::Main));
    }

    pub fn active_state(&self, unit_id: &UnitId) -> ActiveState {
        self.manager.registry.get_by_id(unit_id).unwrap().active_state()
    }

    /// `(unit name, result)` for every JobRemoved emitted so far, in order.
    pub fn job_removals(&self) -> Vec<(String, JobResult)> {
        self.manager
            .bus_events
            .iter()
            .filter_map(|e| match e {
                BusEvent::JobRemoved { unit, result, .. } => {
                    Some((unit.name.clone(), *result))
                }
                _ => None,
            })
            .collect()
    }

    pub fn job_news(&self) -> Vec<String> {
        self.manager
            .bus_events
            .iter()
            .filter_map(|e| match e {
                BusEvent::JobNew { unit, .. } => Some(unit.name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.manager.bus_events.clear();
    }

    pub fn assert_invariants(&self) {
        self.manager.registry.check_invariants().unwrap();
        // unique-job invariant: every unit's job back-pointer matches the
        // table and every job's unit points back
        for unit in self.manager.registry.units() {
            if let Some(job_id) = unit.job {
                let job = self
                    .manager
                    .jobs
                    .get(job_id)
                    .unwrap_or_else(|| panic!("{} points at missing job {job_id}", unit.id));
                assert_eq!(job.unit, unit.id, "job {job_id} unit back-pointer mismatch");
            }
        }
        for job in self.manager.jobs.jobs() {
            let unit = self
                .manager
                .registry
                .get_by_id(&job.unit)
                .unwrap_or_else(|| panic!("job {} for missing unit {}", job.id, job.unit));
            assert_eq!(unit.job, Some(job.id), "unit {} does not own job {}", unit.id, job.id);
        }
    }
}
