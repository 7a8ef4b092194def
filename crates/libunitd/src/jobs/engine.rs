//! The job engine: drives the run-queue, finishes jobs on unit state
//! changes, propagates requirement failures, and enforces deadlines.
//!
//! The engine owns job bookkeeping only. Side effects that create *new*
//! jobs (OnFailure=, reload propagation, BindsTo= stop cascades) live in
//! the manager, which interleaves engine calls with transaction builds.

use std::time::Instant;

use log::{debug, trace, warn};

use crate::broker::ExecContext;
use crate::conditions;
use crate::jobs::{JobKind, JobResult, JobState, JobTable};
use crate::units::{ActiveState, DepKind, UnitId, UnitRegistry};

/// Signals emitted towards control subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    UnitNew { id: UnitId },
    UnitRemoved { id: UnitId },
    JobNew { id: u32, unit: UnitId },
    JobRemoved { id: u32, unit: UnitId, result: JobResult },
}

/// An observed active-state transition, to be fed back through
/// [`on_unit_state_change`] and the manager's propagation rules.
pub type StateChange = (UnitId, ActiveState, ActiveState);

/// A job may run once every ordering predecessor has settled: a start-like
/// job waits for jobs on the units it is `After` (and on its `Conflicts`
/// victims), a stop-like job waits for jobs on the units it is `Before`.
pub fn job_runnable(job_id: u32, registry: &UnitRegistry, jobs: &JobTable) -> bool {
    let Some(job) = jobs.get(job_id) else {
        return false;
    };
    let Some(unit) = registry.get_by_id(&job.unit) else {
        return false;
    };

    let blocked_by_job_on = |id: &UnitId| -> bool {
        registry
            .get_by_id(id)
            .and_then(|u| u.job)
            .is_some_and(|other| other != job_id && jobs.get(other).is_some())
    };

    if job.kind.is_stop_like() {
        !unit.dependencies.of_kind(DepKind::Before).any(blocked_by_job_on)
    } else {
        !unit.dependencies.of_kind(DepKind::After).any(blocked_by_job_on)
            && !unit
                .dependencies
                .of_kind(DepKind::Conflicts)
                .any(blocked_by_job_on)
    }
}

/// Put every waiting job whose predecessors are satisfied on the run-queue.
pub fn rescan_run_queue(registry: &UnitRegistry, jobs: &mut JobTable) {
    let candidates: Vec<u32> = jobs
        .jobs()
        .filter(|j| j.state == JobState::Waiting && !j.in_run_queue)
        .map(|j| j.id)
        .collect();
    for id in candidates {
        if job_runnable(id, registry, jobs) {
            jobs.enqueue_runnable(id);
        }
    }
}

/// Pop and execute one eligible job. Returns `false` when the run-queue is
/// empty. State transitions caused by the invoked operation are appended to
/// `changes` for the caller to feed back through [`on_unit_state_change`].
pub fn run_next(
    registry: &mut UnitRegistry,
    jobs: &mut JobTable,
    ctx: &mut ExecContext,
    events: &mut Vec<BusEvent>,
    changes: &mut Vec<StateChange>,
) -> bool {
    let Some(job_id) = jobs.pop_runnable() else {
        return false;
    };
    let Some(job) = jobs.get(job_id) else {
        return true;
    };
    let unit_id = job.unit.clone();
    let mut kind = job.kind;

    if !registry.contains(&unit_id) {
        finish_job(registry, jobs, job_id, JobResult::Failed, events);
        return true;
    }
    let unit = registry.get_by_id_mut(&unit_id).unwrap();
    let state = unit.active_state();

    // Collapse compound kinds against the current state.
    match kind {
        JobKind::TryRestart => {
            if state.is_inactive_or_failed() {
                // Nothing running, nothing to do.
                finish_job(registry, jobs, job_id, JobResult::Done, events);
                return true;
            }
            kind = JobKind::Restart;
        }
        JobKind::ReloadOrStart => {
            kind = if state.is_active_or_reloading() {
                JobKind::Reload
            } else {
                JobKind::Start
            };
        }
        _ => {}
    }

    match kind {
        JobKind::Start => {
            if state.is_active_or_reloading() {
                finish_job(registry, jobs, job_id, JobResult::Done, events);
                return true;
            }
            if !conditions::test_list(&unit.conditions) {
                debug!("{unit_id}: condition check failed, skipping start");
                finish_job(registry, jobs, job_id, JobResult::Skipped, events);
                return true;
            }
            let old = state;
            let result = unit.start(ctx);
            let new = unit.active_state();
            if old != new {
                changes.push((unit_id.clone(), old, new));
            }
            match result {
                Ok(()) => {
                    jobs.get_mut(job_id).unwrap().state = JobState::Running;
                }
                Err(e) => {
                    warn!("{e}");
                    finish_job(registry, jobs, job_id, JobResult::Failed, events);
                }
            }
        }
        JobKind::VerifyActive => {
            let result = if state.is_active_or_reloading() {
                JobResult::Done
            } else {
                JobResult::Failed
            };
            finish_job(registry, jobs, job_id, result, events);
        }
        JobKind::Stop => {
            if state.is_inactive_or_failed() {
                finish_job(registry, jobs, job_id, JobResult::Done, events);
                return true;
            }
            let old = state;
            let result = unit.stop(ctx);
            let new = unit.active_state();
            if old != new {
                changes.push((unit_id.clone(), old, new));
            }
            match result {
                Ok(()) => {
                    jobs.get_mut(job_id).unwrap().state = JobState::Running;
                }
                Err(e) => {
                    warn!("{e}");
                    finish_job(registry, jobs, job_id, JobResult::Failed, events);
                }
            }
        }
        JobKind::Reload => {
            if !state.is_active_or_reloading() {
                // Nothing to reload; treat like try-restart on a dead unit.
                finish_job(registry, jobs, job_id, JobResult::Done, events);
                return true;
            }
            let old = state;
            let result = unit.reload(ctx);
            let new = unit.active_state();
            if old != new {
                changes.push((unit_id.clone(), old, new));
            }
            match result {
                Ok(()) => {
                    jobs.get_mut(job_id).unwrap().state = JobState::Running;
                }
                Err(e) => {
                    warn!("{e}");
                    finish_job(registry, jobs, job_id, JobResult::Failed, events);
                }
            }
        }
        JobKind::Restart => {
            // Stop first; on_unit_state_change converts the job to a start
            // once the unit reaches inactive.
            if state.is_inactive_or_failed() {
                convert_restart_to_start(jobs, job_id);
                rescan_run_queue(registry, jobs);
                return true;
            }
            let old = state;
            let result = unit.stop(ctx);
            let new = unit.active_state();
            if old != new {
                changes.push((unit_id.clone(), old, new));
            }
            match result {
                Ok(()) => {
                    jobs.get_mut(job_id).unwrap().state = JobState::Running;
                }
                Err(e) => {
                    warn!("{e}");
                    finish_job(registry, jobs, job_id, JobResult::Failed, events);
                }
            }
        }
        JobKind::ReloadOrStart | JobKind::TryRestart => unreachable!("collapsed above"),
    }

    // The operation may have settled the unit synchronously (targets,
    // sockets, simple services); let the bookkeeping catch up immediately.
    let settled: Vec<StateChange> = std::mem::take(changes);
    for (id, old, new) in &settled {
        on_unit_state_change(registry, jobs, id, *old, *new, events);
    }
    *changes = settled;

    true
}

/// Translate a unit's active-state transition into job completion
/// (spec rules: start jobs finish on `active`, stop jobs on `inactive` or
/// `failed`), and convert restart jobs into their start phase.
pub fn on_unit_state_change(
    registry: &mut UnitRegistry,
    jobs: &mut JobTable,
    id: &UnitId,
    old: ActiveState,
    new: ActiveState,
    events: &mut Vec<BusEvent>,
) {
    let Some(job_id) = registry.get_by_id(id).and_then(|u| u.job) else {
        return;
    };
    let Some(job) = jobs.get(job_id) else {
        return;
    };
    if job.state != JobState::Running {
        // Waiting jobs are not watching this unit yet.
        return;
    }

    match job.kind {
        JobKind::Start | JobKind::ReloadOrStart | JobKind::VerifyActive => match new {
            ActiveState::Active => {
                finish_job(registry, jobs, job_id, JobResult::Done, events);
            }
            ActiveState::Inactive => {
                // Activation that settles at inactive is a completed
                // oneshot when it came through activating, otherwise the
                // unit died under the job.
                let result = if old == ActiveState::Activating {
                    JobResult::Done
                } else {
                    JobResult::Failed
                };
                finish_job(registry, jobs, job_id, result, events);
            }
            ActiveState::Failed => {
                finish_job(registry, jobs, job_id, JobResult::Failed, events);
            }
            _ => {}
        },
        JobKind::Stop => {
            if new.is_inactive_or_failed() {
                finish_job(registry, jobs, job_id, JobResult::Done, events);
            }
        }
        JobKind::Reload => match new {
            ActiveState::Active => {
                finish_job(registry, jobs, job_id, JobResult::Done, events);
            }
            ActiveState::Failed | ActiveState::Inactive => {
                finish_job(registry, jobs, job_id, JobResult::Failed, events);
            }
            _ => {}
        },
        JobKind::Restart | JobKind::TryRestart => {
            if new.is_inactive_or_failed() {
                convert_restart_to_start(jobs, job_id);
                rescan_run_queue(registry, jobs);
            }
        }
    }
}

fn convert_restart_to_start(jobs: &mut JobTable, job_id: u32) {
    if let Some(job) = jobs.get_mut(job_id) {
        trace!("job {job_id}: restart of {} enters start phase", job.unit);
        job.kind = JobKind::Start;
        job.state = JobState::Waiting;
    }
}

/// Finish a job: detach it from its unit and the table, emit `JobRemoved`,
/// cascade requirement failures, and wake newly eligible jobs.
pub fn finish_job(
    registry: &mut UnitRegistry,
    jobs: &mut JobTable,
    job_id: u32,
    result: JobResult,
    events: &mut Vec<BusEvent>,
) {
    let Some(job) = jobs.remove(job_id) else {
        return;
    };
    let unit_id = job.unit.clone();
    if let Some(unit) = registry.get_by_id_mut(&unit_id) {
        if unit.job == Some(job_id) {
            unit.job = None;
        }
    }

    debug!("job {job_id} ({} {}) finished: {result}", job.kind, unit_id);
    events.push(BusEvent::JobRemoved {
        id: job_id,
        unit: unit_id.clone(),
        result,
    });

    // Requirement failures cascade: a start-like job on a unit that
    // requires this one cannot succeed anymore. Wants-pulled jobs are
    // unaffected because wanting units carry no Requires edge.
    if matches!(result, JobResult::Failed | JobResult::Timeout | JobResult::Dependency)
        && !job.kind.is_stop_like()
    {
        let dependents: Vec<(UnitId, u32)> = registry
            .get_by_id(&unit_id)
            .map(|unit| {
                [
                    DepKind::RequiredBy,
                    DepKind::RequiredByOverridable,
                    DepKind::BoundBy,
                ]
                .iter()
                .flat_map(|kind| unit.dependencies.of_kind(*kind))
                .filter_map(|dep| {
                    registry
                        .get_by_id(dep)
                        .and_then(|u| u.job)
                        .map(|job_id| (dep.clone(), job_id))
                })
                .collect()
            })
            .unwrap_or_default();

        for (dep_id, dep_job_id) in dependents {
            let Some(dep_job) = jobs.get(dep_job_id) else {
                continue;
            };
            if !dep_job.kind.is_stop_like() && dep_job.kind != JobKind::Reload {
                debug!(
                    "job {dep_job_id} for {dep_id} fails: required dependency {unit_id} failed"
                );
                finish_job(registry, jobs, dep_job_id, JobResult::Dependency, events);
            }
        }
    }

    rescan_run_queue(registry, jobs);
}

/// Enforce per-job deadlines: a running job past its deadline escalates the
/// unit towards a forced stop and finishes with `timeout`.
pub fn check_timeouts(
    registry: &mut UnitRegistry,
    jobs: &mut JobTable,
    ctx: &mut ExecContext,
    events: &mut Vec<BusEvent>,
    changes: &mut Vec<StateChange>,
    now: Instant,
) {
    let expired: Vec<u32> = jobs
        .jobs()
        .filter(|j| j.state == JobState::Running && j.deadline.is_some_and(|d| d <= now))
        .map(|j| j.id)
        .collect();

    for job_id in expired {
        let Some(job) = jobs.get(job_id) else {
            continue;
        };
        let unit_id = job.unit.clone();
        warn!("job {job_id} for {unit_id} timed out");
        if let Some(unit) = registry.get_by_id_mut(&unit_id) {
            let old = unit.active_state();
            unit.escalate_stop(ctx);
            let new = unit.active_state();
            if old != new {
                changes.push((unit_id.clone(), old, new));
            }
        }
        finish_job(registry, jobs, job_id, JobResult::Timeout, events);
    }
}

/// The earliest pending deadline, for the poll loop's timeout.
pub fn next_deadline(jobs: &JobTable) -> Option<Instant> {
    jobs.jobs()
        .filter(|j| j.state == JobState::Running)
        .filter_map(|j| j.deadline)
        .min()
}
