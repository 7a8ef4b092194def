//! The transaction builder: from `(verb, unit, mode)` to a consistent,
//! conflict-free, acyclic set of candidate jobs, committed atomically.
//!
//! Construction runs in phases:
//!
//! 1. expand the anchor request along dependency edges
//! 2. break ordering cycles by deleting deletable (Wants-pulled) jobs
//! 3. drop jobs that would not change their unit's state
//! 4. reconcile with the live job table (merge or displace per mode)
//! 5. commit: assign ids, install on units, report what changed
//!
//! Failure in any phase leaves the registry and job table untouched.

use std::collections::{HashMap, HashSet};

use log::{debug, trace, warn};

use crate::jobs::{merge_kinds, Job, JobKind, JobMode, JobState, JobTable};
use crate::units::{DepKind, LoadState, UnitId, UnitRegistry};

#[derive(Debug)]
pub enum TransactionError {
    NotFound(UnitId),
    Masked(UnitId),
    OperationNotSupported(UnitId, JobKind),
    JobsConflict {
        unit: UnitId,
        existing: JobKind,
        requested: JobKind,
    },
    OrderingCycle(Vec<UnitId>),
    IsolateForbidden(UnitId),
    JobConflict {
        unit: UnitId,
        live: JobKind,
        requested: JobKind,
    },
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "unit {id} not found"),
            Self::Masked(id) => write!(f, "unit {id} is masked"),
            Self::OperationNotSupported(id, kind) => {
                write!(f, "job {kind} is not applicable to unit {id}")
            }
            Self::JobsConflict {
                unit,
                existing,
                requested,
            } => write!(
                f,
                "transaction needs both {existing} and {requested} for unit {unit}"
            ),
            Self::OrderingCycle(path) => {
                write!(f, "ordering cycle among transaction jobs:")?;
                for id in path {
                    write!(f, " {id}")?;
                }
                Ok(())
            }
            Self::IsolateForbidden(id) => write!(f, "unit {id} may not be isolated"),
            Self::JobConflict {
                unit,
                live,
                requested,
            } => write!(
                f,
                "requested {requested} for unit {unit} conflicts with installed {live} job"
            ),
        }
    }
}

impl std::error::Error for TransactionError {}

/// Loading hook used during expansion: referenced units must exist in the
/// registry before edges can be followed. The manager's fragment loader
/// implements this; tests usually pre-populate the registry and use
/// [`StubLoader`].
pub trait DepLoader {
    fn ensure_loaded(&mut self, registry: &mut UnitRegistry, id: &UnitId) -> LoadState;
}

/// Reports `NotFound` for anything not already in the registry.
pub struct StubLoader;

impl DepLoader for StubLoader {
    fn ensure_loaded(&mut self, registry: &mut UnitRegistry, id: &UnitId) -> LoadState {
        registry
            .get_by_id(id)
            .map(|u| u.load_state)
            .unwrap_or(LoadState::NotFound)
    }
}

#[derive(Clone, Debug)]
struct TxJob {
    kind: JobKind,
    /// Pulled in via a requirement edge (or is the anchor). Jobs that do
    /// not matter may be deleted to break cycles and are skipped silently
    /// when their unit cannot be loaded.
    required: bool,
}

/// The ephemeral candidate set. Lives from [`Transaction::build`] until
/// [`Transaction::commit`] installs it or it is dropped.
pub struct Transaction {
    pub anchor: UnitId,
    mode: JobMode,
    override_: bool,
    jobs: HashMap<UnitId, TxJob>,
}

/// What commit changed: the anchor's installed job id, all freshly
/// installed job ids, and the jobs displaced by replace-mode merging (the
/// engine finishes those with result `cancelled`).
pub struct CommitOutcome {
    pub anchor_job: u32,
    pub new_jobs: Vec<u32>,
    pub displaced_jobs: Vec<Job>,
}

impl Transaction {
    /// Phases 1–3. On success the transaction holds a candidate job per
    /// unit, conflict-free and acyclic.
    pub fn build(
        registry: &mut UnitRegistry,
        loader: &mut dyn DepLoader,
        kind: JobKind,
        name: &str,
        mode: JobMode,
        override_: bool,
    ) -> Result<Self, TransactionError> {
        let requested = UnitId::new(name).map_err(|_| {
            TransactionError::NotFound(UnitId {
                kind: crate::units::UnitIdKind::Service,
                name: name.to_owned(),
            })
        })?;

        match loader.ensure_loaded(registry, &requested) {
            LoadState::Masked => return Err(TransactionError::Masked(requested)),
            LoadState::NotFound | LoadState::Stub | LoadState::Error => {
                return Err(TransactionError::NotFound(requested));
            }
            LoadState::Loaded | LoadState::Merged => {}
        }
        // A merged name resolves to its surviving unit.
        let anchor = registry
            .canonical_id(name)
            .ok_or_else(|| TransactionError::NotFound(requested.clone()))?;

        if !anchor.kind.can_be_started() && kind != JobKind::Stop {
            return Err(TransactionError::OperationNotSupported(anchor, kind));
        }
        if mode == JobMode::Isolate {
            let unit = registry.get_by_id(&anchor).unwrap();
            let allowed =
                unit.config.allow_isolate || anchor.kind == crate::units::UnitIdKind::Snapshot;
            if !allowed {
                return Err(TransactionError::IsolateForbidden(anchor));
            }
        }

        let mut tx = Self {
            anchor: anchor.clone(),
            mode,
            override_,
            jobs: HashMap::new(),
        };

        tx.expand(registry, loader, anchor.clone(), kind, true, mode)?;

        if mode == JobMode::Isolate {
            tx.add_isolate_stops(registry);
        }

        tx.break_cycles(registry)?;
        tx.drop_redundant(registry);

        Ok(tx)
    }

    pub fn job_kinds(&self) -> HashMap<UnitId, JobKind> {
        self.jobs.iter().map(|(id, j)| (id.clone(), j.kind)).collect()
    }

    /// Phase 1: walk dependency edges from `id`, generating candidate jobs
    /// and merging when a unit is reached twice.
    fn expand(
        &mut self,
        registry: &mut UnitRegistry,
        loader: &mut dyn DepLoader,
        id: UnitId,
        kind: JobKind,
        required: bool,
        mode: JobMode,
    ) -> Result<(), TransactionError> {
        if !self.add_job(id.clone(), kind, required)? {
            return Ok(());
        }

        if mode == JobMode::IgnoreDependencies {
            return Ok(());
        }

        // (kind to pull, edge kinds, pulled job kind, pulled is required)
        struct Pull {
            edges: &'static [DepKind],
            job: JobKind,
            required: bool,
        }

        let follow_requirements = mode != JobMode::IgnoreRequirements;

        let pulls: Vec<Pull> = match kind {
            JobKind::Start | JobKind::ReloadOrStart | JobKind::Restart | JobKind::TryRestart => {
                let mut pulls = Vec::new();
                if follow_requirements {
                    pulls.push(Pull {
                        edges: &[
                            DepKind::Requires,
                            DepKind::RequiresOverridable,
                            DepKind::BindsTo,
                        ],
                        job: JobKind::Start,
                        required: true,
                    });
                    pulls.push(Pull {
                        edges: &[DepKind::Requisite, DepKind::RequisiteOverridable],
                        job: JobKind::VerifyActive,
                        required: true,
                    });
                }
                pulls.push(Pull {
                    edges: &[DepKind::Wants],
                    job: JobKind::Start,
                    required: false,
                });
                pulls.push(Pull {
                    edges: &[DepKind::Conflicts],
                    job: JobKind::Stop,
                    required: true,
                });
                pulls
            }
            JobKind::Stop => vec![Pull {
                edges: &[
                    DepKind::RequiredBy,
                    DepKind::RequiredByOverridable,
                    DepKind::BoundBy,
                ],
                job: JobKind::Stop,
                required: true,
            }],
            JobKind::Reload => vec![Pull {
                edges: &[DepKind::PropagatesReloadTo],
                job: JobKind::Reload,
                required: false,
            }],
            JobKind::VerifyActive => Vec::new(),
        };

        for pull in pulls {
            let mut targets: Vec<UnitId> = Vec::new();
            {
                let unit = registry
                    .get_by_id(&id)
                    .ok_or_else(|| TransactionError::NotFound(id.clone()))?;
                for edge in pull.edges {
                    targets.extend(unit.dependencies.of_kind(*edge).cloned());
                }
            }

            for target in targets {
                match loader.ensure_loaded(registry, &target) {
                    LoadState::Loaded | LoadState::Merged => {}
                    LoadState::Masked => {
                        // A stop pull on a masked or missing unit is
                        // trivially satisfied.
                        if pull.required && required && pull.job != JobKind::Stop {
                            return Err(TransactionError::Masked(target));
                        }
                        debug!("skipping masked dependency {target} of {id}");
                        continue;
                    }
                    LoadState::NotFound | LoadState::Stub | LoadState::Error => {
                        if pull.required && required && pull.job != JobKind::Stop {
                            return Err(TransactionError::NotFound(target));
                        }
                        debug!("skipping unloadable dependency {target} of {id}");
                        continue;
                    }
                }
                let target = match registry.canonical_id(&target.name) {
                    Some(canonical) => canonical,
                    None => continue,
                };
                if target == id {
                    continue;
                }
                if !target.kind.can_be_started() && pull.job != JobKind::Stop {
                    // Devices come and go with the kernel; pulling one in
                    // means waiting for it, not starting it, so it gets no
                    // job here.
                    trace!("not pulling unstartable unit {target}");
                    continue;
                }
                self.expand(
                    registry,
                    loader,
                    target,
                    pull.job,
                    pull.required && required,
                    mode,
                )?;
            }
        }

        Ok(())
    }

    /// Record a candidate job, merging with an existing candidate for the
    /// same unit. Returns whether the caller should recurse into `id`'s
    /// dependencies (new candidate or upgraded kind).
    fn add_job(
        &mut self,
        id: UnitId,
        kind: JobKind,
        required: bool,
    ) -> Result<bool, TransactionError> {
        match self.jobs.get_mut(&id) {
            None => {
                self.jobs.insert(id, TxJob { kind, required });
                Ok(true)
            }
            Some(existing) => {
                existing.required |= required;
                match merge_kinds(existing.kind, kind) {
                    Some(merged) => {
                        let changed = merged != existing.kind;
                        existing.kind = merged;
                        Ok(changed)
                    }
                    None => {
                        if !required {
                            // A non-required pull loses against whatever is
                            // already there.
                            debug!(
                                "dropping unmergeable non-required {kind} for {id} (keeping {})",
                                existing.kind
                            );
                            return Ok(false);
                        }
                        if !existing.required {
                            debug!(
                                "replacing non-required {} with required {kind} for {id}",
                                existing.kind
                            );
                            existing.kind = kind;
                            existing.required = true;
                            return Ok(true);
                        }
                        Err(TransactionError::JobsConflict {
                            unit: id,
                            existing: existing.kind,
                            requested: kind,
                        })
                    }
                }
            }
        }
    }

    /// Isolate mode: every active unit outside the transaction gets a stop
    /// job, unless it opted out or cannot be stopped.
    fn add_isolate_stops(&mut self, registry: &UnitRegistry) {
        let mut stops = Vec::new();
        for unit in registry.units() {
            if self.jobs.contains_key(&unit.id) {
                continue;
            }
            if unit.load_state == LoadState::Merged {
                continue;
            }
            if unit.config.ignore_on_isolate {
                continue;
            }
            if !unit.id.kind.can_be_started() {
                continue;
            }
            if unit.active_state().is_inactive_or_failed() && unit.job.is_none() {
                continue;
            }
            stops.push(unit.id.clone());
        }
        for id in stops {
            trace!("isolate: stopping {id}");
            self.jobs.insert(
                id,
                TxJob {
                    kind: JobKind::Stop,
                    required: false,
                },
            );
        }
    }

    /// Phase 2: delete After-cycles among the candidate jobs. A cycle is
    /// broken by deleting some member that is neither the anchor nor
    /// required; if no such member exists the transaction fails.
    fn break_cycles(&mut self, registry: &UnitRegistry) -> Result<(), TransactionError> {
        loop {
            let Some(cycle) = self.find_cycle(registry) else {
                return Ok(());
            };

            // Only transaction candidates can be deleted; installed jobs
            // reached through ordering edges stay.
            let victim = cycle
                .iter()
                .find(|id| {
                    **id != self.anchor && self.jobs.get(*id).is_some_and(|j| !j.required)
                })
                .cloned();

            match victim {
                Some(id) => {
                    warn!(
                        "breaking ordering cycle [{}] by deleting the job for {id}",
                        cycle
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(" -> ")
                    );
                    self.jobs.remove(&id);
                }
                None => return Err(TransactionError::OrderingCycle(cycle)),
            }
        }
    }

    /// DFS over the After-graph restricted to units with candidate jobs.
    fn find_cycle(&self, registry: &UnitRegistry) -> Option<Vec<UnitId>> {
        let mut finished: HashSet<UnitId> = HashSet::new();
        let mut stack: Vec<UnitId> = Vec::new();

        for start in self.jobs.keys() {
            if finished.contains(start) {
                continue;
            }
            if let Some(cycle) = self.cycle_dfs(registry, start, &mut stack, &mut finished) {
                return Some(cycle);
            }
        }
        None
    }

    fn cycle_dfs(
        &self,
        registry: &UnitRegistry,
        id: &UnitId,
        stack: &mut Vec<UnitId>,
        finished: &mut HashSet<UnitId>,
    ) -> Option<Vec<UnitId>> {
        if let Some(pos) = stack.iter().position(|s| s == id) {
            return Some(stack[pos..].to_vec());
        }
        if finished.contains(id) {
            return None;
        }

        stack.push(id.clone());
        if let Some(unit) = registry.get_by_id(id) {
            // Ordering constrains transaction candidates and already
            // installed jobs alike, so both count as graph nodes.
            let afters: Vec<UnitId> = unit
                .dependencies
                .of_kind(DepKind::After)
                .filter(|t| {
                    self.jobs.contains_key(*t)
                        || registry.get_by_id(t).is_some_and(|u| u.job.is_some())
                })
                .cloned()
                .collect();
            for target in afters {
                if let Some(cycle) = self.cycle_dfs(registry, &target, stack, finished) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        finished.insert(id.clone());
        None
    }

    /// Phase 3: drop candidates whose unit is already where the job would
    /// put it. The anchor survives; so do override jobs.
    fn drop_redundant(&mut self, registry: &UnitRegistry) {
        let anchor = self.anchor.clone();
        let override_ = self.override_;
        self.jobs.retain(|id, job| {
            if *id == anchor || override_ {
                return true;
            }
            let Some(unit) = registry.get_by_id(id) else {
                return false;
            };
            // A redundant candidate still matters if a live job is about to
            // move the unit away from the state we rely on.
            if unit.job.is_some() {
                return true;
            }
            let redundant = job.kind.is_redundant_for(unit.active_state());
            if redundant {
                trace!("dropping redundant {} job for {id}", job.kind);
            }
            !redundant
        });
    }

    /// Phases 4 and 5: reconcile with installed jobs, then install.
    ///
    /// On success every candidate is installed (merged into a live job or
    /// as a fresh one), units point at their jobs, and the displaced jobs
    /// are returned for the engine to finish as cancelled. On error nothing
    /// has been touched.
    pub fn commit(
        self,
        registry: &mut UnitRegistry,
        jobs: &mut JobTable,
    ) -> Result<CommitOutcome, TransactionError> {
        // Phase 4 first pass: decide the fate of every candidate without
        // mutating anything, so mode=fail aborts atomically.
        enum Fate {
            Fresh(UnitId, JobKind),
            MergeInto(u32, JobKind),
            Displace(UnitId, u32, JobKind),
        }

        let mut fates = Vec::new();
        for (id, tx_job) in &self.jobs {
            let unit = registry
                .get_by_id(id)
                .ok_or_else(|| TransactionError::NotFound(id.clone()))?;
            match unit.job.and_then(|job_id| jobs.get(job_id).map(|j| (job_id, j.kind))) {
                None => fates.push(Fate::Fresh(id.clone(), tx_job.kind)),
                Some((live_id, live_kind)) => match merge_kinds(live_kind, tx_job.kind) {
                    Some(merged) => fates.push(Fate::MergeInto(live_id, merged)),
                    None => match self.mode {
                        JobMode::Fail => {
                            return Err(TransactionError::JobConflict {
                                unit: id.clone(),
                                live: live_kind,
                                requested: tx_job.kind,
                            });
                        }
                        _ => fates.push(Fate::Displace(id.clone(), live_id, tx_job.kind)),
                    },
                },
            }
        }

        // Phase 5: install.
        let mut outcome = CommitOutcome {
            anchor_job: 0,
            new_jobs: Vec::new(),
            displaced_jobs: Vec::new(),
        };

        fn install(
            registry: &mut UnitRegistry,
            jobs: &mut JobTable,
            outcome: &mut CommitOutcome,
            anchor: &UnitId,
            mode: JobMode,
            override_: bool,
            id: UnitId,
            kind: JobKind,
        ) {
            let job_id = jobs.allocate_id();
            let deadline = registry
                .get_by_id(&id)
                .and_then(|u| u.config.job_timeout)
                .map(|t| std::time::Instant::now() + t);
            jobs.insert(Job {
                id: job_id,
                kind,
                unit: id.clone(),
                state: JobState::Waiting,
                mode,
                override_,
                in_run_queue: false,
                deadline,
            });
            registry.get_by_id_mut(&id).unwrap().job = Some(job_id);
            if id == *anchor {
                outcome.anchor_job = job_id;
            }
            outcome.new_jobs.push(job_id);
        }

        for fate in fates {
            match fate {
                Fate::MergeInto(live_id, merged) => {
                    let job = jobs.get_mut(live_id).unwrap();
                    if job.kind != merged {
                        trace!("job {live_id} for {}: {} merged to {merged}", job.unit, job.kind);
                        job.kind = merged;
                    }
                    job.override_ |= self.override_;
                    if job.unit == self.anchor {
                        outcome.anchor_job = live_id;
                    }
                }
                Fate::Fresh(id, kind) => {
                    install(
                        registry,
                        jobs,
                        &mut outcome,
                        &self.anchor,
                        self.mode,
                        self.override_,
                        id,
                        kind,
                    );
                }
                Fate::Displace(id, live_id, kind) => {
                    if let Some(mut displaced) = jobs.remove(live_id) {
                        trace!(
                            "job {live_id} ({} {}) displaced by replace transaction",
                            displaced.kind,
                            displaced.unit
                        );
                        displaced.in_run_queue = false;
                        outcome.displaced_jobs.push(displaced);
                    }
                    if let Some(unit) = registry.get_by_id_mut(&id) {
                        unit.job = None;
                    }
                    install(
                        registry,
                        jobs,
                        &mut outcome,
                        &self.anchor,
                        self.mode,
                        self.override_,
                        id,
                        kind,
                    );
                }
            }
        }

        debug_assert_ne!(outcome.anchor_job, 0, "anchor job must always be installed");
        Ok(outcome)
    }
}
