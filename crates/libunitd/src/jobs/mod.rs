//! Jobs: pending or running requests to drive a unit into a new state.

pub mod engine;
pub mod transaction;

pub use engine::*;
pub use transaction::*;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::units::{ActiveState, UnitId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Start,
    VerifyActive,
    Stop,
    Reload,
    ReloadOrStart,
    Restart,
    TryRestart,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::VerifyActive => "verify-active",
            Self::Stop => "stop",
            Self::Reload => "reload",
            Self::ReloadOrStart => "reload-or-start",
            Self::Restart => "restart",
            Self::TryRestart => "try-restart",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "verify-active" => Some(Self::VerifyActive),
            "stop" => Some(Self::Stop),
            "reload" => Some(Self::Reload),
            "reload-or-start" => Some(Self::ReloadOrStart),
            "restart" => Some(Self::Restart),
            "try-restart" => Some(Self::TryRestart),
            _ => None,
        }
    }

    /// Ordering direction: start-like jobs wait for `After` predecessors,
    /// stop-like jobs (which includes restarts, since they stop first) wait
    /// for `Before` predecessors.
    pub const fn is_stop_like(&self) -> bool {
        matches!(self, Self::Stop | Self::Restart | Self::TryRestart)
    }

    /// Whether running this job when the unit is already in `state` would
    /// change nothing.
    pub const fn is_redundant_for(&self, state: ActiveState) -> bool {
        match self {
            Self::Start | Self::VerifyActive => state.is_active_or_reloading(),
            Self::Stop => matches!(
                state,
                ActiveState::Inactive | ActiveState::Failed | ActiveState::Maintenance
            ),
            Self::Reload => matches!(state, ActiveState::Reloading),
            Self::ReloadOrStart | Self::Restart | Self::TryRestart => false,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed merge table: the result of collapsing two job kinds for the
/// same unit, or `None` when they conflict. Stop merges with nothing but
/// itself.
pub fn merge_kinds(a: JobKind, b: JobKind) -> Option<JobKind> {
    use JobKind::*;

    if a == b {
        return Some(a);
    }
    // normalize so the match below only needs one triangle of the matrix
    let (a, b) = if rank(a) <= rank(b) { (a, b) } else { (b, a) };

    match (a, b) {
        (Start, VerifyActive) => Some(Start),
        (Start, Reload) => Some(ReloadOrStart),
        (Start, ReloadOrStart) => Some(ReloadOrStart),
        (Start, Restart) => Some(Restart),
        (Start, TryRestart) => Some(Restart),
        (VerifyActive, Reload) => Some(Reload),
        (VerifyActive, ReloadOrStart) => Some(ReloadOrStart),
        (VerifyActive, Restart) => Some(Restart),
        (VerifyActive, TryRestart) => Some(TryRestart),
        (Reload, ReloadOrStart) => Some(ReloadOrStart),
        (Reload, Restart) => Some(Restart),
        (Reload, TryRestart) => Some(TryRestart),
        (ReloadOrStart, Restart) => Some(Restart),
        (ReloadOrStart, TryRestart) => Some(Restart),
        (Restart, TryRestart) => Some(Restart),
        _ => None,
    }
}

const fn rank(kind: JobKind) -> u8 {
    match kind {
        JobKind::Start => 0,
        JobKind::VerifyActive => 1,
        JobKind::Stop => 2,
        JobKind::Reload => 3,
        JobKind::ReloadOrStart => 4,
        JobKind::Restart => 5,
        JobKind::TryRestart => 6,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobMode {
    Replace,
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
}

impl JobMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "replace" => Some(Self::Replace),
            "fail" => Some(Self::Fail),
            "isolate" => Some(Self::Isolate),
            "ignore-dependencies" => Some(Self::IgnoreDependencies),
            "ignore-requirements" => Some(Self::IgnoreRequirements),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Fail => "fail",
            Self::Isolate => "isolate",
            Self::IgnoreDependencies => "ignore-dependencies",
            Self::IgnoreRequirements => "ignore-requirements",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Running,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Failed,
    Cancelled,
    Timeout,
    Dependency,
    Skipped,
}

impl JobResult {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Dependency => "dependency",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Job {
    pub id: u32,
    pub kind: JobKind,
    pub unit: UnitId,
    pub state: JobState,
    pub mode: JobMode,
    pub override_: bool,
    pub in_run_queue: bool,
    pub deadline: Option<Instant>,
}

/// All installed jobs by id, plus the run-queue of jobs eligible to
/// execute. Ids are monotonic for the lifetime of the manager.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<u32, Job>,
    run_queue: VecDeque<u32>,
    next_id: u32,
}

impl JobTable {
    pub fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Used by deserialization to keep ids monotonic across re-execution.
    pub fn bump_next_id(&mut self, at_least: u32) {
        if self.next_id < at_least {
            self.next_id = at_least;
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn remove(&mut self, id: u32) -> Option<Job> {
        self.run_queue.retain(|queued| *queued != id);
        self.jobs.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.jobs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn enqueue_runnable(&mut self, id: u32) {
        if let Some(job) = self.jobs.get_mut(&id) {
            if !job.in_run_queue {
                job.in_run_queue = true;
                self.run_queue.push_back(id);
            }
        }
    }

    pub fn pop_runnable(&mut self) -> Option<u32> {
        let id = self.run_queue.pop_front()?;
        if let Some(job) = self.jobs.get_mut(&id) {
            job.in_run_queue = false;
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_symmetric_and_total_over_non_stop() {
        use JobKind::*;
        let kinds = [Start, VerifyActive, Stop, Reload, ReloadOrStart, Restart, TryRestart];
        for &a in &kinds {
            for &b in &kinds {
                assert_eq!(merge_kinds(a, b), merge_kinds(b, a), "{a} vs {b}");
                if a != Stop && b != Stop {
                    assert!(merge_kinds(a, b).is_some(), "{a} vs {b} should merge");
                }
            }
        }
    }

    #[test]
    fn merge_table_spot_checks() {
        use JobKind::*;
        assert_eq!(merge_kinds(Start, VerifyActive), Some(Start));
        assert_eq!(merge_kinds(Start, Reload), Some(ReloadOrStart));
        assert_eq!(merge_kinds(Reload, VerifyActive), Some(Reload));
        assert_eq!(merge_kinds(TryRestart, VerifyActive), Some(TryRestart));
        assert_eq!(merge_kinds(TryRestart, Start), Some(Restart));
        assert_eq!(merge_kinds(Stop, Start), None);
        assert_eq!(merge_kinds(Stop, Reload), None);
        assert_eq!(merge_kinds(Stop, Stop), Some(Stop));
    }

    #[test]
    fn redundancy() {
        assert!(JobKind::Start.is_redundant_for(ActiveState::Active));
        assert!(!JobKind::Start.is_redundant_for(ActiveState::Inactive));
        assert!(JobKind::Stop.is_redundant_for(ActiveState::Inactive));
        assert!(JobKind::Stop.is_redundant_for(ActiveState::Failed));
        assert!(!JobKind::Restart.is_redundant_for(ActiveState::Active));
    }

    #[test]
    fn run_queue_membership_is_tracked() {
        let mut table = JobTable::default();
        let id = table.allocate_id();
        table.insert(Job {
            id,
            kind: JobKind::Start,
            unit: UnitId::new("a.service").unwrap(),
            state: JobState::Waiting,
            mode: JobMode::Replace,
            override_: false,
            in_run_queue: false,
            deadline: None,
        });
        table.enqueue_runnable(id);
        table.enqueue_runnable(id);
        assert_eq!(table.pop_runnable(), Some(id));
        assert_eq!(table.pop_runnable(), None);
    }
}
