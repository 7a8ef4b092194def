//! Unit model: identifiers, load/active states, dependency edges, and the
//! per-type configuration and state machines.

mod registry;
mod unit;

pub mod loading;

pub use registry::*;
pub use unit::*;

use std::collections::{BTreeSet, HashMap};

/// The unit type, derived from the name suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitIdKind {
    Service,
    Socket,
    Target,
    Device,
    Mount,
    Automount,
    Timer,
    Path,
    Snapshot,
    Swap,
}

impl UnitIdKind {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            ".service" => Some(Self::Service),
            ".socket" => Some(Self::Socket),
            ".target" => Some(Self::Target),
            ".device" => Some(Self::Device),
            ".mount" => Some(Self::Mount),
            ".automount" => Some(Self::Automount),
            ".timer" => Some(Self::Timer),
            ".path" => Some(Self::Path),
            ".snapshot" => Some(Self::Snapshot),
            ".swap" => Some(Self::Swap),
            _ => None,
        }
    }

    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::Service => ".service",
            Self::Socket => ".socket",
            Self::Target => ".target",
            Self::Device => ".device",
            Self::Mount => ".mount",
            Self::Automount => ".automount",
            Self::Timer => ".timer",
            Self::Path => ".path",
            Self::Snapshot => ".snapshot",
            Self::Swap => ".swap",
        }
    }

    /// Device units are driven by kernel events, snapshots by the control
    /// interface; neither can be started by a job.
    pub const fn can_be_started(&self) -> bool {
        !matches!(self, Self::Device)
    }

    /// Types that never take an `@instance` component.
    pub const fn no_instances(&self) -> bool {
        matches!(self, Self::Device | Self::Snapshot)
    }

    /// Snapshots are synthesized at runtime and never load from a fragment.
    pub const fn has_fragment(&self) -> bool {
        !matches!(self, Self::Snapshot | Self::Device)
    }

    /// Types excluded when recording a snapshot of the current state.
    pub const fn no_snapshots(&self) -> bool {
        matches!(self, Self::Snapshot | Self::Device)
    }
}

/// Canonical identifier of a unit: its primary name plus the type decoded
/// from the suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    pub kind: UnitIdKind,
    pub name: String,
}

impl UnitId {
    pub fn new(name: &str) -> Result<Self, String> {
        let dot = name
            .rfind('.')
            .ok_or_else(|| format!("{name} is not a valid unit name: no suffix"))?;
        let kind = UnitIdKind::from_suffix(&name[dot..])
            .ok_or_else(|| format!("{name} is not a valid unit name: unknown suffix"))?;
        Ok(Self {
            kind,
            name: name.to_owned(),
        })
    }
}

impl std::convert::TryFrom<&str> for UnitId {
    type Error = String;
    fn try_from(name: &str) -> Result<Self, String> {
        Self::new(name)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How (whether) the unit's definition has been brought into memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Stub,
    Loaded,
    Merged,
    Masked,
    Error,
    NotFound,
}

impl LoadState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::Loaded => "loaded",
            Self::Merged => "merged",
            Self::Masked => "masked",
            Self::Error => "error",
            Self::NotFound => "not-found",
        }
    }
}

/// The coarse lifecycle state, derived from the type-specific sub-state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Failed,
    Reloading,
    Maintenance,
}

impl ActiveState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
            Self::Reloading => "reloading",
            Self::Maintenance => "maintenance",
        }
    }

    pub const fn is_active_or_reloading(&self) -> bool {
        matches!(self, Self::Active | Self::Reloading)
    }

    pub const fn is_inactive_or_failed(&self) -> bool {
        matches!(self, Self::Inactive | Self::Failed)
    }
}

impl std::fmt::Display for ActiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed dependency edges. Every forward kind has an inverse kind that the
/// registry maintains on the target unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    Requires,
    RequiresOverridable,
    Requisite,
    RequisiteOverridable,
    Wants,
    BindsTo,
    RequiredBy,
    RequiredByOverridable,
    WantedBy,
    BoundBy,
    Conflicts,
    ConflictedBy,
    Before,
    After,
    OnFailure,
    OnFailureOf,
    Triggers,
    TriggeredBy,
    PropagatesReloadTo,
    ReloadPropagatedFrom,
}

impl DepKind {
    /// The kind recorded on the target when an edge of this kind is added.
    pub const fn inverse(self) -> Self {
        match self {
            Self::Requires => Self::RequiredBy,
            Self::RequiresOverridable => Self::RequiredByOverridable,
            Self::Requisite => Self::RequiredBy,
            Self::RequisiteOverridable => Self::RequiredByOverridable,
            Self::Wants => Self::WantedBy,
            Self::BindsTo => Self::BoundBy,
            Self::RequiredBy => Self::Requires,
            Self::RequiredByOverridable => Self::RequiresOverridable,
            Self::WantedBy => Self::Wants,
            Self::BoundBy => Self::BindsTo,
            Self::Conflicts => Self::ConflictedBy,
            Self::ConflictedBy => Self::Conflicts,
            Self::Before => Self::After,
            Self::After => Self::Before,
            Self::OnFailure => Self::OnFailureOf,
            Self::OnFailureOf => Self::OnFailure,
            Self::Triggers => Self::TriggeredBy,
            Self::TriggeredBy => Self::Triggers,
            Self::PropagatesReloadTo => Self::ReloadPropagatedFrom,
            Self::ReloadPropagatedFrom => Self::PropagatesReloadTo,
        }
    }

    /// Directive name in the `[Unit]` section, where one exists.
    pub fn from_directive(key: &str) -> Option<Self> {
        match key {
            "REQUIRES" => Some(Self::Requires),
            "REQUIRESOVERRIDABLE" => Some(Self::RequiresOverridable),
            "REQUISITE" => Some(Self::Requisite),
            "REQUISITEOVERRIDABLE" => Some(Self::RequisiteOverridable),
            "WANTS" => Some(Self::Wants),
            "BINDTO" | "BINDSTO" => Some(Self::BindsTo),
            "CONFLICTS" => Some(Self::Conflicts),
            "BEFORE" => Some(Self::Before),
            "AFTER" => Some(Self::After),
            "ONFAILURE" => Some(Self::OnFailure),
            "PROPAGATESRELOADTO" => Some(Self::PropagatesReloadTo),
            "RELOADPROPAGATEDFROM" => Some(Self::ReloadPropagatedFrom),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Requires => "Requires",
            Self::RequiresOverridable => "RequiresOverridable",
            Self::Requisite => "Requisite",
            Self::RequisiteOverridable => "RequisiteOverridable",
            Self::Wants => "Wants",
            Self::BindsTo => "BindsTo",
            Self::RequiredBy => "RequiredBy",
            Self::RequiredByOverridable => "RequiredByOverridable",
            Self::WantedBy => "WantedBy",
            Self::BoundBy => "BoundBy",
            Self::Conflicts => "Conflicts",
            Self::ConflictedBy => "ConflictedBy",
            Self::Before => "Before",
            Self::After => "After",
            Self::OnFailure => "OnFailure",
            Self::OnFailureOf => "OnFailureOf",
            Self::Triggers => "Triggers",
            Self::TriggeredBy => "TriggeredBy",
            Self::PropagatesReloadTo => "PropagatesReloadTo",
            Self::ReloadPropagatedFrom => "ReloadPropagatedFrom",
        }
    }

    pub const ALL: [DepKind; 20] = [
        Self::Requires,
        Self::RequiresOverridable,
        Self::Requisite,
        Self::RequisiteOverridable,
        Self::Wants,
        Self::BindsTo,
        Self::RequiredBy,
        Self::RequiredByOverridable,
        Self::WantedBy,
        Self::BoundBy,
        Self::Conflicts,
        Self::ConflictedBy,
        Self::Before,
        Self::After,
        Self::OnFailure,
        Self::OnFailureOf,
        Self::Triggers,
        Self::TriggeredBy,
        Self::PropagatesReloadTo,
        Self::ReloadPropagatedFrom,
    ];
}

/// The dependency edges of one unit: a map from kind to the set of targets.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    edges: HashMap<DepKind, BTreeSet<UnitId>>,
}

impl Dependencies {
    /// Record an edge. Idempotent; returns whether the edge was new.
    pub fn insert(&mut self, kind: DepKind, target: UnitId) -> bool {
        self.edges.entry(kind).or_default().insert(target)
    }

    pub fn remove(&mut self, kind: DepKind, target: &UnitId) -> bool {
        self.edges
            .get_mut(&kind)
            .map(|set| set.remove(target))
            .unwrap_or(false)
    }

    pub fn contains(&self, kind: DepKind, target: &UnitId) -> bool {
        self.edges
            .get(&kind)
            .map(|set| set.contains(target))
            .unwrap_or(false)
    }

    pub fn of_kind(&self, kind: DepKind) -> impl Iterator<Item = &UnitId> {
        self.edges.get(&kind).into_iter().flatten()
    }

    pub fn kinds(&self) -> impl Iterator<Item = (DepKind, &BTreeSet<UnitId>)> + '_ {
        DepKind::ALL.iter().filter_map(move |k| {
            self.edges
                .get(k)
                .filter(|set| !set.is_empty())
                .map(|set| (*k, set))
        })
    }

    /// Drop every edge pointing at `target`, across all kinds.
    pub fn retain_not(&mut self, target: &UnitId) {
        for set in self.edges.values_mut() {
            set.remove(target);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.values().all(BTreeSet::is_empty)
    }
}
