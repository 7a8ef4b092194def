//! The unit registry: every unit by canonical id, every name (alias) mapped
//! to its unit, and centralized dependency edge maintenance.
//!
//! Edge discipline: all edges are added and removed through
//! [`UnitRegistry::add_dependency`] / [`UnitRegistry::remove_dependency`],
//! which keep the reverse edge on the target in sync. Nothing else touches
//! two units' edge sets at once, so the symmetry invariant holds globally.

use std::collections::HashMap;

use log::{trace, warn};

use crate::units::{DepKind, LoadState, Unit, UnitId};

#[derive(Debug)]
pub enum RegistryError {
    NameTaken(String),
    NoSuchUnit(String),
    SelfDependency(UnitId),
    MergeWithJob(UnitId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameTaken(name) => write!(f, "name {name} already maps to a different unit"),
            Self::NoSuchUnit(name) => write!(f, "no unit known under the name {name}"),
            Self::SelfDependency(id) => write!(f, "refusing self-dependency on {id}"),
            Self::MergeWithJob(id) => {
                write!(f, "cannot merge {id} away while it has an installed job")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
pub struct UnitRegistry {
    units: HashMap<UnitId, Unit>,
    aliases: HashMap<String, UnitId>,
}

impl UnitRegistry {
    /// Alias-aware lookup.
    pub fn get(&self, name: &str) -> Option<&Unit> {
        let id = self.aliases.get(name)?;
        self.units.get(id)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Unit> {
        let id = self.aliases.get(name)?.clone();
        self.units.get_mut(&id)
    }

    pub fn get_by_id(&self, id: &UnitId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn get_by_id_mut(&mut self, id: &UnitId) -> Option<&mut Unit> {
        self.units.get_mut(id)
    }

    /// The canonical id a name resolves to.
    pub fn canonical_id(&self, name: &str) -> Option<UnitId> {
        self.aliases.get(name).cloned()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn units_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.units.values_mut()
    }

    pub fn ids(&self) -> Vec<UnitId> {
        self.units.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn n_names(&self) -> usize {
        self.aliases.len()
    }

    /// Register a unit under all of its names. Fails without side effects
    /// if any name is already taken by a different unit.
    pub fn insert(&mut self, unit: Unit) -> Result<(), RegistryError> {
        for name in &unit.names {
            if let Some(existing) = self.aliases.get(name) {
                if *existing != unit.id {
                    return Err(RegistryError::NameTaken(name.clone()));
                }
            }
        }
        for name in &unit.names {
            self.aliases.insert(name.clone(), unit.id.clone());
        }
        trace!("registered unit {} ({} names)", unit.id, unit.names.len());
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// Remove a unit and all of its alias entries. The caller is expected
    /// to have dealt with the unit's job. Dangling edges on other units are
    /// cleaned up here.
    pub fn remove(&mut self, id: &UnitId) -> Option<Unit> {
        let unit = self.units.remove(id)?;
        for name in &unit.names {
            if self.aliases.get(name) == Some(id) {
                self.aliases.remove(name);
            }
        }
        for other in self.units.values_mut() {
            other.dependencies.retain_not(id);
        }
        trace!("removed unit {id}");
        Some(unit)
    }

    /// Make `alias` another name for `id`.
    pub fn add_alias(&mut self, id: &UnitId, alias: &str) -> Result<(), RegistryError> {
        if let Some(existing) = self.aliases.get(alias) {
            if existing == id {
                return Ok(());
            }
            return Err(RegistryError::NameTaken(alias.to_owned()));
        }
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| RegistryError::NoSuchUnit(id.name.clone()))?;
        unit.names.insert(alias.to_owned());
        self.aliases.insert(alias.to_owned(), id.clone());
        Ok(())
    }

    /// Add a typed edge from `source` to `target`, installing the reverse
    /// edge on the target. Idempotent; self-edges are refused.
    pub fn add_dependency(
        &mut self,
        source: &UnitId,
        kind: DepKind,
        target: &UnitId,
        add_reverse: bool,
    ) -> Result<bool, RegistryError> {
        if source == target {
            return Err(RegistryError::SelfDependency(source.clone()));
        }
        if !self.units.contains_key(target) {
            return Err(RegistryError::NoSuchUnit(target.name.clone()));
        }
        let unit = self
            .units
            .get_mut(source)
            .ok_or_else(|| RegistryError::NoSuchUnit(source.name.clone()))?;
        let fresh = unit.dependencies.insert(kind, target.clone());
        if add_reverse {
            let reverse = self.units.get_mut(target).unwrap();
            reverse.dependencies.insert(kind.inverse(), source.clone());
        }
        Ok(fresh)
    }

    /// Remove an edge and its reverse.
    pub fn remove_dependency(&mut self, source: &UnitId, kind: DepKind, target: &UnitId) {
        if let Some(unit) = self.units.get_mut(source) {
            unit.dependencies.remove(kind, target);
        }
        if let Some(unit) = self.units.get_mut(target) {
            unit.dependencies.remove(kind.inverse(), source);
        }
    }

    /// Merge `from` into `into`: aliases move over, every edge touching
    /// `from` is rewritten to touch `into`, and `from` stays behind as an
    /// empty husk in load state `merged`.
    ///
    /// When both sides are fully loaded the first-loaded (`into`) config
    /// wins; the merge is lossy and a warning says so.
    pub fn merge(&mut self, into: &UnitId, from: &UnitId) -> Result<(), RegistryError> {
        if into == from {
            return Ok(());
        }
        if !self.units.contains_key(into) {
            return Err(RegistryError::NoSuchUnit(into.name.clone()));
        }
        {
            let from_unit = self
                .units
                .get(from)
                .ok_or_else(|| RegistryError::NoSuchUnit(from.name.clone()))?;
            if from_unit.job.is_some() {
                return Err(RegistryError::MergeWithJob(from.clone()));
            }
            if from_unit.load_state == LoadState::Loaded {
                warn!(
                    "merging loaded unit {from} into {into}: the configuration of {from} is \
                     discarded in favor of {into}"
                );
            }
        }

        // Move names.
        let names = std::mem::take(&mut self.units.get_mut(from).unwrap().names);
        for name in names {
            self.aliases.insert(name.clone(), into.clone());
            self.units.get_mut(into).unwrap().names.insert(name);
        }

        // Rewrite edges: everything `from` pointed at now hangs off `into`,
        // and every reverse edge on those targets is repointed.
        let edges: Vec<(DepKind, UnitId)> = {
            let from_unit = self.units.get(from).unwrap();
            from_unit
                .dependencies
                .kinds()
                .flat_map(|(kind, set)| set.iter().map(move |t| (kind, t.clone())))
                .collect()
        };
        for (kind, target) in edges {
            if let Some(target_unit) = self.units.get_mut(&target) {
                target_unit.dependencies.remove(kind.inverse(), from);
            }
            if target != *into {
                // Dropping edges that would become self-edges.
                let _ = self.add_dependency(into, kind, &target, true);
            }
        }

        let husk = self.units.get_mut(from).unwrap();
        husk.dependencies = Default::default();
        husk.load_state = LoadState::Merged;
        trace!("merged {from} into {into}");
        Ok(())
    }

    /// Registry corruption is a programming error; this check backs the
    /// controlled-shutdown path and the test suite.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (name, id) in &self.aliases {
            let unit = self
                .units
                .get(id)
                .ok_or_else(|| format!("alias {name} points at unknown unit {id}"))?;
            if !unit.names.contains(name) {
                return Err(format!(
                    "alias {name} points at {id}, which does not list it as a name"
                ));
            }
        }
        for unit in self.units.values() {
            for name in &unit.names {
                match self.aliases.get(name) {
                    Some(id) if *id == unit.id => {}
                    Some(id) => {
                        return Err(format!(
                            "name {name} of {} maps to {id} in the alias table",
                            unit.id
                        ));
                    }
                    None => {
                        return Err(format!("name {name} of {} missing from alias table", unit.id));
                    }
                }
            }
            for (kind, targets) in unit.dependencies.kinds() {
                for target in targets {
                    let target_unit = self.units.get(target).ok_or_else(|| {
                        format!("{}: {} edge to unknown unit {target}", unit.id, kind.as_str())
                    })?;
                    if !target_unit.dependencies.contains(kind.inverse(), &unit.id) {
                        return Err(format!(
                            "{}: {} edge to {target} has no {} reverse",
                            unit.id,
                            kind.as_str(),
                            kind.inverse().as_str()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Unit;

    fn id(name: &str) -> UnitId {
        UnitId::new(name).unwrap()
    }

    fn registry_with(names: &[&str]) -> UnitRegistry {
        let mut reg = UnitRegistry::default();
        for name in names {
            reg.insert(Unit::stub(id(name))).unwrap();
        }
        reg
    }

    #[test]
    fn alias_aware_lookup() {
        let mut reg = registry_with(&["a.service"]);
        let a = id("a.service");
        reg.add_alias(&a, "alias.service").unwrap();
        assert_eq!(reg.get("alias.service").unwrap().id, a);
        assert_eq!(reg.get("a.service").unwrap().id, a);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn alias_collision_refused() {
        let mut reg = registry_with(&["a.service", "b.service"]);
        reg.add_alias(&id("a.service"), "x.service").unwrap();
        assert!(reg.add_alias(&id("b.service"), "x.service").is_err());
        // re-adding the same alias to the same unit is fine
        reg.add_alias(&id("a.service"), "x.service").unwrap();
    }

    #[test]
    fn dependency_edges_are_symmetric() {
        let mut reg = registry_with(&["a.service", "b.service"]);
        let (a, b) = (id("a.service"), id("b.service"));
        assert!(reg.add_dependency(&a, DepKind::Requires, &b, true).unwrap());
        // idempotent
        assert!(!reg.add_dependency(&a, DepKind::Requires, &b, true).unwrap());

        assert!(reg
            .get_by_id(&b)
            .unwrap()
            .dependencies
            .contains(DepKind::RequiredBy, &a));
        reg.check_invariants().unwrap();

        reg.remove_dependency(&a, DepKind::Requires, &b);
        assert!(!reg
            .get_by_id(&b)
            .unwrap()
            .dependencies
            .contains(DepKind::RequiredBy, &a));
        reg.check_invariants().unwrap();
    }

    #[test]
    fn self_edges_refused() {
        let mut reg = registry_with(&["a.service"]);
        let a = id("a.service");
        assert!(matches!(
            reg.add_dependency(&a, DepKind::After, &a, true),
            Err(RegistryError::SelfDependency(_))
        ));
    }

    #[test]
    fn merge_moves_names_and_edges() {
        let mut reg = registry_with(&["a.service", "b.service", "c.service"]);
        let (a, b, c) = (id("a.service"), id("b.service"), id("c.service"));
        reg.add_alias(&b, "extra.service").unwrap();
        reg.add_dependency(&b, DepKind::Requires, &c, true).unwrap();

        reg.merge(&a, &b).unwrap();

        // b's names now resolve to a
        assert_eq!(reg.get("b.service").unwrap().id, a);
        assert_eq!(reg.get("extra.service").unwrap().id, a);
        // b's edge moved to a, with the reverse rewritten
        assert!(reg
            .get_by_id(&a)
            .unwrap()
            .dependencies
            .contains(DepKind::Requires, &c));
        assert!(reg
            .get_by_id(&c)
            .unwrap()
            .dependencies
            .contains(DepKind::RequiredBy, &a));
        assert!(!reg
            .get_by_id(&c)
            .unwrap()
            .dependencies
            .contains(DepKind::RequiredBy, &b));
        // husk stays behind as merged
        assert_eq!(reg.get_by_id(&b).unwrap().load_state, LoadState::Merged);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn merge_drops_would_be_self_edges() {
        let mut reg = registry_with(&["a.service", "b.service"]);
        let (a, b) = (id("a.service"), id("b.service"));
        reg.add_dependency(&b, DepKind::After, &a, true).unwrap();

        reg.merge(&a, &b).unwrap();
        assert!(!reg.get_by_id(&a).unwrap().dependencies.contains(DepKind::After, &a));
        reg.check_invariants().unwrap();
    }

    #[test]
    fn remove_cleans_dangling_edges() {
        let mut reg = registry_with(&["a.service", "b.service"]);
        let (a, b) = (id("a.service"), id("b.service"));
        reg.add_dependency(&a, DepKind::Wants, &b, true).unwrap();

        reg.remove(&b);
        assert!(reg.get("b.service").is_none());
        assert!(!reg.get_by_id(&a).unwrap().dependencies.contains(DepKind::Wants, &b));
        reg.check_invariants().unwrap();
    }
}
