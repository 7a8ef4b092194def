//! Fragment loading: find a unit's definition on disk, follow symlink
//! chains to discover aliases, detect masking, parse, and wire the result
//! into the registry.

pub mod build;
pub mod parse;

pub use build::{build_unit, LoadedUnit};

use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::jobs::DepLoader;
use crate::unit_name;
use crate::units::{LoadState, Unit, UnitId, UnitRegistry};

/// Symlink chains longer than this fail the load.
const MAX_SYMLINK_HOPS: usize = 8;

#[derive(Debug)]
pub enum LoadError {
    NotFound,
    Masked { aliases: Vec<String> },
    TooManySymlinks,
    Parse(parse::ParseError),
    Io(std::io::Error),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no fragment found"),
            Self::Masked { .. } => write!(f, "unit is masked"),
            Self::TooManySymlinks => {
                write!(f, "symlink chain exceeds {MAX_SYMLINK_HOPS} hops")
            }
            Self::Parse(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Search the ordered lookup path for a file whose basename is `name`.
pub fn find_fragment(lookup_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in lookup_paths {
        let candidate = dir.join(name);
        if candidate.symlink_metadata().is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Resolve the fragment for `name`, following symlinks by hand so every
/// symlink basename along the way becomes an alias. Ends at a regular
/// file, at `/dev/null` (masked), or with `TooManySymlinks`.
fn resolve_fragment(
    start: PathBuf,
    aliases: &mut Vec<String>,
) -> Result<(PathBuf, String), LoadError> {
    let mut current = start;

    for _ in 0..MAX_SYMLINK_HOPS {
        let meta = current.symlink_metadata().map_err(LoadError::Io)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&current).map_err(LoadError::Io)?;
            if target == Path::new("/dev/null") {
                return Err(LoadError::Masked {
                    aliases: std::mem::take(aliases),
                });
            }
            // The symlink's own basename names this unit too.
            if let Some(base) = current.file_name().and_then(|n| n.to_str()) {
                if !aliases.iter().any(|a| a == base) {
                    aliases.push(base.to_owned());
                }
            }
            current = if target.is_absolute() {
                target
            } else {
                current
                    .parent()
                    .map(|p| p.join(&target))
                    .unwrap_or(target)
            };
            continue;
        }

        let content = std::fs::read_to_string(&current).map_err(LoadError::Io)?;
        if content.trim().is_empty() {
            return Err(LoadError::Masked {
                aliases: std::mem::take(aliases),
            });
        }
        // The final basename is also a name for the unit (it may differ
        // from the requested name when we arrived via symlinks).
        if let Some(base) = current.file_name().and_then(|n| n.to_str()) {
            if !aliases.iter().any(|a| a == base) {
                aliases.push(base.to_owned());
            }
        }
        return Ok((current, content));
    }

    Err(LoadError::TooManySymlinks)
}

/// Load and build the unit named `name`. For a template instance with no
/// fragment of its own, the template's fragment is used with specifiers
/// expanded against the instance name.
pub fn load_fragment(lookup_paths: &[PathBuf], id: &UnitId) -> Result<LoadedUnit, LoadError> {
    let mut aliases = Vec::new();

    let direct = find_fragment(lookup_paths, &id.name);
    let path = match direct {
        Some(path) => path,
        None => {
            let template = unit_name::template_of(&id.name)
                .and_then(|t| find_fragment(lookup_paths, &t));
            match template {
                Some(path) => {
                    trace!("{}: loading from template fragment {:?}", id.name, path);
                    path
                }
                None => return Err(LoadError::NotFound),
            }
        }
    };

    let (path, content) = resolve_fragment(path, &mut aliases)?;
    let parsed = parse::parse_file(&content).map_err(LoadError::Parse)?;
    let mtime = path.metadata().ok().and_then(|m| m.modified().ok());

    let mut loaded = build_unit(id.clone(), parsed, path, mtime);

    // Aliases discovered from symlinks; the requested name and the
    // template's own name are not aliases of themselves.
    aliases.retain(|a| *a != id.name);
    if let Some(template) = unit_name::template_of(&id.name) {
        aliases.retain(|a| *a != template);
    }
    loaded.aliases.extend(aliases);
    Ok(loaded)
}

/// The manager's production loader: lookup paths from the configuration,
/// loading fragments on demand during transaction expansion.
pub struct FragmentLoader {
    pub lookup_paths: Vec<PathBuf>,
}

impl FragmentLoader {
    pub fn new(lookup_paths: Vec<PathBuf>) -> Self {
        Self { lookup_paths }
    }

    /// Load `id` if it is absent or still a stub, integrating aliases and
    /// declared dependencies into the registry. Returns the resulting load
    /// state; failures are recorded on the unit and never propagate.
    pub fn load_into(&self, registry: &mut UnitRegistry, id: &UnitId) -> LoadState {
        if let Some(canonical) = registry.canonical_id(&id.name) {
            let state = registry
                .get_by_id(&canonical)
                .map(|u| u.load_state)
                .unwrap_or(LoadState::NotFound);
            if state != LoadState::Stub {
                return state;
            }
            if canonical != *id {
                // The requested name is an alias of a stub; load under the
                // canonical identity.
                return self.load_into(registry, &canonical);
            }
        }

        match load_fragment(&self.lookup_paths, id) {
            Ok(loaded) => integrate_loaded(registry, loaded),
            Err(LoadError::NotFound) => {
                debug!("{id}: no fragment in lookup path");
                mark_stub(registry, id, LoadState::NotFound)
            }
            Err(LoadError::Masked { aliases }) => {
                debug!("{id}: masked");
                let state = mark_stub(registry, id, LoadState::Masked);
                for alias in aliases {
                    if alias != id.name {
                        let _ = registry.add_alias(id, &alias);
                    }
                }
                state
            }
            Err(e) => {
                warn!("{id}: failed to load: {e}");
                mark_stub(registry, id, LoadState::Error)
            }
        }
    }
}

impl DepLoader for FragmentLoader {
    fn ensure_loaded(&mut self, registry: &mut UnitRegistry, id: &UnitId) -> LoadState {
        self.load_into(registry, id)
    }
}

fn mark_stub(registry: &mut UnitRegistry, id: &UnitId, state: LoadState) -> LoadState {
    match registry.get_by_id_mut(id) {
        Some(unit) => unit.load_state = state,
        None => {
            let mut unit = Unit::stub(id.clone());
            unit.load_state = state;
            if registry.insert(unit).is_err() {
                return LoadState::Error;
            }
        }
    }
    state
}

/// Wire a built unit into the registry: upgrade a pre-existing stub in
/// place (so edges pointing at it survive), merge units reached via
/// discovered aliases, and add the declared dependency edges, creating
/// stubs for targets not seen yet.
pub fn integrate_loaded(registry: &mut UnitRegistry, loaded: LoadedUnit) -> LoadState {
    let LoadedUnit {
        unit: mut fresh,
        declared_deps,
        aliases,
    } = loaded;
    let id = fresh.id.clone();

    match registry.get_by_id_mut(&id) {
        Some(stub) => {
            // Keep the stub's identity: its edges and names were built up
            // while other units loaded.
            stub.load_state = fresh.load_state;
            stub.fragment_path = fresh.fragment_path.take();
            stub.fragment_mtime = fresh.fragment_mtime.take();
            stub.description = std::mem::take(&mut fresh.description);
            stub.documentation = std::mem::take(&mut fresh.documentation);
            stub.conditions = std::mem::take(&mut fresh.conditions);
            stub.config = fresh.config.clone();
            stub.specific = fresh.specific;
        }
        None => {
            if let Err(e) = registry.insert(fresh) {
                warn!("{id}: cannot register: {e}");
                return LoadState::Error;
            }
        }
    }

    for alias in aliases {
        match registry.canonical_id(&alias) {
            Some(existing) if existing != id => {
                // The alias already names another unit: the two
                // definitions describe the same thing, merge them.
                if let Err(e) = registry.merge(&id, &existing) {
                    warn!("{id}: cannot merge {existing} via alias {alias}: {e}");
                }
            }
            Some(_) => {}
            None => {
                if let Err(e) = registry.add_alias(&id, &alias) {
                    warn!("{id}: cannot add alias {alias}: {e}");
                }
            }
        }
    }

    for (kind, target_name) in declared_deps {
        let target = match UnitId::new(&target_name) {
            Ok(target) => target,
            Err(e) => {
                warn!("{id}: skipping dependency on {target_name}: {e}");
                continue;
            }
        };
        let target = match registry.canonical_id(&target.name) {
            Some(canonical) => canonical,
            None => {
                let stub = Unit::stub(target.clone());
                if let Err(e) = registry.insert(stub) {
                    warn!("{id}: cannot create stub for {target}: {e}");
                    continue;
                }
                target
            }
        };
        if target == id {
            warn!("{id}: ignoring {} dependency on itself", kind.as_str());
            continue;
        }
        if let Err(e) = registry.add_dependency(&id, kind, &target, true) {
            warn!("{id}: cannot add {} dependency on {target}: {e}", kind.as_str());
        }
    }

    registry
        .get_by_id(&id)
        .map(|u| u.load_state)
        .unwrap_or(LoadState::Error)
}

/// Eagerly load every fragment visible in the lookup paths. Used at boot
/// and on `Reload()`; on-demand loading covers everything else.
pub fn load_all_units(lookup_paths: &[PathBuf], registry: &mut UnitRegistry) {
    let loader = FragmentLoader::new(lookup_paths.to_vec());
    let mut names: Vec<String> = Vec::new();
    for dir in lookup_paths {
        let Ok(entries) = std::fs::read_dir(dir) else {
            trace!("lookup path {dir:?} not readable, skipping");
            continue;
        };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if UnitId::new(&name).is_ok() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names.sort();

    for name in names {
        if unit_name::is_template(&name) {
            // Templates are instantiated on demand.
            continue;
        }
        let Ok(id) = UnitId::new(&name) else { continue };
        loader.load_into(registry, &id);
    }

    // Resolve load-queue stragglers: stubs created for dependency targets.
    loop {
        let stubs: Vec<UnitId> = registry
            .units()
            .filter(|u| u.load_state == LoadState::Stub)
            .map(|u| u.id.clone())
            .collect();
        if stubs.is_empty() {
            break;
        }
        for id in stubs {
            loader.load_into(registry, &id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::DepKind;
    use std::io::Write;

    fn write_unit(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_a_service_fragment() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "a.service",
            "[Unit]\nDescription=A service\nAfter=b.service\nRequires=b.service\n\
             [Service]\nExecStart=/bin/sleep 10\n",
        );

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("a.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Loaded);

        let unit = registry.get("a.service").unwrap();
        assert_eq!(unit.description, "A service");
        let b = UnitId::new("b.service").unwrap();
        assert!(unit.dependencies.contains(DepKind::After, &b));
        assert!(unit.dependencies.contains(DepKind::Requires, &b));
        // the dependency target exists as a stub with reverse edges
        let b_unit = registry.get("b.service").unwrap();
        assert_eq!(b_unit.load_state, LoadState::Stub);
        assert!(b_unit.dependencies.contains(DepKind::RequiredBy, &id));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn empty_fragment_masks() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(dir.path(), "a.service", "\n");

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("a.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Masked);
    }

    #[cfg(unix)]
    #[test]
    fn dev_null_symlink_masks() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/dev/null", dir.path().join("a.service")).unwrap();

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("a.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Masked);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_basename_becomes_alias() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "real.service",
            "[Service]\nExecStart=/bin/true\n",
        );
        std::os::unix::fs::symlink(
            dir.path().join("real.service"),
            dir.path().join("alias.service"),
        )
        .unwrap();

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("alias.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Loaded);

        // both names resolve to the same unit
        let via_alias = registry.get("alias.service").unwrap().id.clone();
        let via_real = registry.get("real.service").unwrap().id.clone();
        assert_eq!(via_alias, via_real);
        registry.check_invariants().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn symlink_chain_limit() {
        let dir = tempfile::tempdir().unwrap();
        // a0 -> a1 -> ... -> a9 (never reaches a file)
        for i in 0..9 {
            std::os::unix::fs::symlink(
                dir.path().join(format!("a{}.service", i + 1)),
                dir.path().join(format!("a{i}.service")),
            )
            .unwrap();
        }

        let err = load_fragment(
            &[dir.path().to_path_buf()],
            &UnitId::new("a0.service").unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::TooManySymlinks));
    }

    #[test]
    fn template_instance_expansion() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "getty@.service",
            "[Unit]\nDescription=Getty on %i\n[Service]\nExecStart=/sbin/agetty %i\n",
        );

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("getty@tty1.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Loaded);

        let unit = registry.get("getty@tty1.service").unwrap();
        assert_eq!(unit.description, "Getty on tty1");
        match &unit.specific {
            crate::units::Specific::Service(s) => {
                let exec = s.conf.exec_start.as_ref().unwrap();
                assert_eq!(exec.args, vec!["tty1".to_owned()]);
            }
            _ => panic!("expected a service"),
        }
    }

    #[test]
    fn invalid_values_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "a.service",
            "[Unit]\nJobTimeoutSec=bogus\nFrobnicate=1\n\
             [Service]\nExecStart=/bin/true\nNice=99\nOOMScoreAdjust=5000\n",
        );

        let mut registry = UnitRegistry::default();
        let loader = FragmentLoader::new(vec![dir.path().to_path_buf()]);
        let id = UnitId::new("a.service").unwrap();
        assert_eq!(loader.load_into(&mut registry, &id), LoadState::Loaded);

        let unit = registry.get("a.service").unwrap();
        assert_eq!(unit.config.job_timeout, None);
        match &unit.specific {
            crate::units::Specific::Service(s) => {
                assert_eq!(s.conf.nice, None);
                assert_eq!(s.conf.oom_score_adjust, None);
                assert!(s.conf.exec_start.is_some());
            }
            _ => panic!("expected a service"),
        }
    }
}
