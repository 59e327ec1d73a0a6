// src/activation/resolver.rs

//! Active package selection
//!
//! [`resolve`] is a pure function from the candidate packages (factory plus
//! installed) to the active set and the mount plan realizing it. It never
//! touches the filesystem.
//!
//! Selection rules:
//!
//! - Ordinary packages: the highest version whose pinned library
//!   requirements can all be met wins. On equal versions an installed copy
//!   beats the factory copy.
//! - Shared-library providers: the highest version is exposed through the
//!   latest alias, and every version pinned by some selected package stays
//!   mounted at its own versioned mountpoint.
//! - Consumers bind to exactly the provider version in their manifest. A
//!   newer provider version never changes an existing binding.

use super::mount::MountPlan;
use crate::apex::Package;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Packages currently considered live
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSet {
    /// Package name -> package exposed through the latest alias
    pub selected: BTreeMap<String, Package>,
    /// Provider name -> version -> every retained shared-library version
    pub shared_libs: BTreeMap<String, BTreeMap<u64, Package>>,
    /// Consumer name -> library provider -> bound provider version
    pub library_bindings: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ActiveSet {
    /// Package behind the latest alias for `name`
    pub fn get(&self, name: &str) -> Option<&Package> {
        self.selected.get(name)
    }

    /// Whether `name@version` is mounted
    pub fn contains(&self, name: &str, version: u64) -> bool {
        match self.shared_libs.get(name) {
            Some(versions) => versions.contains_key(&version),
            None => self.selected.get(name).is_some_and(|p| p.version == version),
        }
    }

    /// Every mounted package, ordered by name then version
    pub fn packages(&self) -> Vec<&Package> {
        let mut packages = Vec::new();
        for (name, pkg) in &self.selected {
            if let Some(versions) = self.shared_libs.get(name) {
                packages.extend(versions.values());
            } else {
                packages.push(pkg);
            }
        }
        // Providers retained only for pinned consumers, without a latest
        for (name, versions) in &self.shared_libs {
            if !self.selected.contains_key(name) {
                packages.extend(versions.values());
            }
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        packages
    }

    /// Provider package a consumer resolves `library` to
    pub fn resolved_library(&self, consumer: &str, library: &str) -> Option<&Package> {
        let version = self.library_bindings.get(consumer)?.get(library)?;
        self.shared_libs.get(library)?.get(version)
    }

    /// Add `pkg`, replacing the active version of an ordinary package
    ///
    /// Providers gain a version instead. The result is validated: every
    /// pinned requirement must be met by a mounted provider version.
    pub fn with_package(&self, pkg: &Package) -> Result<ActiveSet> {
        let mut next = self.clone();
        if pkg.exports_shared_libs {
            let versions = next.shared_libs.entry(pkg.name.clone()).or_default();
            versions.insert(pkg.version, pkg.clone());
            if let Some((_, latest)) = versions.last_key_value() {
                next.selected.insert(pkg.name.clone(), latest.clone());
            }
        } else {
            next.selected.insert(pkg.name.clone(), pkg.clone());
        }
        next.rebuild_bindings();
        next.prune_providers();
        next.validate()?;
        Ok(next)
    }

    /// Remove `name@version`; `None` if it is not active
    ///
    /// Removing a provider version exposes the next highest retained version
    /// through the alias. The result is validated like [`with_package`](Self::with_package).
    pub fn without_package(&self, name: &str, version: u64) -> Result<Option<ActiveSet>> {
        if !self.contains(name, version) {
            return Ok(None);
        }
        let mut next = self.clone();
        if let Some(versions) = next.shared_libs.get_mut(name) {
            versions.remove(&version);
            match versions.last_key_value().map(|(_, p)| p.clone()) {
                Some(latest) => {
                    next.selected.insert(name.to_string(), latest);
                }
                None => {
                    next.shared_libs.remove(name);
                    next.selected.remove(name);
                }
            }
        } else {
            next.selected.remove(name);
        }
        next.rebuild_bindings();
        next.prune_providers();
        next.validate()?;
        Ok(Some(next))
    }

    fn rebuild_bindings(&mut self) {
        let bindings: BTreeMap<String, BTreeMap<String, u64>> = self
            .packages()
            .into_iter()
            .filter(|p| !p.required_lib_versions.is_empty())
            .map(|p| (p.name.clone(), p.required_lib_versions.clone()))
            .collect();
        self.library_bindings = bindings;
    }

    /// Drop provider versions that are neither the latest nor pinned
    ///
    /// Bindings are rebuilt after each pass since a dropped provider version
    /// may itself have pinned another library.
    fn prune_providers(&mut self) {
        loop {
            let mut pruned = false;
            for (name, versions) in self.shared_libs.iter_mut() {
                let latest = versions.keys().next_back().copied();
                versions.retain(|version, _| {
                    let keep = Some(*version) == latest
                        || self
                            .library_bindings
                            .values()
                            .any(|libs| libs.get(name) == Some(version));
                    pruned |= !keep;
                    keep
                });
            }
            if !pruned {
                return;
            }
            self.rebuild_bindings();
        }
    }

    /// Every binding must point at a mounted provider version
    pub fn validate(&self) -> Result<()> {
        for (consumer, libs) in &self.library_bindings {
            for (library, version) in libs {
                let mounted = self
                    .shared_libs
                    .get(library)
                    .is_some_and(|versions| versions.contains_key(version));
                if !mounted {
                    return Err(Error::UnresolvedLibraryVersion {
                        consumer: consumer.clone(),
                        library: library.clone(),
                        version: *version,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A candidate skipped because a pinned library version is unavailable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedLibrary {
    pub consumer: String,
    pub consumer_version: u64,
    pub library: String,
    pub version: u64,
}

impl UnresolvedLibrary {
    pub fn to_error(&self) -> Error {
        Error::UnresolvedLibraryVersion {
            consumer: format!("{}@{}", self.consumer, self.consumer_version),
            library: self.library.clone(),
            version: self.version,
        }
    }
}

/// Output of one resolver pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub active: ActiveSet,
    pub plan: MountPlan,
    /// Candidates newer than the selected version that could not activate
    pub unresolved: Vec<UnresolvedLibrary>,
}

impl Resolution {
    /// Why `name@version` did not make it into the active set, if known
    pub fn unresolved_for(&self, name: &str, version: u64) -> Option<&UnresolvedLibrary> {
        self.unresolved
            .iter()
            .find(|u| u.consumer == name && u.consumer_version == version)
    }
}

/// Compute the active set and mount plan from factory and installed packages
pub fn resolve(factory: &[Package], installed: &[Package]) -> Resolution {
    // name -> version -> candidate; installed copies win version ties
    let mut groups: BTreeMap<String, BTreeMap<u64, Package>> = BTreeMap::new();
    for pkg in factory.iter().chain(installed) {
        let versions = groups.entry(pkg.name.clone()).or_default();
        match versions.get(&pkg.version) {
            Some(existing) if !existing.is_factory => {}
            _ => {
                versions.insert(pkg.version, pkg.clone());
            }
        }
    }

    let provides = |library: &str, version: u64| {
        groups
            .get(library)
            .and_then(|versions| versions.get(&version))
            .is_some_and(|p| p.exports_shared_libs)
    };

    let mut active = ActiveSet::default();
    let mut unresolved = Vec::new();
    for (name, versions) in &groups {
        for pkg in versions.values().rev() {
            let missing: Vec<(&String, &u64)> = pkg
                .required_lib_versions
                .iter()
                .filter(|(lib, ver)| !provides(lib, **ver))
                .collect();
            if missing.is_empty() {
                active.selected.insert(name.clone(), pkg.clone());
                break;
            }
            for (library, version) in missing {
                unresolved.push(UnresolvedLibrary {
                    consumer: name.clone(),
                    consumer_version: pkg.version,
                    library: library.clone(),
                    version: *version,
                });
            }
        }
    }

    // Providers: latest plus every version pinned by a selected package
    for (name, pkg) in &active.selected {
        if pkg.exports_shared_libs {
            active
                .shared_libs
                .entry(name.clone())
                .or_default()
                .insert(pkg.version, pkg.clone());
        }
    }
    let pins: Vec<(String, u64)> = active
        .selected
        .values()
        .flat_map(|p| p.required_lib_versions.iter().map(|(l, v)| (l.clone(), *v)))
        .collect();
    for (library, version) in pins {
        if let Some(pkg) = groups.get(&library).and_then(|versions| versions.get(&version)) {
            active
                .shared_libs
                .entry(library)
                .or_default()
                .insert(version, pkg.clone());
        }
    }

    active.rebuild_bindings();
    let plan = MountPlan::from_active_set(&active);
    Resolution {
        active,
        plan,
        unresolved,
    }
}
