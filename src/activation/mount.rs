// src/activation/mount.rs

//! Mount plans and how they are applied
//!
//! The resolver only describes the wanted configuration as a [`MountPlan`];
//! a [`MountBackend`] makes it live. The provided [`DirectoryMounter`]
//! realizes the installed package root as a directory tree:
//!
//! ```text
//! <apex_root> -> .<root>.generations/gen-<uuid>/
//!                    com.example.foo@2/...   versioned mountpoint
//!                    com.example.foo/...     latest alias, same entries
//! ```
//!
//! Each apply builds a complete new generation next to the live one and then
//! renames a fresh symlink over `apex_root`. Readers observe either the old
//! or the new generation, never a mix.

use super::resolver::ActiveSet;
use crate::apex::PackageReader;
use crate::error::{Error, Result};
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One versioned mountpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub version: u64,
    pub source: PathBuf,
}

impl Mount {
    /// Directory name under the package root, `name@version`
    pub fn mountpoint(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Latest alias: `name` mirrors `name@version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub version: u64,
}

/// Complete description of the installed package root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPlan {
    /// Sorted by name, then version
    pub mounts: Vec<Mount>,
    /// Sorted by name
    pub aliases: Vec<Alias>,
}

/// Changes between two plans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Alias names now pointing at a different version
    pub realiased: Vec<String>,
}

impl PlanDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.realiased.is_empty()
    }
}

impl MountPlan {
    /// Mount every active package and alias every selected name
    pub fn from_active_set(active: &ActiveSet) -> Self {
        let mounts = active
            .packages()
            .into_iter()
            .map(|p| Mount {
                name: p.name.clone(),
                version: p.version,
                source: p.path.clone(),
            })
            .collect();
        let aliases = active
            .selected
            .values()
            .map(|p| Alias {
                name: p.name.clone(),
                version: p.version,
            })
            .collect();
        Self { mounts, aliases }
    }

    pub fn mountpoints(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::mountpoint).collect()
    }

    pub fn find(&self, name: &str, version: u64) -> Option<&Mount> {
        self.mounts
            .iter()
            .find(|m| m.name == name && m.version == version)
    }

    /// Mount the latest alias for `name` resolves to
    pub fn alias_target(&self, name: &str) -> Option<&Mount> {
        let alias = self.aliases.iter().find(|a| a.name == name)?;
        self.find(&alias.name, alias.version)
    }

    /// What applying `self` over `old` tears down and sets up
    pub fn diff(&self, old: &MountPlan) -> PlanDiff {
        let new_points: BTreeSet<String> = self.mountpoints().into_iter().collect();
        let old_points: BTreeSet<String> = old.mountpoints().into_iter().collect();
        let realiased = self
            .aliases
            .iter()
            .filter(|a| {
                old.aliases
                    .iter()
                    .find(|o| o.name == a.name)
                    .is_some_and(|o| o.version != a.version)
            })
            .map(|a| a.name.clone())
            .collect();
        PlanDiff {
            added: new_points.difference(&old_points).cloned().collect(),
            removed: old_points.difference(&new_points).cloned().collect(),
            realiased,
        }
    }
}

/// Capability that makes a mount plan live
pub trait MountBackend: Send + Sync {
    /// Replace the live configuration with `plan` in one atomic step
    ///
    /// On error the previous configuration must still be live.
    fn apply(&self, plan: &MountPlan) -> Result<()>;

    /// The plan currently live; empty before the first apply
    fn current(&self) -> Result<MountPlan>;

    /// Directory where `name@version` is visible once its plan is applied
    fn mount_point(&self, name: &str, version: u64) -> PathBuf;
}

const GENERATION_PREFIX: &str = "gen-";
const PLAN_SUFFIX: &str = ".plan.json";

/// Materializes plans as generation directories behind a symlink
#[derive(Debug, Clone)]
pub struct DirectoryMounter {
    apex_root: PathBuf,
    generations_dir: PathBuf,
    reader: PackageReader,
}

impl DirectoryMounter {
    /// Create a mounter for `apex_root`, removing generations left behind by
    /// an interrupted apply
    pub fn new(apex_root: &Path, reader: PackageReader) -> Result<Self> {
        let root_name = apex_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Config(format!("invalid apex root {}", apex_root.display())))?;
        let parent = apex_root.parent().unwrap_or_else(|| Path::new("/"));
        let generations_dir = parent.join(format!(".{}.generations", root_name));
        fs::create_dir_all(&generations_dir)?;

        let mounter = Self {
            apex_root: apex_root.to_path_buf(),
            generations_dir,
            reader,
        };
        mounter.prune_generations()?;
        Ok(mounter)
    }

    pub fn apex_root(&self) -> &Path {
        &self.apex_root
    }

    /// Name of the generation `apex_root` points at
    fn live_generation(&self) -> Option<String> {
        let target = fs::read_link(&self.apex_root).ok()?;
        let name = target.file_name()?.to_string_lossy().into_owned();
        name.starts_with(GENERATION_PREFIX).then_some(name)
    }

    fn plan_path(&self, generation: &str) -> PathBuf {
        self.generations_dir.join(format!("{}{}", generation, PLAN_SUFFIX))
    }

    /// Remove every generation except the live one
    fn prune_generations(&self) -> Result<()> {
        let live = self.live_generation();
        for name in fsutil::list_dir_names(&self.generations_dir)? {
            let generation = name.strip_suffix(PLAN_SUFFIX).unwrap_or(&name);
            if Some(generation) == live.as_deref() {
                continue;
            }
            let path = self.generations_dir.join(&name);
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!("Removed stale generation entry {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    /// A plain directory at `apex_root` blocks the symlink; only an empty
    /// one is taken over
    fn claim_root(&self) -> Result<()> {
        let Ok(meta) = fs::symlink_metadata(&self.apex_root) else {
            return Ok(());
        };
        if meta.file_type().is_symlink() {
            return Ok(());
        }
        if meta.is_dir() && fsutil::list_dir_names(&self.apex_root)?.is_empty() {
            fs::remove_dir(&self.apex_root)?;
            return Ok(());
        }
        Err(Error::MountFailure(format!(
            "{} exists and is not managed by apexd",
            self.apex_root.display()
        )))
    }

    fn build_generation(&self, dir: &Path, plan: &MountPlan) -> Result<()> {
        let live_dir = self
            .live_generation()
            .map(|g| self.generations_dir.join(g));
        let live_plan = self.current()?;
        fs::create_dir_all(dir)?;

        for mount in &plan.mounts {
            let target = dir.join(mount.mountpoint());
            // Same name@version is the same verified content wherever it came from
            let reusable = live_plan.find(&mount.name, mount.version).is_some();
            match &live_dir {
                Some(live) if reusable && live.join(mount.mountpoint()).is_dir() => {
                    fsutil::copy_dir_all(&live.join(mount.mountpoint()), &target)?;
                }
                _ => {
                    debug!("Extracting {} from {}", mount.mountpoint(), mount.source.display());
                    self.reader.open(&mount.source)?.extract_payload(&target)?;
                }
            }
        }

        for alias in &plan.aliases {
            let versioned = dir.join(format!("{}@{}", alias.name, alias.version));
            if !versioned.is_dir() {
                return Err(Error::MountFailure(format!(
                    "alias {} points at unmounted version {}",
                    alias.name, alias.version
                )));
            }
            fsutil::copy_dir_all(&versioned, &dir.join(&alias.name))?;
        }
        Ok(())
    }
}

impl MountBackend for DirectoryMounter {
    fn apply(&self, plan: &MountPlan) -> Result<()> {
        self.claim_root()?;

        let generation = format!("{}{}", GENERATION_PREFIX, uuid::Uuid::new_v4());
        let dir = self.generations_dir.join(&generation);
        let staged = self.build_generation(&dir, plan).and_then(|()| {
            let json = serde_json::to_vec_pretty(plan)
                .map_err(|e| Error::IoError(format!("Failed to serialize mount plan: {}", e)))?;
            fsutil::write_atomic(&self.plan_path(&generation), &json)
        });
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&dir);
            let _ = fs::remove_file(self.plan_path(&generation));
            return Err(match e {
                Error::MountFailure(msg) => Error::MountFailure(msg),
                other => Error::MountFailure(format!("failed to build {}: {}", generation, other)),
            });
        }

        let diff = plan.diff(&self.current()?);
        fsutil::swap_symlink(&self.apex_root, &dir)
            .map_err(|e| Error::MountFailure(format!("failed to switch {}: {}", generation, e)))?;
        info!(
            "Switched {} to {} ({} mount(s), +{} -{})",
            self.apex_root.display(),
            generation,
            plan.mounts.len(),
            diff.added.len(),
            diff.removed.len()
        );

        self.prune_generations()
    }

    fn current(&self) -> Result<MountPlan> {
        let Some(generation) = self.live_generation() else {
            return Ok(MountPlan::default());
        };
        let path = self.plan_path(&generation);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MountPlan::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::MountFailure(format!("corrupt plan {}: {}", path.display(), e)))
    }

    fn mount_point(&self, name: &str, version: u64) -> PathBuf {
        self.apex_root.join(format!("{}@{}", name, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apex::{ApexBuilder, ApexManifest, SigningKeyPair, TrustStore};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        key: SigningKeyPair,
        mounter: DirectoryMounter,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let trust = TrustStore::new(tmp.path().join("trust"));
        let key = SigningKeyPair::generate();
        trust.trust("com.example.foo", &key).unwrap();
        let mounter = DirectoryMounter::new(&tmp.path().join("apex"), PackageReader::new(trust)).unwrap();
        Fixture { tmp, key, mounter }
    }

    fn package(f: &Fixture, version: u64, files: &[&str]) -> Mount {
        let out = f.tmp.path().join(format!("foo{}.apex", version));
        let mut builder = ApexBuilder::new(ApexManifest::new("com.example.foo", version));
        for file in files {
            builder = builder.add_file(file, file.as_bytes().to_vec(), 0o644);
        }
        builder.build(&f.key, &out).unwrap();
        Mount {
            name: "com.example.foo".to_string(),
            version,
            source: out,
        }
    }

    fn plan(mounts: Vec<Mount>, alias: u64) -> MountPlan {
        MountPlan {
            mounts,
            aliases: vec![Alias {
                name: "com.example.foo".to_string(),
                version: alias,
            }],
        }
    }

    #[test]
    fn test_apply_creates_versioned_and_alias() {
        let f = fixture();
        let v1 = package(&f, 1, &["etc/a", "lib/b"]);
        f.mounter.apply(&plan(vec![v1], 1)).unwrap();

        let root = f.mounter.apex_root();
        assert_eq!(
            fsutil::list_dir_names(root).unwrap(),
            vec!["com.example.foo", "com.example.foo@1"]
        );
        assert_eq!(
            fsutil::list_dir_names(&root.join("com.example.foo")).unwrap(),
            fsutil::list_dir_names(&root.join("com.example.foo@1")).unwrap()
        );
        assert_eq!(f.mounter.current().unwrap().mountpoints(), vec!["com.example.foo@1"]);
    }

    #[test]
    fn test_apply_replaces_previous_version() {
        let f = fixture();
        let v1 = package(&f, 1, &["etc/a"]);
        let v2 = package(&f, 2, &["etc/a", "etc/new"]);
        f.mounter.apply(&plan(vec![v1], 1)).unwrap();
        f.mounter.apply(&plan(vec![v2], 2)).unwrap();

        let root = f.mounter.apex_root();
        assert!(!root.join("com.example.foo@1").exists());
        assert_eq!(
            fsutil::list_dir_names(&root.join("com.example.foo/etc")).unwrap(),
            vec!["a", "new"]
        );
        // Only the live generation and its plan remain
        assert_eq!(fsutil::list_dir_names(&f.mounter.generations_dir).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_apply_keeps_live_plan() {
        let f = fixture();
        let v1 = package(&f, 1, &["etc/a"]);
        f.mounter.apply(&plan(vec![v1.clone()], 1)).unwrap();

        let broken = Mount {
            source: f.tmp.path().join("missing.apex"),
            ..package(&f, 2, &[])
        };
        let err = f.mounter.apply(&plan(vec![v1, broken], 2)).unwrap_err();
        assert!(matches!(err, Error::MountFailure(_)));
        assert_eq!(f.mounter.current().unwrap().mountpoints(), vec!["com.example.foo@1"]);
        assert!(f.mounter.apex_root().join("com.example.foo@1/etc/a").exists());
    }

    #[test]
    fn test_diff() {
        let f = fixture();
        let old = plan(vec![package(&f, 1, &[])], 1);
        let new = plan(vec![package(&f, 2, &[])], 2);
        let diff = new.diff(&old);
        assert_eq!(diff.added, vec!["com.example.foo@2"]);
        assert_eq!(diff.removed, vec!["com.example.foo@1"]);
        assert_eq!(diff.realiased, vec!["com.example.foo"]);
        assert!(new.diff(&new).is_empty());
    }

    #[test]
    fn test_unmanaged_root_is_rejected() {
        let f = fixture();
        fs::create_dir_all(f.mounter.apex_root().join("stuff")).unwrap();
        let v1 = package(&f, 1, &[]);
        assert!(f.mounter.apply(&plan(vec![v1], 1)).is_err());
    }
}
