// src/service/daemon.rs

//! The daemon: session, activation and hook components behind one facade
//!
//! Mutating operations serialize on a single write mutex. The active set is
//! kept behind a read/write lock so queries run concurrently with each other.
//! [`ApexDaemon::boot`] is the once-per-boot activation pass and must finish
//! before mutating calls are served.

use super::{ApexService, PackageInfo, ServiceResult};
use crate::activation::{ActiveSet, DirectoryMounter, MountBackend, MountPlan, resolve};
use crate::apex::{ApexFile, Package, PackageReader, TrustStore};
use crate::config::ApexConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::fsutil;
use crate::hooks::{HookContext, HookPhase, HookRunner, TempMounts};
use crate::session::{PackageRecord, Session, SessionInfo, SessionManager, SessionStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Summary of one boot activation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub activated: Vec<i32>,
    pub failed: Vec<i32>,
}

pub struct ApexDaemon {
    config: ApexConfig,
    reader: PackageReader,
    sessions: SessionManager,
    mounter: Box<dyn MountBackend>,
    hooks: HookRunner,
    write_lock: Mutex<()>,
    active: RwLock<ActiveSet>,
}

impl ApexDaemon {
    /// Build a daemon applying plans through `mounter`
    ///
    /// The active set starts as the resolution of the installed and factory
    /// packages; nothing is applied until [`boot`](Self::boot).
    pub fn new(config: ApexConfig, mounter: Box<dyn MountBackend>) -> Result<Self> {
        let reader = PackageReader::new(TrustStore::new(&config.trust_dir));
        let store = SessionStore::open(&config.sessions_dir)?;
        let sessions = SessionManager::new(store, reader.clone(), &config);
        fs::create_dir_all(&config.active_dir)?;

        let daemon = Self {
            hooks: HookRunner::new(config.hook_timeout),
            reader,
            sessions,
            mounter,
            write_lock: Mutex::new(()),
            active: RwLock::new(ActiveSet::default()),
            config,
        };
        let (factory, installed) = daemon.scan_candidates()?;
        *daemon.active.write() = resolve(&factory, &installed).active;
        Ok(daemon)
    }

    /// Build a daemon that realizes plans as directories under `apex_root`
    pub fn open(config: ApexConfig) -> Result<Self> {
        let reader = PackageReader::new(TrustStore::new(&config.trust_dir));
        let mounter = DirectoryMounter::new(&config.apex_root, reader)?;
        Self::new(config, Box::new(mounter))
    }

    pub fn config(&self) -> &ApexConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn is_factory_path(&self, path: &Path) -> bool {
        self.config.factory_dirs.iter().any(|dir| path.starts_with(dir))
    }

    fn scan_candidates(&self) -> Result<(Vec<Package>, Vec<Package>)> {
        let mut factory = Vec::new();
        for dir in &self.config.factory_dirs {
            factory.extend(self.reader.scan_dir(dir, true)?);
        }
        let installed = self.reader.scan_dir(&self.config.active_dir, false)?;
        Ok((factory, installed))
    }

    /// Copy packages into the installed directory
    ///
    /// All-or-nothing: if any copy fails, the copies made so far are removed
    /// and nothing else changes. Only after every copy landed are other
    /// installed versions of the same ordinary packages removed, unless they
    /// are part of `packages` too. Shared-library providers keep every
    /// version.
    fn install(&self, packages: &[Package]) -> Result<Vec<PackageRecord>> {
        let mut records = Vec::with_capacity(packages.len());
        let mut created: Vec<PathBuf> = Vec::new();
        for pkg in packages {
            let target = self.config.installed_path(&pkg.name, pkg.version);
            if pkg.path != target {
                let existed = target.exists();
                if let Err(e) = fsutil::copy_atomic(&pkg.path, &target) {
                    for path in &created {
                        if let Err(cleanup) = fs::remove_file(path) {
                            warn!("Failed to remove partial install {}: {}", path.display(), cleanup);
                        }
                    }
                    return Err(e);
                }
                if !existed {
                    created.push(target.clone());
                }
            }
            records.push(PackageRecord {
                name: pkg.name.clone(),
                version: pkg.version,
                path: target,
            });
        }

        for existing in self.reader.scan_dir(&self.config.active_dir, false)? {
            let replaced = packages
                .iter()
                .any(|p| p.name == existing.name && !p.exports_shared_libs);
            let in_batch = packages
                .iter()
                .any(|p| p.name == existing.name && p.version == existing.version);
            if replaced && !in_batch {
                info!("Removing superseded install {}", existing.id());
                fs::remove_file(&existing.path)?;
            }
        }
        Ok(records)
    }

    /// Run the boot activation pass
    ///
    /// Sessions awaiting activation are handled one at a time in id order.
    /// A failing session is marked failed and the previous configuration
    /// stays live; later sessions are still attempted.
    pub fn boot(&self) -> Result<BootReport> {
        let _guard = self.write_lock.lock();
        let mut report = BootReport::default();

        let (factory, mut installed) = self.scan_candidates()?;
        let mut resolution = resolve(&factory, &installed);
        for unresolved in &resolution.unresolved {
            warn!("{}", unresolved.to_error());
        }
        let mut live = self.mounter.current()?;

        for session in self.sessions.sessions_to_activate()? {
            info!("Activating session {}", session.id);
            match self.activate_session(&session, &factory, &installed, &live) {
                Ok(records) => {
                    self.sessions.mark_activated(&session, &records)?;
                    installed = self.reader.scan_dir(&self.config.active_dir, false)?;
                    resolution = resolve(&factory, &installed);
                    live = self.mounter.current()?;
                    report.activated.push(session.id);
                }
                Err(e) => {
                    error!("Session {} failed to activate: {}", session.id, e);
                    self.sessions.mark_activation_failed(&session, &e)?;
                    report.failed.push(session.id);
                }
            }
        }

        if resolution.plan != live {
            self.mounter.apply(&resolution.plan)?;
        }
        *self.active.write() = resolution.active;
        info!(
            "Boot pass complete: {} activated, {} failed",
            report.activated.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Activate one session; on error the live configuration is `live` again
    fn activate_session(
        &self,
        session: &Session,
        factory: &[Package],
        installed: &[Package],
        live: &MountPlan,
    ) -> Result<Vec<PackageRecord>> {
        let mut opened: Vec<(ApexFile, Package)> = Vec::with_capacity(session.packages.len());
        for record in &session.packages {
            let apex = self.reader.open(&record.path)?;
            let pkg = apex.to_package(false);
            opened.push((apex, pkg));
        }
        let packages: Vec<Package> = opened.iter().map(|(_, p)| p.clone()).collect();

        let with_pre_hooks: Vec<(ApexFile, Package)> = opened
            .into_iter()
            .filter(|(_, p)| p.pre_install_hook.is_some())
            .collect();
        if !with_pre_hooks.is_empty() {
            let mounts = TempMounts::extract(&with_pre_hooks)?;
            self.hooks.run_phase(mounts.contexts(), HookPhase::PreInstall)?;
        }

        let candidates: Vec<Package> = installed.iter().chain(&packages).cloned().collect();
        let resolution = resolve(factory, &candidates);
        for pkg in &packages {
            if !resolution.active.contains(&pkg.name, pkg.version) {
                return Err(match resolution.unresolved_for(&pkg.name, pkg.version) {
                    Some(unresolved) => unresolved.to_error(),
                    None => Error::MountFailure(format!(
                        "{} would not become active over version {}",
                        pkg.id(),
                        resolution.active.get(&pkg.name).map_or(0, |p| p.version)
                    )),
                });
            }
        }

        self.mounter.apply(&resolution.plan)?;

        let contexts: Vec<HookContext> = packages
            .iter()
            .map(|p| HookContext {
                package: p.clone(),
                mount_point: self.mounter.mount_point(&p.name, p.version),
            })
            .collect();
        if let Err(e) = self.hooks.run_phase(&contexts, HookPhase::PostInstall) {
            self.restore(live);
            return Err(e);
        }

        match self.install(&packages) {
            Ok(records) => Ok(records),
            Err(e) => {
                self.restore(live);
                Err(e)
            }
        }
    }

    fn restore(&self, plan: &MountPlan) {
        if let Err(e) = self.mounter.apply(plan) {
            error!("Failed to restore previous mount configuration: {}", e);
        }
    }

    /// Verify every path, all-or-nothing
    fn verify_all(&self, paths: &[PathBuf]) -> Result<Vec<Package>> {
        paths
            .iter()
            .map(|path| self.reader.read(path, self.is_factory_path(path)))
            .collect()
    }

    fn run_standalone_hooks(&self, paths: &[PathBuf], phase: HookPhase) -> Result<()> {
        let _guard = self.write_lock.lock();
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.hooks.run_standalone(&self.reader, &refs, phase)
    }
}

/// Verification failures are reported as `false`, not as errors
fn is_rejection(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Open | ErrorKind::Manifest | ErrorKind::Signature
    )
}

impl ApexService for ApexDaemon {
    fn stage_packages(&self, paths: &[PathBuf]) -> ServiceResult<bool> {
        let _guard = self.write_lock.lock();
        let packages = match self.verify_all(paths) {
            Ok(packages) => packages,
            Err(e) if is_rejection(&e) => {
                warn!("Refusing to stage packages: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let records = self.install(&packages)?;
        for record in &records {
            info!("Staged {}@{} at {}", record.name, record.version, record.path.display());
        }
        Ok(true)
    }

    fn submit_staged_session(
        &self,
        session_id: i32,
        child_session_ids: &[i32],
        is_rollback: bool,
    ) -> ServiceResult<(Vec<PackageInfo>, bool)> {
        let _guard = self.write_lock.lock();
        match self.sessions.submit(session_id, child_session_ids, is_rollback) {
            Ok(session) => Ok((
                session.packages.iter().map(PackageInfo::from_record).collect(),
                true,
            )),
            Err(e) if is_rejection(&e) => {
                warn!("Session {} failed verification: {}", session_id, e);
                Ok((Vec::new(), false))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_staged_session_ready(&self, session_id: i32) -> ServiceResult<bool> {
        let _guard = self.write_lock.lock();
        self.sessions.mark_ready(session_id)?;
        Ok(true)
    }

    fn mark_staged_session_successful(&self, session_id: i32) -> ServiceResult<()> {
        let _guard = self.write_lock.lock();
        Ok(self.sessions.mark_successful(session_id)?)
    }

    fn abort_staged_session(&self, session_id: i32) -> ServiceResult<()> {
        let _guard = self.write_lock.lock();
        Ok(self.sessions.abort(session_id)?)
    }

    fn get_sessions(&self) -> ServiceResult<Vec<SessionInfo>> {
        Ok(self.sessions.get_sessions()?)
    }

    fn get_staged_session_info(&self, session_id: i32) -> ServiceResult<SessionInfo> {
        Ok(self.sessions.get_info(session_id)?)
    }

    fn get_active_packages(&self) -> ServiceResult<Vec<PackageInfo>> {
        Ok(self
            .active
            .read()
            .packages()
            .into_iter()
            .map(|p| PackageInfo::from_package(p, true))
            .collect())
    }

    fn get_active_package(&self, package_name: &str) -> ServiceResult<Option<PackageInfo>> {
        Ok(self
            .active
            .read()
            .get(package_name)
            .map(|p| PackageInfo::from_package(p, true)))
    }

    fn activate_package(&self, path: &Path) -> ServiceResult<()> {
        let _guard = self.write_lock.lock();
        let pkg = self.reader.read(path, self.is_factory_path(path))?;
        let next = self.active.read().with_package(&pkg)?;
        self.mounter.apply(&MountPlan::from_active_set(&next))?;
        *self.active.write() = next;
        info!("Activated {}", pkg.id());
        Ok(())
    }

    fn deactivate_package(&self, path: &Path) -> ServiceResult<()> {
        let _guard = self.write_lock.lock();
        let pkg = self.reader.read(path, self.is_factory_path(path))?;
        let next = self
            .active
            .read()
            .without_package(&pkg.name, pkg.version)?
            .ok_or_else(|| Error::NotFound(format!("{} is not active", pkg.id())))?;
        self.mounter.apply(&MountPlan::from_active_set(&next))?;
        *self.active.write() = next;
        info!("Deactivated {}", pkg.id());
        Ok(())
    }

    fn preinstall_packages(&self, paths: &[PathBuf]) -> ServiceResult<()> {
        Ok(self.run_standalone_hooks(paths, HookPhase::PreInstall)?)
    }

    fn postinstall_packages(&self, paths: &[PathBuf]) -> ServiceResult<()> {
        Ok(self.run_standalone_hooks(paths, HookPhase::PostInstall)?)
    }
}
