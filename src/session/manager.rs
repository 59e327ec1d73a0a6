// src/session/manager.rs

//! Session state machine
//!
//! Every transition goes through here. Callers serialize mutating calls (the
//! daemon holds one mutex around them); this type only enforces which
//! transitions are legal and the order records are written in.
//!
//! Write order keeps the parent/child aggregation crash-safe: children are
//! persisted before their parent on every transition. A crash in between
//! leaves the parent in its old state, and repeating the call finishes the
//! job because child transitions are idempotent.

use super::{PackageRecord, Session, SessionInfo, SessionState, SessionStore};
use crate::apex::{PackageReader, list_package_files};
use crate::config::ApexConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// Enforces legal session transitions over a [`SessionStore`]
#[derive(Debug)]
pub struct SessionManager {
    store: SessionStore,
    reader: PackageReader,
    staging_root: PathBuf,
    max_activation_attempts: u32,
    /// Superseded session id -> id of the submission that aborted it
    superseded: Mutex<BTreeMap<i32, i32>>,
}

impl SessionManager {
    pub fn new(store: SessionStore, reader: PackageReader, config: &ApexConfig) -> Self {
        Self {
            store,
            reader,
            staging_root: config.staging_root.clone(),
            max_activation_attempts: config.max_activation_attempts,
            superseded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn max_activation_attempts(&self) -> u32 {
        self.max_activation_attempts
    }

    fn staging_dir(&self, id: i32) -> PathBuf {
        self.staging_root.join(format!("session_{}", id))
    }

    /// Load a session for a transition
    ///
    /// Ids removed by supersession during this process lifetime report who
    /// aborted them; anything else missing is unknown.
    fn require(&self, id: i32) -> Result<Session> {
        if let Some(session) = self.store.get(id)? {
            return Ok(session);
        }
        match self.superseded.lock().get(&id) {
            Some(by) => Err(Error::AbortedBySupersede { id, by: *by }),
            None => Err(Error::UnknownSession(id)),
        }
    }

    fn children(&self, session: &Session) -> Result<Vec<Session>> {
        let mut children = Vec::with_capacity(session.child_ids.len());
        for child_id in &session.child_ids {
            match self.store.get(*child_id)? {
                Some(child) => children.push(child),
                None => warn!("Session {} is missing child {}", session.id, child_id),
            }
        }
        Ok(children)
    }

    /// Verify and read the packages staged for one session directory
    fn verify_staged(&self, id: i32) -> Result<Vec<PackageRecord>> {
        let dir = self.staging_dir(id);
        let files = list_package_files(&dir)?;
        if files.is_empty() {
            return Err(Error::Manifest {
                path: dir,
                reason: format!("no packages staged for session {}", id),
            });
        }
        files
            .iter()
            .map(|path| {
                let pkg = self.reader.read(path, false)?;
                Ok(PackageRecord {
                    name: pkg.name,
                    version: pkg.version,
                    path: pkg.path,
                })
            })
            .collect()
    }

    /// Submit a staged session
    ///
    /// Every package of the session (or of each child) is verified first; a
    /// single failure fails the whole submission and nothing is recorded.
    /// On success, every session not yet applied to the device is aborted
    /// and removed, then the new records are written in VERIFIED.
    pub fn submit(&self, id: i32, child_ids: &[i32], is_rollback: bool) -> Result<Session> {
        let mut all_ids = BTreeSet::new();
        for sid in std::iter::once(id).chain(child_ids.iter().copied()) {
            if !all_ids.insert(sid) {
                return Err(Error::AlreadyExists(sid));
            }
            if let Some(existing) = self.store.get(sid)?
                && !existing.is_final(self.max_activation_attempts)
            {
                return Err(Error::AlreadyExists(sid));
            }
        }

        let mut children = Vec::with_capacity(child_ids.len());
        let packages = if child_ids.is_empty() {
            self.verify_staged(id)?
        } else {
            let mut all = Vec::new();
            for child_id in child_ids {
                let child_packages = self.verify_staged(*child_id)?;
                all.extend(child_packages.iter().cloned());
                children.push((*child_id, child_packages));
            }
            all
        };

        for existing in self.store.get_all()? {
            if existing.is_supersedable(self.max_activation_attempts) {
                info!(
                    "Aborting session {} ({}): superseded by session {}",
                    existing.id, existing.state, id
                );
                self.store.delete(existing.id)?;
                self.superseded.lock().insert(existing.id, id);
            }
        }
        for sid in &all_ids {
            // Remaining records with these ids are final history; replace them
            self.store.delete(*sid)?;
        }
        {
            let mut superseded = self.superseded.lock();
            for sid in &all_ids {
                superseded.remove(sid);
            }
        }

        for (child_id, child_packages) in children {
            let mut child = self.store.create(child_id)?;
            child.state = SessionState::Verified;
            child.parent_id = Some(id);
            child.is_rollback = is_rollback;
            child.packages = child_packages;
            self.store.persist(&child)?;
        }

        let mut session = self.store.create(id)?;
        session.state = SessionState::Verified;
        session.child_ids = child_ids.to_vec();
        session.is_rollback = is_rollback;
        session.packages = packages;
        self.store.persist(&session)?;

        info!(
            "Session {} verified with {} package(s)",
            id,
            session.packages.len()
        );
        Ok(session)
    }

    /// VERIFIED -> STAGED. Idempotent once STAGED.
    pub fn mark_ready(&self, id: i32) -> Result<()> {
        let session = self.require(id)?;
        match session.state {
            SessionState::Verified | SessionState::Staged => {}
            other => {
                return Err(Error::InvalidStateTransition {
                    id,
                    from: other.to_string(),
                    to: SessionState::Staged.to_string(),
                });
            }
        }
        for mut child in self.children(&session)? {
            if child.state == SessionState::Verified {
                child.state = SessionState::Staged;
                self.store.persist(&child)?;
            }
        }
        if session.state == SessionState::Verified {
            let mut session = session;
            session.state = SessionState::Staged;
            self.store.persist(&session)?;
            info!("Session {} marked ready", id);
        }
        Ok(())
    }

    /// ACTIVATED -> SUCCESS. Idempotent once SUCCESS.
    pub fn mark_successful(&self, id: i32) -> Result<()> {
        let session = self.require(id)?;
        match session.state {
            SessionState::Activated | SessionState::Success => {}
            other => {
                return Err(Error::InvalidStateTransition {
                    id,
                    from: other.to_string(),
                    to: SessionState::Success.to_string(),
                });
            }
        }
        for mut child in self.children(&session)? {
            if child.state == SessionState::Activated {
                child.state = SessionState::Success;
                self.store.persist(&child)?;
            }
        }
        if session.state == SessionState::Activated {
            let mut session = session;
            session.state = SessionState::Success;
            self.store.persist(&session)?;
            info!("Session {} marked successful", id);
        }
        Ok(())
    }

    /// Abort a session that has not been applied yet, removing its records
    pub fn abort(&self, id: i32) -> Result<()> {
        let session = self.require(id)?;
        if !session.is_supersedable(self.max_activation_attempts) {
            return Err(Error::InvalidStateTransition {
                id,
                from: session.state.to_string(),
                to: "ABORTED".to_string(),
            });
        }
        for child_id in &session.child_ids {
            self.store.delete(*child_id)?;
        }
        self.store.delete(id)?;
        info!("Session {} aborted", id);
        Ok(())
    }

    /// STAGED (or pending retry) -> ACTIVATED, boot pass only
    ///
    /// `installed` replaces the session's package records with their
    /// installed locations.
    pub(crate) fn mark_activated(&self, session: &Session, installed: &[PackageRecord]) -> Result<()> {
        let relocate = |records: &[PackageRecord]| -> Vec<PackageRecord> {
            records
                .iter()
                .map(|r| {
                    installed
                        .iter()
                        .find(|i| i.name == r.name && i.version == r.version)
                        .cloned()
                        .unwrap_or_else(|| r.clone())
                })
                .collect()
        };

        for mut child in self.children(session)? {
            child.state = SessionState::Activated;
            child.error_message = None;
            child.packages = relocate(&child.packages);
            self.store.persist(&child)?;
        }
        let mut updated = session.clone();
        updated.state = SessionState::Activated;
        updated.error_message = None;
        updated.packages = relocate(&session.packages);
        self.store.persist(&updated)?;
        info!("Session {} activated", session.id);
        Ok(())
    }

    /// Record a failed boot activation attempt
    pub(crate) fn mark_activation_failed(&self, session: &Session, error: &Error) -> Result<()> {
        let attempts = session.activation_attempts.saturating_add(1);
        for mut child in self.children(session)? {
            child.state = SessionState::ActivationFailed;
            child.activation_attempts = attempts;
            child.error_message = Some(error.to_string());
            self.store.persist(&child)?;
        }
        let mut updated = session.clone();
        updated.state = SessionState::ActivationFailed;
        updated.activation_attempts = attempts;
        updated.error_message = Some(error.to_string());
        self.store.persist(&updated)?;

        if attempts < self.max_activation_attempts {
            warn!(
                "Activation of session {} failed (attempt {}/{}), will retry next boot: {}",
                session.id, attempts, self.max_activation_attempts, error
            );
        } else {
            warn!("Activation of session {} failed permanently: {}", session.id, error);
        }
        Ok(())
    }

    /// Parent (or standalone) sessions awaiting the boot pass, by id
    pub fn sessions_to_activate(&self) -> Result<Vec<Session>> {
        Ok(self
            .store
            .get_all()?
            .into_iter()
            .filter(|s| s.parent_id.is_none() && s.awaits_activation(self.max_activation_attempts))
            .collect())
    }

    /// A parent counts as successful only when every child is
    pub fn is_successful(&self, id: i32) -> Result<bool> {
        let session = self.require(id)?;
        if session.state != SessionState::Success {
            return Ok(false);
        }
        let children = self.children(&session)?;
        Ok(children.len() == session.child_ids.len()
            && children.iter().all(|c| c.state == SessionState::Success))
    }

    /// Projection for one id; unknown ids yield the sentinel
    pub fn get_info(&self, id: i32) -> Result<SessionInfo> {
        Ok(match self.store.get(id)? {
            Some(session) => SessionInfo::from_session(&session, self.max_activation_attempts),
            None => SessionInfo::unknown(),
        })
    }

    /// Projection of every session record
    pub fn get_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(self
            .store
            .get_all()?
            .iter()
            .map(|s| SessionInfo::from_session(s, self.max_activation_attempts))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apex::{ApexBuilder, ApexManifest, SigningKeyPair, TrustStore};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: ApexConfig,
        key: SigningKeyPair,
        manager: SessionManager,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = ApexConfig::with_root(tmp.path());
        let trust = TrustStore::new(&config.trust_dir);
        let key = SigningKeyPair::generate();
        trust.trust("com.example.foo", &key).unwrap();
        let store = SessionStore::open(&config.sessions_dir).unwrap();
        let manager = SessionManager::new(store, PackageReader::new(trust), &config);
        Fixture {
            _tmp: tmp,
            config,
            key,
            manager,
        }
    }

    fn stage(f: &Fixture, id: i32, name: &str, version: u64) {
        let out = f.config.session_staging_dir(id).join(format!("{}.apex", name));
        ApexBuilder::new(ApexManifest::new(name, version))
            .build(&f.key, &out)
            .unwrap();
    }

    fn seed(f: &Fixture, id: i32, state: SessionState) {
        let mut session = f.manager.store().create(id).unwrap();
        session.state = state;
        f.manager.store().persist(&session).unwrap();
    }

    #[test]
    fn test_submit_then_ready_is_idempotent() {
        let f = fixture();
        stage(&f, 123, "com.example.foo", 1);

        let session = f.manager.submit(123, &[], false).unwrap();
        assert_eq!(session.packages.len(), 1);
        assert!(f.manager.get_info(123).unwrap().is_verified);

        f.manager.mark_ready(123).unwrap();
        let first = f.manager.get_info(123).unwrap();
        f.manager.mark_ready(123).unwrap();
        let second = f.manager.get_info(123).unwrap();
        assert!(first.is_staged);
        assert_eq!(first, second);
    }

    #[test]
    fn test_mark_ready_unknown() {
        let f = fixture();
        assert!(matches!(f.manager.mark_ready(666), Err(Error::UnknownSession(666))));
    }

    #[test]
    fn test_submit_without_packages_fails() {
        let f = fixture();
        assert!(f.manager.submit(5, &[], false).is_err());
        assert!(f.manager.get_info(5).unwrap().is_unknown);
    }

    #[test]
    fn test_submit_rejects_live_duplicate_id() {
        let f = fixture();
        stage(&f, 8, "com.example.foo", 1);
        seed(&f, 8, SessionState::Staged);
        assert!(matches!(f.manager.submit(8, &[], false), Err(Error::AlreadyExists(8))));
    }

    #[test]
    fn test_submit_replaces_final_record() {
        let f = fixture();
        stage(&f, 8, "com.example.foo", 1);
        seed(&f, 8, SessionState::Success);
        f.manager.submit(8, &[], false).unwrap();
        assert!(f.manager.get_info(8).unwrap().is_verified);
    }

    #[test]
    fn test_superseded_session_reports_abort() {
        let f = fixture();
        stage(&f, 1, "com.example.foo", 1);
        stage(&f, 2, "com.example.foo", 2);
        f.manager.submit(1, &[], false).unwrap();
        f.manager.submit(2, &[], false).unwrap();

        assert!(f.manager.get_info(1).unwrap().is_unknown);
        assert!(matches!(
            f.manager.mark_ready(1),
            Err(Error::AbortedBySupersede { id: 1, by: 2 })
        ));
        f.manager.mark_ready(2).unwrap();
    }

    #[test]
    fn test_mark_successful_transitions() {
        let f = fixture();
        seed(&f, 73, SessionState::Staged);
        seed(&f, 239, SessionState::Activated);
        seed(&f, 1543, SessionState::Success);

        assert!(matches!(
            f.manager.mark_successful(73),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert!(f.manager.get_info(73).unwrap().is_staged);

        f.manager.mark_successful(239).unwrap();
        assert!(f.manager.get_info(239).unwrap().is_success);

        f.manager.mark_successful(1543).unwrap();
        assert!(f.manager.get_info(1543).unwrap().is_success);

        assert!(matches!(f.manager.mark_successful(37), Err(Error::UnknownSession(37))));
    }

    #[test]
    fn test_parent_success_requires_children() {
        let f = fixture();
        stage(&f, 20, "com.example.foo", 1);
        stage(&f, 30, "com.example.foo", 2);
        f.manager.submit(10, &[20, 30], false).unwrap();
        f.manager.mark_ready(10).unwrap();
        assert!(f.manager.get_info(20).unwrap().is_staged);
        assert!(f.manager.get_info(30).unwrap().is_staged);

        let parent = f.manager.store().get(10).unwrap().unwrap();
        f.manager.mark_activated(&parent, &[]).unwrap();
        f.manager.mark_successful(10).unwrap();
        assert!(f.manager.is_successful(10).unwrap());

        // A child knocked back out of SUCCESS breaks the aggregate
        let mut child = f.manager.store().get(30).unwrap().unwrap();
        child.state = SessionState::Activated;
        f.manager.store().persist(&child).unwrap();
        assert!(!f.manager.is_successful(10).unwrap());
    }

    #[test]
    fn test_activation_failure_and_retry_budget() {
        let mut f = fixture();
        f.config.max_activation_attempts = 2;
        f.manager.max_activation_attempts = 2;
        seed(&f, 44, SessionState::Staged);
        let err = Error::MountFailure("boom".to_string());

        let session = f.manager.store().get(44).unwrap().unwrap();
        f.manager.mark_activation_failed(&session, &err).unwrap();
        assert!(f.manager.get_info(44).unwrap().is_activation_pending_retry);
        assert_eq!(f.manager.sessions_to_activate().unwrap().len(), 1);

        let session = f.manager.store().get(44).unwrap().unwrap();
        f.manager.mark_activation_failed(&session, &err).unwrap();
        let info = f.manager.get_info(44).unwrap();
        assert!(info.is_activation_failed);
        assert!(!info.is_activation_pending_retry);
        assert!(f.manager.sessions_to_activate().unwrap().is_empty());
    }

    #[test]
    fn test_abort() {
        let f = fixture();
        seed(&f, 1, SessionState::Verified);
        seed(&f, 2, SessionState::Activated);

        f.manager.abort(1).unwrap();
        assert!(f.manager.get_info(1).unwrap().is_unknown);
        assert!(f.manager.abort(2).is_err());
        assert!(matches!(f.manager.abort(3), Err(Error::UnknownSession(3))));
    }
}
