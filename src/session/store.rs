// src/session/store.rs

//! Durable session records
//!
//! One file per session, `<sessions_dir>/<id>.session`, holding a single
//! line:
//!
//! ```text
//! {crc32_hex}|{json}
//! ```
//!
//! Writes go through [`fsutil::write_atomic`], so a reader observes either
//! the previous record or the complete new one. The checksum catches records
//! damaged by anything other than our own writes; such records are logged and
//! treated as absent.

use super::Session;
use crate::error::{Error, Result};
use crate::fsutil;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "session";

/// Directory-backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store rooted at `dir`
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: i32) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Start a new session record for `id`
    ///
    /// Nothing is written until [`persist`](Self::persist); callers fill in
    /// the state first so no half-initialized record is ever visible.
    pub fn create(&self, id: i32) -> Result<Session> {
        if self.record_path(id).exists() {
            return Err(Error::AlreadyExists(id));
        }
        Ok(Session::new(id))
    }

    /// Load a session, `None` if no valid record exists
    pub fn get(&self, id: i32) -> Result<Option<Session>> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode_record(&content) {
            Ok(session) => Ok(Some(session)),
            Err(reason) => {
                warn!("Ignoring session record {}: {}", path.display(), reason);
                Ok(None)
            }
        }
    }

    /// Load every valid session record, sorted by id
    pub fn get_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
            else {
                debug!("Skipping stray file {}", path.display());
                continue;
            };
            if let Some(session) = self.get(id)? {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.id);
        Ok(sessions)
    }

    /// Atomically write a session record
    pub fn persist(&self, session: &Session) -> Result<()> {
        let line = encode_record(session)?;
        fsutil::write_atomic(&self.record_path(session.id), line.as_bytes())?;
        debug!("Persisted session {} in state {}", session.id, session.state);
        Ok(())
    }

    /// Remove a session record; removing a missing record is not an error
    pub fn delete(&self, id: i32) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode_record(session: &Session) -> Result<String> {
    let json = serde_json::to_string(session)
        .map_err(|e| Error::IoError(format!("Failed to serialize session {}: {}", session.id, e)))?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{:08x}|{}\n", crc, json))
}

fn decode_record(content: &str) -> std::result::Result<Session, String> {
    let line = content.trim_end_matches('\n');
    let (crc_hex, json) = line
        .split_once('|')
        .ok_or_else(|| "missing checksum delimiter".to_string())?;
    let expected = u32::from_str_radix(crc_hex, 16).map_err(|_| format!("invalid CRC32 {}", crc_hex))?;
    let actual = crc32fast::hash(json.as_bytes());
    if expected != actual {
        return Err(format!("CRC mismatch: expected {:08x}, got {:08x}", expected, actual));
    }
    serde_json::from_str(json).map_err(|e| format!("malformed record: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::open(temp_dir.path().join("sessions")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_create_persist_get() {
        let (_tmp, store) = store();
        let mut session = store.create(123).unwrap();
        session.state = SessionState::Verified;
        session.child_ids = vec![124, 125];
        store.persist(&session).unwrap();

        let loaded = store.get(123).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(store.get(999).unwrap().is_none());
    }

    #[test]
    fn test_create_existing_fails() {
        let (_tmp, store) = store();
        let mut session = store.create(7).unwrap();
        session.state = SessionState::Staged;
        store.persist(&session).unwrap();

        assert!(matches!(store.create(7), Err(Error::AlreadyExists(7))));
    }

    #[test]
    fn test_get_all_sorted_and_delete() {
        let (_tmp, store) = store();
        for id in [73, 37, 57] {
            let mut session = store.create(id).unwrap();
            session.state = SessionState::Verified;
            store.persist(&session).unwrap();
        }
        fs::write(store.dir().join("notes.txt"), "stray").unwrap();

        let ids: Vec<i32> = store.get_all().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![37, 57, 73]);

        store.delete(57).unwrap();
        store.delete(57).unwrap();
        let ids: Vec<i32> = store.get_all().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![37, 73]);
    }

    #[test]
    fn test_corrupt_record_is_ignored() {
        let (_tmp, store) = store();
        let mut session = store.create(11).unwrap();
        session.state = SessionState::Activated;
        store.persist(&session).unwrap();

        let path = store.dir().join("11.session");
        let damaged = fs::read_to_string(&path).unwrap().replace("ACTIVATED", "SUCCESS__");
        fs::write(&path, damaged).unwrap();

        assert!(store.get(11).unwrap().is_none());
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_record_format() {
        let mut session = Session::new(1);
        session.state = SessionState::Success;
        let line = encode_record(&session).unwrap();
        let (crc, json) = line.trim_end().split_once('|').unwrap();
        assert_eq!(crc.len(), 8);
        assert!(json.contains("\"state\":\"SUCCESS\""));
        assert_eq!(decode_record(&line).unwrap(), session);
    }
}
