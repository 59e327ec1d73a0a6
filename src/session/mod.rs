// src/session/mod.rs

//! Install sessions
//!
//! A session is the durable record of one (possibly multi-package) staged
//! installation. It moves through:
//!
//! ```text
//! VERIFIED -> STAGED -> ACTIVATED -> SUCCESS
//!                  \
//!                   -> ACTIVATION_FAILED (pending retry until attempts run out)
//! ```
//!
//! A session with children is a parent; children carry their own records
//! and follow the parent through every transition.

mod manager;
mod store;

pub use manager::SessionManager;
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Current session record schema
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Verified,
    Staged,
    Activated,
    Success,
    ActivationFailed,
    /// Sentinel; also what states written by a newer schema decode to
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Verified => "VERIFIED",
            Self::Staged => "STAGED",
            Self::Activated => "ACTIVATED",
            Self::Success => "SUCCESS",
            Self::ActivationFailed => "ACTIVATION_FAILED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A package belonging to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: u64,
    pub path: PathBuf,
}

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: i32,
    pub state: SessionState,
    #[serde(default)]
    pub child_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i32>,
    #[serde(default)]
    pub is_rollback: bool,
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub activation_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl Session {
    /// A fresh, not yet persisted session
    pub fn new(id: i32) -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            id,
            state: SessionState::Unknown,
            child_ids: Vec::new(),
            parent_id: None,
            is_rollback: false,
            packages: Vec::new(),
            created_at: Utc::now(),
            activation_attempts: 0,
            error_message: None,
        }
    }

    /// Failed, but another boot will re-attempt activation
    pub fn is_pending_retry(&self, max_attempts: u32) -> bool {
        self.state == SessionState::ActivationFailed && self.activation_attempts < max_attempts
    }

    /// Not yet applied to the device; a new submission supersedes it
    pub fn is_supersedable(&self, max_attempts: u32) -> bool {
        matches!(self.state, SessionState::Verified | SessionState::Staged)
            || self.is_pending_retry(max_attempts)
    }

    /// SUCCESS, or failed with no attempts left; kept only as history
    pub fn is_final(&self, max_attempts: u32) -> bool {
        match self.state {
            SessionState::Success => true,
            SessionState::ActivationFailed => !self.is_pending_retry(max_attempts),
            _ => false,
        }
    }

    /// Awaiting the boot activation pass
    pub fn awaits_activation(&self, max_attempts: u32) -> bool {
        self.state == SessionState::Staged || self.is_pending_retry(max_attempts)
    }
}

/// Boolean projection of a session, as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: i32,
    pub is_unknown: bool,
    pub is_verified: bool,
    pub is_staged: bool,
    pub is_activated: bool,
    pub is_activation_pending_retry: bool,
    pub is_activation_failed: bool,
    pub is_success: bool,
}

impl SessionInfo {
    /// Projection for an id with no record
    pub fn unknown() -> Self {
        Self {
            session_id: -1,
            is_unknown: true,
            is_verified: false,
            is_staged: false,
            is_activated: false,
            is_activation_pending_retry: false,
            is_activation_failed: false,
            is_success: false,
        }
    }

    pub fn from_session(session: &Session, max_attempts: u32) -> Self {
        let failed = session.state == SessionState::ActivationFailed;
        let pending_retry = session.is_pending_retry(max_attempts);
        Self {
            session_id: session.id,
            is_unknown: session.state == SessionState::Unknown,
            is_verified: session.state == SessionState::Verified,
            is_staged: session.state == SessionState::Staged,
            is_activated: session.state == SessionState::Activated,
            is_activation_pending_retry: pending_retry,
            is_activation_failed: failed && !pending_retry,
            is_success: session.state == SessionState::Success,
        }
    }
}
