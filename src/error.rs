// src/error.rs

//! Crate-wide error type
//!
//! Every variant maps onto exactly one [`ErrorKind`]. The kind is what the
//! service layer reports to callers; the variant carries the diagnostic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification surfaced to service callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Open,
    Manifest,
    Signature,
    UnknownSession,
    InvalidStateTransition,
    AbortedBySupersede,
    HookFailure,
    MountFailure,
    UnresolvedLibraryVersion,
    AlreadyExists,
    NotFound,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OpenError",
            Self::Manifest => "ManifestError",
            Self::Signature => "SignatureError",
            Self::UnknownSession => "UnknownSession",
            Self::InvalidStateTransition => "InvalidStateTransition",
            Self::AbortedBySupersede => "AbortedBySupersede",
            Self::HookFailure => "HookFailure",
            Self::MountFailure => "MountFailure",
            Self::UnresolvedLibraryVersion => "UnresolvedLibraryVersion",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotFound => "NotFound",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open package {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Invalid manifest in {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Error verifying {path}: no trusted key for {package} at {key_path}")]
    MissingTrustedKey {
        path: PathBuf,
        package: String,
        key_path: PathBuf,
    },

    #[error(
        "Error verifying {path}: couldn't verify public key: bundled key for {package} does not match trusted key"
    )]
    KeyMismatch { path: PathBuf, package: String },

    #[error("Error verifying {path}: {reason}")]
    BadSignature { path: PathBuf, reason: String },

    #[error("Unknown session {0}")]
    UnknownSession(i32),

    #[error("Session {id}: cannot transition from {from} to {to}")]
    InvalidStateTransition { id: i32, from: String, to: String },

    #[error("Session {id} was aborted by submission of session {by}")]
    AbortedBySupersede { id: i32, by: i32 },

    #[error("{phase} hook for {package} failed: {reason}")]
    HookFailure {
        package: String,
        phase: String,
        reason: String,
    },

    #[error("Mount failure: {0}")]
    MountFailure(String),

    #[error("{consumer} requires {library}@{version}, which is not available")]
    UnresolvedLibraryVersion {
        consumer: String,
        library: String,
        version: u64,
    },

    #[error("Session {0} already exists")]
    AlreadyExists(i32),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl Error {
    /// Classification reported to service callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::Open,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::MissingTrustedKey { .. } | Self::KeyMismatch { .. } | Self::BadSignature { .. } => {
                ErrorKind::Signature
            }
            Self::UnknownSession(_) => ErrorKind::UnknownSession,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::AbortedBySupersede { .. } => ErrorKind::AbortedBySupersede,
            Self::HookFailure { .. } => ErrorKind::HookFailure,
            Self::MountFailure(_) => ErrorKind::MountFailure,
            Self::UnresolvedLibraryVersion { .. } => ErrorKind::UnresolvedLibraryVersion,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::IoError(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_variants_share_kind() {
        let missing = Error::MissingTrustedKey {
            path: PathBuf::from("/data/a.apex"),
            package: "com.example.a".to_string(),
            key_path: PathBuf::from("/etc/security/apex/com.example.a.pub"),
        };
        let mismatch = Error::KeyMismatch {
            path: PathBuf::from("/data/a.apex"),
            package: "com.example.a".to_string(),
        };
        assert_eq!(missing.kind(), ErrorKind::Signature);
        assert_eq!(mismatch.kind(), ErrorKind::Signature);
        assert_ne!(missing.to_string(), mismatch.to_string());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("I/O error"));
    }
}
