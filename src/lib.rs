// src/lib.rs

//! apexd: atomic update package daemon
//!
//! Stages signed package containers, tracks multi-package install sessions
//! durably across reboots, and decides which version of each package is
//! active, including shared-library packages consumed at pinned versions.
//!
//! # Architecture
//!
//! - Package reader (`apex`): opens and verifies containers against a
//!   trusted key store
//! - Sessions (`session`): crash-safe records and the session state machine
//! - Activation (`activation`): pure resolver from candidates to an active
//!   set and mount plan, plus the backend that makes a plan live
//! - Hooks (`hooks`): pre/post-install scripts, all-or-nothing
//! - Service (`service`): the operation set callers use, and the daemon
//!   implementing it

pub mod activation;
pub mod apex;
pub mod config;
mod error;
pub mod fsutil;
pub mod hooks;
pub mod lock;
pub mod service;
pub mod session;

pub use activation::{ActiveSet, DirectoryMounter, MountBackend, MountPlan, Resolution, resolve};
pub use apex::{ApexBuilder, ApexFile, ApexManifest, Package, PackageReader, SigningKeyPair, TrustStore};
pub use config::ApexConfig;
pub use error::{Error, ErrorKind, Result};
pub use hooks::{HookPhase, HookRunner};
pub use lock::DaemonLock;
pub use service::{
    ApexDaemon, ApexService, BootReport, PackageInfo, Request, Response, ServiceError, dispatch,
};
pub use session::{Session, SessionInfo, SessionManager, SessionState, SessionStore};
