// src/service/mod.rs

//! Service facade
//!
//! [`ApexService`] is the operation set callers use; [`ApexDaemon`] is the
//! implementation over the session, activation and hook components. The
//! facade is transport-agnostic: a transport decodes a [`Request`], hands it
//! to [`dispatch`] and encodes the [`Response`].
//!
//! ```text
//! transport ── Request ──► dispatch ──► &dyn ApexService ──► ApexDaemon
//!           ◄─ Response ──┘
//! ```
//!
//! Every operation returns either its payload or a [`ServiceError`] carrying
//! the error kind and a readable diagnostic.

mod daemon;

pub use daemon::{ApexDaemon, BootReport};

use crate::apex::Package;
use crate::error::{Error, ErrorKind};
use crate::session::{PackageRecord, SessionInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Typed failure returned to service callers
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Package description returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub package_name: String,
    pub version_code: u64,
    pub package_path: PathBuf,
    pub is_factory: bool,
    pub is_active: bool,
}

impl PackageInfo {
    pub fn from_package(pkg: &Package, is_active: bool) -> Self {
        Self {
            package_name: pkg.name.clone(),
            version_code: pkg.version,
            package_path: pkg.path.clone(),
            is_factory: pkg.is_factory,
            is_active,
        }
    }

    pub fn from_record(record: &PackageRecord) -> Self {
        Self {
            package_name: record.name.clone(),
            version_code: record.version,
            package_path: record.path.clone(),
            is_factory: false,
            is_active: false,
        }
    }
}

/// Operations exposed to callers
pub trait ApexService: Send + Sync {
    /// Verify and install packages for activation at next boot
    ///
    /// `Ok(false)` when a package fails verification; nothing is installed then.
    fn stage_packages(&self, paths: &[PathBuf]) -> ServiceResult<bool>;

    fn stage_package(&self, path: &Path) -> ServiceResult<bool> {
        self.stage_packages(&[path.to_path_buf()])
    }

    /// Verify a staged session; `false` with no packages on verification failure
    ///
    /// `is_rollback` is recorded on the session and its children.
    fn submit_staged_session(
        &self,
        session_id: i32,
        child_session_ids: &[i32],
        is_rollback: bool,
    ) -> ServiceResult<(Vec<PackageInfo>, bool)>;

    fn mark_staged_session_ready(&self, session_id: i32) -> ServiceResult<bool>;

    fn mark_staged_session_successful(&self, session_id: i32) -> ServiceResult<()>;

    fn abort_staged_session(&self, session_id: i32) -> ServiceResult<()>;

    fn get_sessions(&self) -> ServiceResult<Vec<SessionInfo>>;

    /// Projection of one session; unknown ids yield the sentinel
    fn get_staged_session_info(&self, session_id: i32) -> ServiceResult<SessionInfo>;

    fn get_active_packages(&self) -> ServiceResult<Vec<PackageInfo>>;

    fn get_active_package(&self, package_name: &str) -> ServiceResult<Option<PackageInfo>>;

    fn activate_package(&self, path: &Path) -> ServiceResult<()>;

    fn deactivate_package(&self, path: &Path) -> ServiceResult<()>;

    fn preinstall_packages(&self, paths: &[PathBuf]) -> ServiceResult<()>;

    fn postinstall_packages(&self, paths: &[PathBuf]) -> ServiceResult<()>;
}

/// A decoded service call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    StagePackages {
        paths: Vec<PathBuf>,
    },
    SubmitStagedSession {
        session_id: i32,
        #[serde(default)]
        child_session_ids: Vec<i32>,
        #[serde(default)]
        is_rollback: bool,
    },
    MarkStagedSessionReady {
        session_id: i32,
    },
    MarkStagedSessionSuccessful {
        session_id: i32,
    },
    AbortStagedSession {
        session_id: i32,
    },
    GetSessions,
    GetStagedSessionInfo {
        session_id: i32,
    },
    GetActivePackages,
    GetActivePackage {
        package_name: String,
    },
    ActivatePackage {
        path: PathBuf,
    },
    DeactivatePackage {
        path: PathBuf,
    },
    PreinstallPackages {
        paths: Vec<PathBuf>,
    },
    PostinstallPackages {
        paths: Vec<PathBuf>,
    },
}

/// Result of a dispatched call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "camelCase")]
pub enum Response {
    Done,
    Bool(bool),
    Submitted {
        packages: Vec<PackageInfo>,
        success: bool,
    },
    Sessions(Vec<SessionInfo>),
    Session(SessionInfo),
    Packages(Vec<PackageInfo>),
    Package(Option<PackageInfo>),
    Error(ServiceError),
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

fn respond<T>(result: ServiceResult<T>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(e) => Response::Error(e),
    }
}

/// Route one request to `service`
pub fn dispatch(service: &dyn ApexService, request: Request) -> Response {
    match request {
        Request::StagePackages { paths } => respond(service.stage_packages(&paths), Response::Bool),
        Request::SubmitStagedSession {
            session_id,
            child_session_ids,
            is_rollback,
        } => respond(
            service.submit_staged_session(session_id, &child_session_ids, is_rollback),
            |(packages, success)| Response::Submitted { packages, success },
        ),
        Request::MarkStagedSessionReady { session_id } => {
            respond(service.mark_staged_session_ready(session_id), Response::Bool)
        }
        Request::MarkStagedSessionSuccessful { session_id } => {
            respond(service.mark_staged_session_successful(session_id), |()| Response::Done)
        }
        Request::AbortStagedSession { session_id } => {
            respond(service.abort_staged_session(session_id), |()| Response::Done)
        }
        Request::GetSessions => respond(service.get_sessions(), Response::Sessions),
        Request::GetStagedSessionInfo { session_id } => {
            respond(service.get_staged_session_info(session_id), Response::Session)
        }
        Request::GetActivePackages => respond(service.get_active_packages(), Response::Packages),
        Request::GetActivePackage { package_name } => {
            respond(service.get_active_package(&package_name), Response::Package)
        }
        Request::ActivatePackage { path } => {
            respond(service.activate_package(&path), |()| Response::Done)
        }
        Request::DeactivatePackage { path } => {
            respond(service.deactivate_package(&path), |()| Response::Done)
        }
        Request::PreinstallPackages { paths } => {
            respond(service.preinstall_packages(&paths), |()| Response::Done)
        }
        Request::PostinstallPackages { paths } => {
            respond(service.postinstall_packages(&paths), |()| Response::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Service answering every call with a canned value
    struct Canned;

    impl ApexService for Canned {
        fn stage_packages(&self, paths: &[PathBuf]) -> ServiceResult<bool> {
            Ok(!paths.is_empty())
        }
        fn submit_staged_session(
            &self,
            id: i32,
            _: &[i32],
            is_rollback: bool,
        ) -> ServiceResult<(Vec<PackageInfo>, bool)> {
            Ok((Vec::new(), id > 0 && !is_rollback))
        }
        fn mark_staged_session_ready(&self, id: i32) -> ServiceResult<bool> {
            Err(Error::UnknownSession(id).into())
        }
        fn mark_staged_session_successful(&self, _: i32) -> ServiceResult<()> {
            Ok(())
        }
        fn abort_staged_session(&self, _: i32) -> ServiceResult<()> {
            Ok(())
        }
        fn get_sessions(&self) -> ServiceResult<Vec<SessionInfo>> {
            Ok(Vec::new())
        }
        fn get_staged_session_info(&self, _: i32) -> ServiceResult<SessionInfo> {
            Ok(SessionInfo::unknown())
        }
        fn get_active_packages(&self) -> ServiceResult<Vec<PackageInfo>> {
            Ok(Vec::new())
        }
        fn get_active_package(&self, _: &str) -> ServiceResult<Option<PackageInfo>> {
            Ok(None)
        }
        fn activate_package(&self, _: &Path) -> ServiceResult<()> {
            Ok(())
        }
        fn deactivate_package(&self, path: &Path) -> ServiceResult<()> {
            Err(Error::NotFound(path.display().to_string()).into())
        }
        fn preinstall_packages(&self, _: &[PathBuf]) -> ServiceResult<()> {
            Ok(())
        }
        fn postinstall_packages(&self, _: &[PathBuf]) -> ServiceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_str(
            r#"{"op": "submitStagedSession", "sessionId": 239, "childSessionIds": [240]}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::SubmitStagedSession {
                session_id: 239,
                child_session_ids: vec![240],
                is_rollback: false
            }
        );

        let request: Request = serde_json::from_str(
            r#"{"op": "submitStagedSession", "sessionId": 7, "isRollback": true}"#,
        )
        .unwrap();
        assert_eq!(
            dispatch(&Canned, request),
            Response::Submitted {
                packages: Vec::new(),
                success: false
            }
        );

        let request: Request = serde_json::from_str(r#"{"op": "getSessions"}"#).unwrap();
        assert_eq!(request, Request::GetSessions);
    }

    #[test]
    fn test_dispatch_success_and_error() {
        let response = dispatch(&Canned, Request::GetStagedSessionInfo { session_id: 5 });
        assert_eq!(response, Response::Session(SessionInfo::unknown()));

        let response = dispatch(&Canned, Request::MarkStagedSessionReady { session_id: 5 });
        match response {
            Response::Error(e) => {
                assert_eq!(e.kind, ErrorKind::UnknownSession);
                assert!(e.message.contains('5'));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_response_wire_format() {
        let response = dispatch(
            &Canned,
            Request::DeactivatePackage {
                path: PathBuf::from("/data/x.apex"),
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["value"]["kind"], "NotFound");

        let json = serde_json::to_value(Response::Bool(true)).unwrap();
        assert_eq!(json, serde_json::json!({"result": "bool", "value": true}));
    }
}
