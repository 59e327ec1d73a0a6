// src/hooks.rs

//! Pre/post-install hook execution
//!
//! A package may declare a pre-install and a post-install hook: shell
//! scripts shipped in its payload. Hooks run with the package's mount point
//! as working directory and receive:
//!
//! - `APEX_PACKAGE_NAME`, `APEX_PACKAGE_VERSION`
//! - `APEX_MOUNT_POINT`: where the payload is visible
//! - `APEX_PHASE`: `pre-install` or `post-install`
//!
//! Multi-package runs are all-or-nothing: hooks run in submission order and
//! the first failure stops the run.

use crate::apex::{ApexFile, Package, PackageReader};
use crate::error::{Error, Result};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

const INTERPRETER: &str = "/bin/sh";

/// Hook phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreInstall,
    PostInstall,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
        }
    }

    /// Payload-relative hook script declared by `pkg` for this phase
    pub fn script<'a>(&self, pkg: &'a Package) -> Option<&'a str> {
        match self {
            Self::PreInstall => pkg.pre_install_hook.as_deref(),
            Self::PostInstall => pkg.post_install_hook.as_deref(),
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package together with the directory its payload is visible at
#[derive(Debug, Clone)]
pub struct HookContext {
    pub package: Package,
    pub mount_point: PathBuf,
}

/// Payloads extracted to private directories for the duration of a hook run
///
/// Dropping the value removes every directory.
pub struct TempMounts {
    _dirs: Vec<TempDir>,
    contexts: Vec<HookContext>,
}

impl TempMounts {
    /// Extract each package's payload to its own temporary directory
    pub fn extract(packages: &[(ApexFile, Package)]) -> Result<Self> {
        let mut dirs = Vec::with_capacity(packages.len());
        let mut contexts = Vec::with_capacity(packages.len());
        for (apex, package) in packages {
            let dir = tempfile::Builder::new()
                .prefix(&format!("{}.", package.id()))
                .tempdir()?;
            apex.extract_payload(dir.path())?;
            contexts.push(HookContext {
                package: package.clone(),
                mount_point: dir.path().to_path_buf(),
            });
            dirs.push(dir);
        }
        Ok(Self {
            _dirs: dirs,
            contexts,
        })
    }

    pub fn contexts(&self) -> &[HookContext] {
        &self.contexts
    }
}

/// Log every line of a hook's output stream on a background thread
fn drain<R: Read + Send + 'static>(pipe: R, phase: HookPhase, is_stderr: bool) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if is_stderr {
                warn!("[{}] {}", phase, line);
            } else {
                info!("[{}] {}", phase, line);
            }
        }
    })
}

/// Runs package hooks with a timeout
#[derive(Debug, Clone)]
pub struct HookRunner {
    timeout: Duration,
}

impl HookRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `phase` hooks for every context in order, stopping at the first failure
    pub fn run_phase(&self, contexts: &[HookContext], phase: HookPhase) -> Result<()> {
        for ctx in contexts {
            self.run_hook(ctx, phase)?;
        }
        Ok(())
    }

    /// Run one package's hook for `phase`; packages without one succeed
    pub fn run_hook(&self, ctx: &HookContext, phase: HookPhase) -> Result<()> {
        let pkg = &ctx.package;
        let Some(script) = phase.script(pkg) else {
            debug!("{} declares no {} hook", pkg.id(), phase);
            return Ok(());
        };
        let failure = |reason: String| Error::HookFailure {
            package: pkg.id(),
            phase: phase.to_string(),
            reason,
        };

        let script_path = ctx.mount_point.join(script);
        if !script_path.is_file() {
            return Err(failure(format!("hook {} not found at mount point", script)));
        }

        info!("Running {} hook for {}", phase, pkg.id());
        let mut child = Command::new(INTERPRETER)
            .arg(&script_path)
            .current_dir(&ctx.mount_point)
            .env("APEX_PACKAGE_NAME", &pkg.name)
            .env("APEX_PACKAGE_VERSION", pkg.version.to_string())
            .env("APEX_MOUNT_POINT", &ctx.mount_point)
            .env("APEX_PHASE", phase.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failure(format!("failed to spawn {}: {}", INTERPRETER, e)))?;

        // Drain both pipes while waiting so a chatty hook never blocks on write
        let stdout = child.stdout.take().map(|out| drain(out, phase, false));
        let stderr = child.stderr.take().map(|err| drain(err, phase, true));

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                for reader in [stdout, stderr].into_iter().flatten() {
                    let _ = reader.join();
                }

                if status.success() {
                    Ok(())
                } else {
                    Err(failure(format!(
                        "exited with code {}",
                        status.code().unwrap_or(-1)
                    )))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                // Readers finish once every process holding the pipes is gone
                Err(failure(format!("timed out after {} seconds", self.timeout.as_secs())))
            }
        }
    }

    /// Verify `paths`, extract them to temporary mounts and run `phase`
    ///
    /// Every package is verified before any hook runs. The packages never
    /// become active.
    pub fn run_standalone(
        &self,
        reader: &PackageReader,
        paths: &[&Path],
        phase: HookPhase,
    ) -> Result<()> {
        let mut opened = Vec::with_capacity(paths.len());
        for path in paths {
            let apex = reader.open(path)?;
            let package = apex.to_package(false);
            opened.push((apex, package));
        }
        let mounts = TempMounts::extract(&opened)?;
        self.run_phase(mounts.contexts(), phase)
    }
}
