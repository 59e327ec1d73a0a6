// src/config.rs

//! Daemon configuration
//!
//! All filesystem locations the daemon touches are explicit configuration.
//! Nothing is looked up from process-wide state, so tests can root a whole
//! daemon under a temporary directory with [`ApexConfig::with_root`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for install hooks (60 seconds)
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct ApexConfig {
    /// Directory holding one record file per session
    pub sessions_dir: PathBuf,
    /// Root of per-session staging directories (`session_<id>`)
    pub staging_root: PathBuf,
    /// Installed non-factory packages, stored as `name@version.apex`
    pub active_dir: PathBuf,
    /// Read-only preinstalled package directories
    pub factory_dirs: Vec<PathBuf>,
    /// Trusted key store: one `<package-name>.pub` file per package
    pub trust_dir: PathBuf,
    /// Installed package root (versioned mountpoints and latest aliases)
    pub apex_root: PathBuf,
    /// Timeout for each install hook
    pub hook_timeout: Duration,
    /// Boot activation attempts before a failed session is permanent
    pub max_activation_attempts: u32,
    /// Daemon lifetime lock file
    pub lock_path: PathBuf,
}

impl Default for ApexConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("/metadata/apex/sessions"),
            staging_root: PathBuf::from("/data/app-staging"),
            active_dir: PathBuf::from("/data/apex/active"),
            factory_dirs: vec![PathBuf::from("/system/apex")],
            trust_dir: PathBuf::from("/etc/security/apex"),
            apex_root: PathBuf::from("/apex"),
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            max_activation_attempts: 1,
            lock_path: PathBuf::from("/metadata/apex/apexd.lock"),
        }
    }
}

impl ApexConfig {
    /// Build a configuration with every path placed under `root`
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            sessions_dir: root.join("metadata/apex/sessions"),
            staging_root: root.join("data/app-staging"),
            active_dir: root.join("data/apex/active"),
            factory_dirs: vec![root.join("system/apex")],
            trust_dir: root.join("etc/security/apex"),
            apex_root: root.join("apex"),
            lock_path: root.join("metadata/apex/apexd.lock"),
            ..Self::default()
        }
    }

    /// Set the number of boot activation attempts
    pub fn with_max_activation_attempts(mut self, attempts: u32) -> Self {
        self.max_activation_attempts = attempts.max(1);
        self
    }

    /// Set the hook timeout
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Staging directory for a session id
    pub fn session_staging_dir(&self, id: i32) -> PathBuf {
        self.staging_root.join(format!("session_{}", id))
    }

    /// Installed location of a non-factory package
    pub fn installed_path(&self, name: &str, version: u64) -> PathBuf {
        self.active_dir.join(format!("{}@{}.apex", name, version))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct ConfigFile {
            root: Option<PathBuf>,
            sessions_dir: Option<PathBuf>,
            staging_root: Option<PathBuf>,
            active_dir: Option<PathBuf>,
            factory_dirs: Option<Vec<PathBuf>>,
            trust_dir: Option<PathBuf>,
            apex_root: Option<PathBuf>,
            hook_timeout_secs: Option<u64>,
            max_activation_attempts: Option<u32>,
            lock_path: Option<PathBuf>,
        }

        let parsed: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let mut config = match parsed.root {
            Some(root) => Self::with_root(root),
            None => Self::default(),
        };
        if let Some(v) = parsed.sessions_dir {
            config.sessions_dir = v;
        }
        if let Some(v) = parsed.staging_root {
            config.staging_root = v;
        }
        if let Some(v) = parsed.active_dir {
            config.active_dir = v;
        }
        if let Some(v) = parsed.factory_dirs {
            config.factory_dirs = v;
        }
        if let Some(v) = parsed.trust_dir {
            config.trust_dir = v;
        }
        if let Some(v) = parsed.apex_root {
            config.apex_root = v;
        }
        if let Some(v) = parsed.hook_timeout_secs {
            config.hook_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed.max_activation_attempts {
            if v == 0 {
                return Err(Error::Config(
                    "max_activation_attempts must be at least 1".to_string(),
                ));
            }
            config.max_activation_attempts = v;
        }
        if let Some(v) = parsed.lock_path {
            config.lock_path = v;
        }
        Ok(config)
    }
}
