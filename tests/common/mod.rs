// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use apexd::{
    ApexBuilder, ApexConfig, ApexDaemon, ApexManifest, Session, SessionState, SessionStore,
    SigningKeyPair, TrustStore,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SAMPLE_FILE: &str = "etc/sample_prebuilt_file";

/// An isolated device: every configured path lives under one temp dir.
///
/// Keep the value alive for the duration of the test to prevent cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config: ApexConfig,
    pub key: SigningKeyPair,
    pub trust: TrustStore,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = ApexConfig::with_root(temp_dir.path());
        let trust = TrustStore::new(&config.trust_dir);
        Self {
            temp_dir,
            config,
            key: SigningKeyPair::generate(),
            trust,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Register the test signing key as trusted for `name`
    pub fn trust(&self, name: &str) {
        self.trust.trust(name, &self.key).unwrap();
    }

    /// Build and sign a package, trusting its name
    pub fn build(&self, builder: ApexBuilder, manifest: &ApexManifest, out: &Path) -> PathBuf {
        self.trust(&manifest.name);
        builder.build(&self.key, out).unwrap();
        out.to_path_buf()
    }

    /// Write a package into the first factory directory
    pub fn factory(&self, manifest: ApexManifest) -> PathBuf {
        let out = self.config.factory_dirs[0].join(file_name(&manifest));
        self.build(sample(manifest.clone()), &manifest, &out)
    }

    /// Write a package into the staging directory of session `id`
    pub fn stage(&self, id: i32, manifest: ApexManifest) -> PathBuf {
        self.stage_with(id, sample(manifest.clone()), &manifest)
    }

    pub fn stage_with(&self, id: i32, builder: ApexBuilder, manifest: &ApexManifest) -> PathBuf {
        let out = self.config.session_staging_dir(id).join(file_name(manifest));
        self.build(builder, manifest, &out)
    }

    /// Write a loose package file outside every managed directory
    pub fn loose(&self, manifest: ApexManifest) -> PathBuf {
        self.loose_with(sample(manifest.clone()), &manifest)
    }

    pub fn loose_with(&self, builder: ApexBuilder, manifest: &ApexManifest) -> PathBuf {
        let out = self.root().join("incoming").join(file_name(manifest));
        self.build(builder, manifest, &out)
    }

    pub fn daemon(&self) -> ApexDaemon {
        ApexDaemon::open(self.config.clone()).unwrap()
    }

    /// Write a session record directly
    pub fn seed_session(&self, id: i32, state: SessionState) {
        let store = SessionStore::open(&self.config.sessions_dir).unwrap();
        let mut session = Session::new(id);
        session.state = state;
        store.persist(&session).unwrap();
    }

    /// Directory under the package root
    pub fn mounted(&self, entry: &str) -> PathBuf {
        self.config.apex_root.join(entry)
    }

    /// Sorted entries of a directory under the package root
    pub fn list_mounted(&self, entry: &str) -> Vec<String> {
        apexd::fsutil::list_dir_names(&self.mounted(entry)).unwrap()
    }

    /// Sorted entries of the package root itself
    pub fn list_root(&self) -> Vec<String> {
        apexd::fsutil::list_dir_names(&self.config.apex_root).unwrap()
    }
}

pub fn file_name(manifest: &ApexManifest) -> String {
    format!("{}@{}.apex", manifest.name, manifest.version)
}

/// Builder with the standard sample payload
pub fn sample(manifest: ApexManifest) -> ApexBuilder {
    let content = format!("{}@{}\n", manifest.name, manifest.version).into_bytes();
    ApexBuilder::new(manifest).add_file(SAMPLE_FILE, content, 0o644)
}

pub fn manifest(name: &str, version: u64) -> ApexManifest {
    ApexManifest::new(name, version)
}

pub fn shared_lib(name: &str, version: u64) -> ApexManifest {
    let mut m = ApexManifest::new(name, version);
    m.provide_shared_libs = true;
    m
}

pub fn consumer(name: &str, version: u64, libs: &[(&str, u64)]) -> ApexManifest {
    let mut m = ApexManifest::new(name, version);
    for (lib, ver) in libs {
        m.require_shared_libs.insert(lib.to_string(), *ver);
    }
    m
}

/// Shell snippet appending `line` to the marker file `path`
pub fn append_marker(path: &Path, line: &str) -> String {
    format!("echo {} >> {}\n", line, path.display())
}

pub fn read_marker(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}
