// src/apex/mod.rs

//! Package reader
//!
//! A package is a gzip-compressed tar archive:
//!
//! ```text
//! apex_manifest.json   name, version, shared-library flags, hooks
//! apex_pubkey          base64 Ed25519 public key of the signer
//! apex_signature       base64 signature over the content digest
//! payload/...          files exposed at the package mountpoint
//! ```
//!
//! Opening a package is side-effect free: the archive is parsed, the
//! signature checked against the embedded key, and the embedded key compared
//! with the trusted key registered for the package name.

pub mod builder;
pub mod manifest;
pub mod signing;

pub use builder::ApexBuilder;
pub use manifest::ApexManifest;
pub use signing::{SigningKeyPair, TrustStore};

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};

/// Archive entry holding the signer's public key
pub const PUBKEY_ENTRY: &str = "apex_pubkey";
/// Archive entry holding the content signature
pub const SIGNATURE_ENTRY: &str = "apex_signature";
/// Directory prefix of payload entries
pub const PAYLOAD_PREFIX: &str = "payload";
/// File extension of package containers
pub const PACKAGE_EXTENSION: &str = "apex";

/// A verified package. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: u64,
    pub path: PathBuf,
    pub is_factory: bool,
    pub exports_shared_libs: bool,
    /// Library provider name -> pinned provider version
    pub required_lib_versions: BTreeMap<String, u64>,
    pub pre_install_hook: Option<String>,
    pub post_install_hook: Option<String>,
}

impl Package {
    /// `name@version`, the versioned mountpoint name
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// One payload file
#[derive(Debug, Clone)]
pub(crate) struct PayloadFile {
    pub content: Vec<u8>,
    pub mode: u32,
}

/// SHA-256 over the manifest bytes and every payload file in path order
pub(crate) fn content_digest(manifest: &[u8], payload: &BTreeMap<String, PayloadFile>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(manifest);
    for (path, file) in payload {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((file.content.len() as u64).to_le_bytes());
        hasher.update(&file.content);
    }
    hasher.finalize().to_vec()
}

/// Raw archive contents before verification
struct RawArchive {
    manifest: Option<Vec<u8>>,
    pubkey: Option<String>,
    signature: Option<String>,
    payload: BTreeMap<String, PayloadFile>,
}

fn open_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::Open {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Only plain relative paths may appear in an archive
fn normalize_entry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn read_archive(path: &Path) -> Result<RawArchive> {
    let file = File::open(path).map_err(|e| open_error(path, format!("I/O error: {}", e)))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut raw = RawArchive {
        manifest: None,
        pubkey: None,
        signature: None,
        payload: BTreeMap::new(),
    };

    let entries = archive
        .entries()
        .map_err(|e| open_error(path, format!("not a package archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| open_error(path, format!("corrupt archive: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_path = entry
            .path()
            .map_err(|e| open_error(path, format!("corrupt entry path: {}", e)))?
            .into_owned();
        let Some(name) = normalize_entry_path(&entry_path) else {
            return Err(open_error(
                path,
                format!("unsafe entry path: {}", entry_path.display()),
            ));
        };
        let mode = entry.header().mode().unwrap_or(0o644);
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| open_error(path, format!("I/O error: {}", e)))?;

        match name.as_str() {
            manifest::MANIFEST_ENTRY => raw.manifest = Some(content),
            PUBKEY_ENTRY => raw.pubkey = Some(String::from_utf8_lossy(&content).into_owned()),
            SIGNATURE_ENTRY => {
                raw.signature = Some(String::from_utf8_lossy(&content).into_owned())
            }
            other => {
                if let Some(rel) = other.strip_prefix("payload/") {
                    raw.payload.insert(rel.to_string(), PayloadFile { content, mode });
                } else {
                    debug!("Ignoring unknown entry {} in {}", other, path.display());
                }
            }
        }
    }
    Ok(raw)
}

/// An opened, verified package container
#[derive(Debug, Clone)]
pub struct ApexFile {
    path: PathBuf,
    manifest: ApexManifest,
    public_key: String,
    digest: Vec<u8>,
    payload_files: Vec<String>,
}

impl ApexFile {
    /// Open and verify a package against the trusted key store
    pub fn open(path: &Path, trust: &TrustStore) -> Result<Self> {
        let raw = read_archive(path)?;

        let manifest_bytes = raw.manifest.ok_or_else(|| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("missing {}", manifest::MANIFEST_ENTRY),
        })?;
        let manifest = ApexManifest::parse(&manifest_bytes).map_err(|reason| Error::Manifest {
            path: path.to_path_buf(),
            reason,
        })?;
        for hook in [&manifest.pre_install_hook, &manifest.post_install_hook]
            .into_iter()
            .flatten()
        {
            if !raw.payload.contains_key(hook) {
                return Err(Error::Manifest {
                    path: path.to_path_buf(),
                    reason: format!("hook {} is not part of the payload", hook),
                });
            }
        }

        let bad_signature = |reason: String| Error::BadSignature {
            path: path.to_path_buf(),
            reason,
        };
        let public_key = raw
            .pubkey
            .map(|k| k.trim().to_string())
            .ok_or_else(|| bad_signature("package carries no public key".to_string()))?;
        let signature = raw
            .signature
            .ok_or_else(|| bad_signature("package is not signed".to_string()))?;

        let digest = content_digest(&manifest_bytes, &raw.payload);
        signing::verify_signature(&public_key, &digest, &signature).map_err(bad_signature)?;

        let trusted = trust.trusted_key(&manifest.name).map_err(|e| {
            bad_signature(format!("unreadable trusted key for {}: {}", manifest.name, e))
        })?;
        match trusted {
            None => {
                return Err(Error::MissingTrustedKey {
                    path: path.to_path_buf(),
                    package: manifest.name.clone(),
                    key_path: trust.key_path(&manifest.name),
                });
            }
            Some(trusted) if trusted.trim() != public_key => {
                return Err(Error::KeyMismatch {
                    path: path.to_path_buf(),
                    package: manifest.name.clone(),
                });
            }
            Some(_) => {}
        }

        debug!(
            "Verified {} version {} ({} payload files, digest {})",
            manifest.name,
            manifest.version,
            raw.payload.len(),
            hex::encode(&digest)
        );

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            public_key,
            digest,
            payload_files: raw.payload.keys().cloned().collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &ApexManifest {
        &self.manifest
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Hex SHA-256 content digest the signature covers
    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Payload-relative paths of every payload file
    pub fn payload_files(&self) -> &[String] {
        &self.payload_files
    }

    /// Build the immutable data-model view of this package
    pub fn to_package(&self, is_factory: bool) -> Package {
        Package {
            name: self.manifest.name.clone(),
            version: self.manifest.version,
            path: self.path.clone(),
            is_factory,
            exports_shared_libs: self.manifest.provide_shared_libs,
            required_lib_versions: self.manifest.require_shared_libs.clone(),
            pre_install_hook: self.manifest.pre_install_hook.clone(),
            post_install_hook: self.manifest.post_install_hook.clone(),
        }
    }

    /// Write the payload tree under `dest`
    ///
    /// The archive is re-read, so the content is checked against the digest
    /// computed at open time before anything is written.
    pub fn extract_payload(&self, dest: &Path) -> Result<()> {
        extract_verified_payload(&self.path, &self.digest, dest)
    }
}

fn extract_verified_payload(path: &Path, digest: &[u8], dest: &Path) -> Result<()> {
    let raw = read_archive(path)?;
    let manifest_bytes = raw.manifest.unwrap_or_default();
    if content_digest(&manifest_bytes, &raw.payload) != digest {
        return Err(Error::BadSignature {
            path: path.to_path_buf(),
            reason: "package changed after verification".to_string(),
        });
    }

    fs::create_dir_all(dest)?;
    for (rel, file) in &raw.payload {
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &file.content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(file.mode & 0o7777))?;
        }
    }
    Ok(())
}

/// Opens packages against one trusted key store
#[derive(Debug, Clone)]
pub struct PackageReader {
    trust: TrustStore,
}

impl PackageReader {
    pub fn new(trust: TrustStore) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Open a package file
    pub fn open(&self, path: &Path) -> Result<ApexFile> {
        ApexFile::open(path, &self.trust)
    }

    /// Open a package file and return its data-model view
    pub fn read(&self, path: &Path, is_factory: bool) -> Result<Package> {
        Ok(self.open(path)?.to_package(is_factory))
    }

    /// Read every package in a directory, sorted by file name
    ///
    /// Invalid packages are logged and skipped; a missing directory yields
    /// no packages.
    pub fn scan_dir(&self, dir: &Path, is_factory: bool) -> Result<Vec<Package>> {
        let mut packages = Vec::new();
        for path in list_package_files(dir)? {
            match self.read(&path, is_factory) {
                Ok(pkg) => packages.push(pkg),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(packages)
    }
}

/// Package files (`*.apex`) directly inside `dir`, sorted by file name
pub fn list_package_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == PACKAGE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn build(dir: &Path, manifest: ApexManifest, key: &SigningKeyPair) -> PathBuf {
        let out = dir.join(format!("{}.apex", manifest.name));
        ApexBuilder::new(manifest)
            .add_file("etc/sample_prebuilt_file", b"sample".to_vec(), 0o644)
            .build(key, &out)
            .unwrap();
        out
    }

    #[test]
    fn test_open_verified_package() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path().join("trust"));
        let key = SigningKeyPair::generate();
        trust.trust("com.example.foo", &key).unwrap();

        let path = build(temp_dir.path(), ApexManifest::new("com.example.foo", 3), &key);
        let apex = ApexFile::open(&path, &trust).unwrap();

        assert_eq!(apex.manifest().name, "com.example.foo");
        assert_eq!(apex.manifest().version, 3);
        assert_eq!(apex.payload_files(), ["etc/sample_prebuilt_file"]);
        assert_eq!(apex.digest_hex().len(), 64);
        let pkg = apex.to_package(false);
        assert_eq!(pkg.id(), "com.example.foo@3");
        assert!(!pkg.is_factory);
    }

    #[test]
    fn test_missing_trusted_key() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path().join("trust"));
        let key = SigningKeyPair::generate();

        let path = build(temp_dir.path(), ApexManifest::new("com.example.no_inst_key", 1), &key);
        let err = ApexFile::open(&path, &trust).unwrap_err();

        assert!(matches!(err, Error::MissingTrustedKey { .. }));
        assert_eq!(err.kind(), ErrorKind::Signature);
    }

    #[test]
    fn test_key_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path().join("trust"));
        let signer = SigningKeyPair::generate();
        trust.trust("com.example.foo", &SigningKeyPair::generate()).unwrap();

        let path = build(temp_dir.path(), ApexManifest::new("com.example.foo", 1), &signer);
        let err = ApexFile::open(&path, &trust).unwrap_err();

        assert!(matches!(err, Error::KeyMismatch { .. }));
        assert!(err.to_string().contains("couldn't verify public key"));
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path());
        let err = ApexFile::open(&temp_dir.path().join("nope.apex"), &trust).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Open);
        assert!(err.to_string().contains("Failed to open package"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_open_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path());
        let path = temp_dir.path().join("garbage.apex");
        fs::write(&path, b"definitely not gzip").unwrap();

        assert_eq!(ApexFile::open(&path, &trust).unwrap_err().kind(), ErrorKind::Open);
    }

    #[test]
    fn test_extract_payload() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path().join("trust"));
        let key = SigningKeyPair::generate();
        trust.trust("com.example.foo", &key).unwrap();
        let path = build(temp_dir.path(), ApexManifest::new("com.example.foo", 1), &key);

        let apex = ApexFile::open(&path, &trust).unwrap();
        let dest = temp_dir.path().join("mnt");
        apex.extract_payload(&dest).unwrap();

        assert_eq!(fs::read(dest.join("etc/sample_prebuilt_file")).unwrap(), b"sample");
    }

    #[test]
    fn test_scan_dir_skips_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let trust = TrustStore::new(temp_dir.path().join("trust"));
        let key = SigningKeyPair::generate();
        trust.trust("com.example.foo", &key).unwrap();

        let pkg_dir = temp_dir.path().join("system");
        fs::create_dir_all(&pkg_dir).unwrap();
        build(&pkg_dir, ApexManifest::new("com.example.foo", 1), &key);
        build(&pkg_dir, ApexManifest::new("com.example.untrusted", 1), &key);
        fs::write(pkg_dir.join("notes.txt"), "ignored").unwrap();

        let reader = PackageReader::new(trust);
        let packages = reader.scan_dir(&pkg_dir, true).unwrap();
        assert_eq!(packages.len(), 1);
        assert!(packages[0].is_factory);
        assert!(reader.scan_dir(&temp_dir.path().join("missing"), true).unwrap().is_empty());
    }
}
