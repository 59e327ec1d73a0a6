// src/apex/builder.rs
//! Package container builder
//!
//! Produces signed package archives. Used by the `apexd pack` command and by
//! tests to create fixture packages.

use super::manifest::{ApexManifest, MANIFEST_ENTRY};
use super::signing::SigningKeyPair;
use super::{PAYLOAD_PREFIX, PUBKEY_ENTRY, PayloadFile, SIGNATURE_ENTRY, content_digest};
use crate::error::{Error, Result};
use crate::fsutil;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Builder for a signed package container
#[derive(Debug, Clone)]
pub struct ApexBuilder {
    manifest: ApexManifest,
    payload: BTreeMap<String, PayloadFile>,
}

impl ApexBuilder {
    pub fn new(manifest: ApexManifest) -> Self {
        Self {
            manifest,
            payload: BTreeMap::new(),
        }
    }

    /// Add one payload file at a payload-relative path
    pub fn add_file(mut self, rel_path: &str, content: Vec<u8>, mode: u32) -> Self {
        self.payload
            .insert(rel_path.trim_start_matches('/').to_string(), PayloadFile { content, mode });
        self
    }

    /// Add a shell script hook and point the manifest at it
    pub fn pre_install_hook(mut self, rel_path: &str, script: &str) -> Self {
        self.manifest.pre_install_hook = Some(rel_path.to_string());
        self.add_file(rel_path, script.as_bytes().to_vec(), 0o755)
    }

    /// Add a shell script hook and point the manifest at it
    pub fn post_install_hook(mut self, rel_path: &str, script: &str) -> Self {
        self.manifest.post_install_hook = Some(rel_path.to_string());
        self.add_file(rel_path, script.as_bytes().to_vec(), 0o755)
    }

    /// Add every regular file below `dir` to the payload
    pub fn add_dir(mut self, dir: &Path) -> Result<Self> {
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::IoError(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            let content = fs::read(entry.path())?;
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                entry.metadata().map_err(|e| Error::IoError(e.to_string()))?.permissions().mode()
            };
            #[cfg(not(unix))]
            let mode = 0o644;
            self = self.add_file(&rel, content, mode);
        }
        Ok(self)
    }

    /// Sign the package and write the archive to `out`
    pub fn build(&self, key: &SigningKeyPair, out: &Path) -> Result<()> {
        self.manifest.validate().map_err(|reason| Error::Manifest {
            path: out.to_path_buf(),
            reason,
        })?;

        let manifest_bytes = self.manifest.to_bytes();
        let digest = content_digest(&manifest_bytes, &self.payload);
        let signature = key.sign(&digest);

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        append(&mut tar, MANIFEST_ENTRY, &manifest_bytes, 0o644)?;
        append(&mut tar, PUBKEY_ENTRY, key.public_key_base64().as_bytes(), 0o644)?;
        append(&mut tar, SIGNATURE_ENTRY, signature.as_bytes(), 0o644)?;
        for (rel, file) in &self.payload {
            append(&mut tar, &format!("{}/{}", PAYLOAD_PREFIX, rel), &file.content, file.mode)?;
        }
        let bytes = tar.into_inner()?.finish()?;

        fsutil::write_atomic(out, &bytes)
    }
}

fn append<W: std::io::Write>(
    tar: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    tar.append_data(&mut header, path, data)?;
    Ok(())
}
