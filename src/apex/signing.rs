// src/apex/signing.rs
//! Package signing keys and the trusted key store
//!
//! Packages are signed with Ed25519. The signer's public key travels inside
//! the package; the trusted key store holds, per package name, the only key
//! that package is allowed to carry.

use crate::error::{Error, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ALGORITHM: &str = "ed25519";

/// A signing key pair for packages
pub struct SigningKeyPair {
    signing_key: SigningKey,
    key_id: Option<String>,
}

impl SigningKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            key_id: None,
        }
    }

    /// Set a human-readable key identifier
    pub fn with_key_id(mut self, id: &str) -> Self {
        self.key_id = Some(id.to_string());
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key as base64, the form embedded in packages and key files
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Sign a content digest, returning the base64 signature
    pub fn sign(&self, digest: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(digest).to_bytes())
    }

    /// Save the private key and the public key as separate key files
    pub fn save_to_files(&self, private_path: &Path, public_path: &Path) -> Result<()> {
        let private_data = KeyFile {
            algorithm: ALGORITHM.to_string(),
            key: BASE64.encode(self.signing_key.to_bytes()),
            key_id: self.key_id.clone(),
        };
        write_key_file(private_path, &private_data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(private_path, fs::Permissions::from_mode(0o600))?;
        }

        self.save_public_key(public_path)
    }

    /// Save only the public key, e.g. into a trusted key store
    pub fn save_public_key(&self, public_path: &Path) -> Result<()> {
        let public_data = KeyFile {
            algorithm: ALGORITHM.to_string(),
            key: self.public_key_base64(),
            key_id: self.key_id.clone(),
        };
        write_key_file(public_path, &public_data)
    }

    /// Load a key pair from a private key file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let key_file = read_key_file(path)?;
        let key_array: [u8; 32] = BASE64
            .decode(&key_file.key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::Config(format!("Invalid key in {}", path.display())))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_array),
            key_id: key_file.key_id,
        })
    }
}

/// Key file format
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    algorithm: String,
    key: String,
    #[serde(default)]
    key_id: Option<String>,
}

fn write_key_file(path: &Path, data: &KeyFile) -> Result<()> {
    let content = toml::to_string_pretty(data)
        .map_err(|e| Error::Config(format!("Failed to encode key file: {}", e)))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))
}

fn read_key_file(path: &Path) -> Result<KeyFile> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
    let key_file: KeyFile = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    if key_file.algorithm != ALGORITHM {
        return Err(Error::Config(format!(
            "Unsupported key algorithm in {}: {}",
            path.display(),
            key_file.algorithm
        )));
    }
    Ok(key_file)
}

/// Load a base64 public key from a key file
pub fn load_public_key(path: &Path) -> Result<String> {
    Ok(read_key_file(path)?.key)
}

/// Verify a base64 signature over `digest` with a base64 public key
pub fn verify_signature(public_key: &str, digest: &[u8], signature: &str) -> std::result::Result<(), String> {
    let key_bytes: [u8; 32] = BASE64
        .decode(public_key.trim())
        .map_err(|e| format!("invalid public key encoding: {}", e))?
        .try_into()
        .map_err(|_| "invalid public key length".to_string())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| format!("invalid public key: {}", e))?;

    let sig_bytes = BASE64
        .decode(signature.trim())
        .map_err(|e| format!("invalid signature encoding: {}", e))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| format!("invalid signature: {}", e))?;

    key.verify(digest, &sig)
        .map_err(|_| "signature does not match package content".to_string())
}

/// Per-package-name trusted keys
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Key file location for a package name
    pub fn key_path(&self, package: &str) -> PathBuf {
        self.dir.join(format!("{}.pub", package))
    }

    /// Trusted base64 key for a package, `None` when no entry exists
    pub fn trusted_key(&self, package: &str) -> Result<Option<String>> {
        let path = self.key_path(package);
        if !path.exists() {
            return Ok(None);
        }
        load_public_key(&path).map(Some)
    }

    /// Register a key pair's public key as trusted for `package`
    pub fn trust(&self, package: &str, keypair: &SigningKeyPair) -> Result<()> {
        keypair.save_public_key(&self.key_path(package))
    }
}
