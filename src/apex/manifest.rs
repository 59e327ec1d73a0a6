// src/apex/manifest.rs

//! Package manifest (`apex_manifest.json`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// Name of the manifest entry inside a package container
pub const MANIFEST_ENTRY: &str = "apex_manifest.json";

/// Manifest embedded in every package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApexManifest {
    pub name: String,
    pub version: u64,
    /// Package content is a shared library consumed by other packages
    #[serde(default)]
    pub provide_shared_libs: bool,
    /// Library provider name -> provider version this package was built against
    #[serde(default)]
    pub require_shared_libs: BTreeMap<String, u64>,
    /// Payload-relative path of the pre-install hook script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_install_hook: Option<String>,
    /// Payload-relative path of the post-install hook script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install_hook: Option<String>,
}

impl ApexManifest {
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            provide_shared_libs: false,
            require_shared_libs: BTreeMap::new(),
            pre_install_hook: None,
            post_install_hook: None,
        }
    }

    /// Parse and validate manifest bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let manifest: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to the canonical on-disk form
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings, integers and maps cannot fail
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    /// Check the invariants every manifest must hold
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;
        for lib in self.require_shared_libs.keys() {
            validate_name(lib).map_err(|e| format!("required library: {}", e))?;
            if lib == &self.name {
                return Err(format!("{} requires itself as a shared library", self.name));
            }
        }
        for hook in [&self.pre_install_hook, &self.post_install_hook]
            .into_iter()
            .flatten()
        {
            validate_hook_path(hook)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("package name is empty".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("invalid package name: {}", name));
    }
    if name.starts_with('.') {
        return Err(format!("package name may not start with '.': {}", name));
    }
    Ok(())
}

fn validate_hook_path(hook: &str) -> Result<(), String> {
    let path = Path::new(hook);
    if hook.is_empty()
        || !path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(format!("hook path must stay inside the payload: {}", hook));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let manifest =
            ApexManifest::parse(br#"{"name": "com.example.foo", "version": 2}"#).unwrap();
        assert_eq!(manifest.name, "com.example.foo");
        assert_eq!(manifest.version, 2);
        assert!(!manifest.provide_shared_libs);
        assert!(manifest.require_shared_libs.is_empty());
    }

    #[test]
    fn test_parse_shared_libs() {
        let manifest = ApexManifest::parse(
            br#"{
                "name": "com.example.bar",
                "version": 1,
                "requireSharedLibs": {"com.example.sharedlibs": 1},
                "postInstallHook": "bin/postinstall.sh"
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.require_shared_libs["com.example.sharedlibs"], 1);
        assert_eq!(manifest.post_install_hook.as_deref(), Some("bin/postinstall.sh"));
    }

    #[test]
    fn test_ignores_unknown_fields() {
        let manifest =
            ApexManifest::parse(br#"{"name": "a", "version": 1, "futureField": true}"#).unwrap();
        assert_eq!(manifest.name, "a");
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(ApexManifest::parse(br#"{"name": "", "version": 1}"#).is_err());
        assert!(ApexManifest::parse(br#"{"name": "a@1", "version": 1}"#).is_err());
        assert!(ApexManifest::parse(br#"{"name": "../etc", "version": 1}"#).is_err());
    }

    #[test]
    fn test_rejects_escaping_hook() {
        let mut manifest = ApexManifest::new("a", 1);
        manifest.pre_install_hook = Some("../../bin/sh".to_string());
        assert!(manifest.validate().is_err());
        manifest.pre_install_hook = Some("/bin/sh".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_rejects_self_requirement() {
        let mut manifest = ApexManifest::new("a", 1);
        manifest.require_shared_libs.insert("a".to_string(), 1);
        assert!(manifest.validate().is_err());
    }
}
